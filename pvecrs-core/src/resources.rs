//! HA resource reconciliation.
//!
//! Every eligible VM gets exactly one HA resource, grouped by its storage
//! topology. Once a resource exists the HA manager owns its state; the
//! only state the scheduler corrects here is `disabled`, which Proxmox
//! latches after repeated faults and which would otherwise keep the VM
//! down forever.

use tracing::{debug, info, warn};

use crate::config::{
    GROUP_PREFIX, HA_MAX_RELOCATE, HA_MAX_RESTART, HA_RESOURCE_TYPE, HA_STATE_DISABLED,
    HA_STATE_STARTED, MANAGED_COMMENT, RESOURCE_TYPE_VM,
};
use crate::error::CrsResult;
use crate::naming::{has_skip_tag, pin_group_name, vm_sid};
use crate::placement::{classify, shared_storage_map, target_group, target_state};
use crate::proxmox::types::HaResource;
use crate::reconciler::Reconciler;

impl Reconciler {
    /// Deletes HA resources of VMs that have been opted out via the skip
    /// tag. Only controller-owned groups are touched.
    pub async fn evict_skip_tagged(&self) -> CrsResult<()> {
        let resources = self.api.cluster_resources().await?;
        let mut ha_resources = self.api.ha_resources().await?;
        ha_resources.sort_by(|a, b| a.sid.cmp(&b.sid));

        for ha_resource in &ha_resources {
            if !ha_resource.group.starts_with(GROUP_PREFIX) {
                continue;
            }

            let tags = resources
                .iter()
                .find(|r| r.kind == RESOURCE_TYPE_VM && vm_sid(r.vmid) == ha_resource.sid)
                .map(|r| r.tags.as_str())
                .unwrap_or("");

            if has_skip_tag(tags) {
                info!(
                    "removing skip-tagged HA resource {} from group {}",
                    ha_resource.sid, ha_resource.group
                );
                self.api.delete_ha_resource(&ha_resource.sid).await?;
                self.rate_limit_sleep().await;
            }
        }

        Ok(())
    }

    /// Creates HA resources for VMs that lack one and re-enables
    /// resources the HA manager disabled.
    pub async fn setup_vm_resources(&self) -> CrsResult<()> {
        let ha_resources = self.api.ha_resources().await?;
        let storages = self.api.storages().await?;
        let shared_map = shared_storage_map(&storages);
        let nodes = self.sorted_nodes().await?;

        for node in &nodes {
            let mut vms = self.api.node_vms(&node.node).await?;
            vms.sort_by_key(|vm| vm.vmid);

            for vm in &vms {
                if vm.is_template() {
                    debug!("skipping template VM {} ({})", vm.vmid, vm.name);
                    continue;
                }
                if has_skip_tag(&vm.tags) {
                    debug!("skipping VM {} ({}) with skip tag", vm.vmid, vm.name);
                    continue;
                }

                let sid = vm_sid(vm.vmid);
                if let Some(existing) = ha_resources.iter().find(|r| r.sid == sid) {
                    if existing.state == HA_STATE_DISABLED {
                        // Disabled resources keep the VM stopped; bring it back.
                        info!(
                            "re-enabling disabled HA resource {sid} ({}) to started",
                            vm.name
                        );
                        let mut updated = existing.clone();
                        updated.state = HA_STATE_STARTED.to_string();
                        self.api.update_ha_resource(&updated).await?;
                        self.rate_limit_sleep().await;
                    }
                    continue;
                }

                let group = match self.api.vm_config(&node.node, vm.vmid).await {
                    Ok(config) => {
                        target_group(classify(vm.vmid, &config, &shared_map), &node.node)
                    }
                    Err(e) => {
                        warn!(
                            "failed to classify VM {} ({}), falling back to pin group: {e}",
                            vm.vmid, vm.name
                        );
                        pin_group_name(&node.node)
                    }
                };

                let resource = HaResource {
                    sid: sid.clone(),
                    state: target_state(&vm.status).to_string(),
                    requested_state: String::new(),
                    group,
                    max_relocate: HA_MAX_RELOCATE,
                    max_restart: HA_MAX_RESTART,
                    comment: MANAGED_COMMENT.to_string(),
                    kind: HA_RESOURCE_TYPE.to_string(),
                };

                self.api.create_ha_resource(&resource).await?;
                info!(
                    "created HA resource {sid} ({}) in group {} with state {}",
                    vm.name, resource.group, resource.state
                );
                self.rate_limit_sleep().await;
            }
        }

        Ok(())
    }
}
