//! Per-VM configuration maintenance.
//!
//! Two sweeps: critical VMs get first place in the boot order, and VMs
//! that have been up for over a day lose CD-ROMs backed by local storage
//! (a leftover installer ISO pins an otherwise floating VM to one node).
//! After a detachment the VM's HA group is re-evaluated, since the
//! local-storage constraint may just have disappeared.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use crate::config::{CRITICAL_STARTUP_ORDER, LONG_RUNNING_UPTIME_SECS, RESOURCE_TYPE_VM, VM_STATUS_RUNNING};
use crate::error::CrsResult;
use crate::naming::{has_critical_tag, has_skip_tag, vm_sid};
use crate::placement::{classify, is_cdrom_entry, shared_storage_map, storage_of_disk, target_group};
use crate::proxmox::types::VmConfigUpdate;
use crate::reconciler::Reconciler;

impl Reconciler {
    /// Runs both metadata sweeps over the cluster inventory. Per-VM
    /// failures are logged and skipped; the next tick retries.
    pub async fn update_vm_metadata(&self) -> CrsResult<()> {
        let mut resources = self.api.cluster_resources().await?;
        resources.sort_by_key(|r| r.vmid);

        let mut critical_vms = Vec::new();
        let mut long_running_vms = Vec::new();

        for resource in &resources {
            if resource.kind != RESOURCE_TYPE_VM {
                continue;
            }
            if has_skip_tag(&resource.tags) {
                debug!(
                    "skipping VM {} ({}) with skip tag for metadata updates",
                    resource.vmid, resource.name
                );
                continue;
            }

            if has_critical_tag(&resource.tags) {
                critical_vms.push(resource.clone());
            }
            if resource.status == VM_STATUS_RUNNING && resource.uptime > LONG_RUNNING_UPTIME_SECS {
                long_running_vms.push(resource.clone());
            }
        }

        let storages = self.api.storages().await?;
        let shared_map = shared_storage_map(&storages);

        for vm in &critical_vms {
            if self.enforce_critical_startup(&vm.node, vm.vmid).await {
                self.rate_limit_sleep().await;
            }
        }

        for vm in &long_running_vms {
            if self.detach_local_cdroms(&vm.node, vm.vmid, &shared_map).await {
                self.rate_limit_sleep().await;
            }
        }

        Ok(())
    }

    /// Sets `startup=order=1` on a critical VM when not already exact.
    /// Returns whether the config was modified.
    async fn enforce_critical_startup(&self, node: &str, vmid: u32) -> bool {
        let config = match self.api.vm_config(node, vmid).await {
            Ok(config) => config,
            Err(e) => {
                error!("failed to read config of critical VM {vmid}: {e}");
                return false;
            }
        };

        if config.startup.as_deref() == Some(CRITICAL_STARTUP_ORDER) {
            debug!("critical VM {vmid} already has startup {CRITICAL_STARTUP_ORDER}");
            return false;
        }

        info!(
            "updating critical VM {vmid} startup order from {:?} to {CRITICAL_STARTUP_ORDER:?}",
            config.startup.as_deref().unwrap_or("")
        );

        let update = VmConfigUpdate {
            startup: Some(CRITICAL_STARTUP_ORDER.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.api.update_vm_config(node, vmid, &update).await {
            error!("failed to update startup order of VM {vmid}: {e}");
            return false;
        }
        true
    }

    /// Clears CD-ROM slots backed by non-shared storage on a long-running
    /// VM, then re-evaluates its HA group. Returns whether anything was
    /// detached.
    async fn detach_local_cdroms(
        &self,
        node: &str,
        vmid: u32,
        shared_map: &HashMap<String, bool>,
    ) -> bool {
        let config = match self.api.vm_config(node, vmid).await {
            Ok(config) => config,
            Err(e) => {
                error!("failed to read config of VM {vmid}: {e}");
                return false;
            }
        };

        let mut to_detach = Vec::new();
        for (slot, value) in &config.disks {
            if !is_cdrom_entry(slot, value) {
                continue;
            }
            let storage = match storage_of_disk(value) {
                Some(storage) => storage,
                None => continue,
            };
            match shared_map.get(storage) {
                Some(false) => {
                    info!(
                        "CD-ROM {slot} of VM {vmid} is on non-shared storage {storage}, detaching"
                    );
                    to_detach.push(slot.clone());
                }
                Some(true) => {
                    debug!("CD-ROM {slot} of VM {vmid} is on shared storage {storage}, keeping");
                }
                None => {
                    warn!("storage {storage} of VM {vmid} CD-ROM {slot} not in cluster storage list");
                }
            }
        }

        if to_detach.is_empty() {
            return false;
        }

        let mut update = VmConfigUpdate::default();
        for slot in &to_detach {
            update.disks.insert(slot.clone(), String::new());
        }
        if let Err(e) = self.api.update_vm_config(node, vmid, &update).await {
            error!("failed to detach CD-ROMs from VM {vmid}: {e}");
            return false;
        }
        info!("detached {} CD-ROM slot(s) from VM {vmid}", to_detach.len());

        if let Err(e) = self.reevaluate_vm_group(node, vmid, shared_map).await {
            // The detachment itself succeeded; the group catches up on a
            // later tick.
            error!("failed to re-evaluate HA group of VM {vmid}: {e}");
        }

        true
    }

    /// Moves a VM's HA resource to the group its current storage
    /// topology calls for.
    async fn reevaluate_vm_group(
        &self,
        node: &str,
        vmid: u32,
        shared_map: &HashMap<String, bool>,
    ) -> CrsResult<()> {
        let ha_resources = self.api.ha_resources().await?;
        let sid = vm_sid(vmid);
        let current = match ha_resources.iter().find(|r| r.sid == sid) {
            Some(resource) => resource,
            None => {
                debug!("VM {vmid} has no HA resource, skipping group re-evaluation");
                return Ok(());
            }
        };

        let config = self.api.vm_config(node, vmid).await?;
        let new_group = target_group(classify(vmid, &config, shared_map), node);

        if current.group == new_group {
            debug!("HA group {} of VM {vmid} is still appropriate", current.group);
            return Ok(());
        }

        info!(
            "moving HA resource {sid} from group {} to {new_group}",
            current.group
        );
        let mut updated = current.clone();
        updated.group = new_group;
        self.api.update_ha_resource(&updated).await?;
        Ok(())
    }
}
