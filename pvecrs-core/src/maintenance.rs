//! Maintenance drain.
//!
//! Nodes report `maintenance` through their HA state in the cluster
//! inventory. Running VMs are left to the HA manager; what would
//! otherwise be stranded are stopped VMs that could float (prefer group)
//! and templates whose disks all live on shared storage. Those are
//! migrated off, offline, to an online node chosen by `vmid mod N`.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use crate::config::{HA_STATE_MAINTENANCE, RESOURCE_TYPE_NODE, VM_STATUS_RUNNING};
use crate::error::CrsResult;
use crate::naming::{has_skip_tag, vm_sid};
use crate::placement::{all_disks_shared, shared_storage_map};
use crate::proxmox::types::{HaResource, MigrationOptions, Vm};
use crate::reconciler::Reconciler;

impl Reconciler {
    /// Migrates eligible workloads off nodes in maintenance mode.
    /// Per-VM migration failures are logged; the drain never aborts the
    /// tick.
    pub async fn drain_maintenance_nodes(&self) -> CrsResult<()> {
        let resources = self.api.cluster_resources().await?;

        let mut online_nodes = Vec::new();
        let mut maintenance_nodes = Vec::new();

        for resource in &resources {
            if resource.kind != RESOURCE_TYPE_NODE {
                continue;
            }
            if resource.ha_state() == HA_STATE_MAINTENANCE {
                debug!("node {} is in maintenance mode", resource.node);
                maintenance_nodes.push(resource.node.clone());
            } else if resource.status == "online" {
                online_nodes.push(resource.node.clone());
            } else {
                debug!(
                    "node {} has status {} and HA state {:?}, not considered for drain",
                    resource.node,
                    resource.status,
                    resource.ha_state()
                );
            }
        }

        if maintenance_nodes.is_empty() {
            debug!("no nodes in maintenance mode");
            return Ok(());
        }
        if online_nodes.is_empty() {
            warn!("no online nodes available to receive drained workloads");
            return Ok(());
        }

        online_nodes.sort_unstable();
        maintenance_nodes.sort_unstable();

        let ha_resources = self.api.ha_resources().await?;
        let storages = self.api.storages().await?;
        let shared_map = shared_storage_map(&storages);

        let mut migrated = 0usize;
        for node in &maintenance_nodes {
            match self
                .drain_node(node, &online_nodes, &ha_resources, &shared_map)
                .await
            {
                Ok(count) => migrated += count,
                Err(e) => {
                    error!("failed to drain maintenance node {node}: {e}");
                    continue;
                }
            }
        }

        if migrated > 0 {
            info!("migrated {migrated} workloads off maintenance nodes");
        }
        Ok(())
    }

    async fn drain_node(
        &self,
        node: &str,
        online_nodes: &[String],
        ha_resources: &[HaResource],
        shared_map: &HashMap<String, bool>,
    ) -> CrsResult<usize> {
        let mut vms = self.api.node_vms(node).await?;
        vms.sort_by_key(|vm| vm.vmid);

        let mut migrated = 0usize;
        for vm in &vms {
            if has_skip_tag(&vm.tags) {
                debug!(
                    "skipping VM {} ({}) with skip tag on maintenance node {node}",
                    vm.vmid, vm.name
                );
                continue;
            }

            let resource = ha_resources.iter().find(|r| r.sid == vm_sid(vm.vmid));
            if !self.should_drain(vm, resource, node, shared_map).await {
                continue;
            }

            let target = &online_nodes[vm.vmid as usize % online_nodes.len()];
            let options = MigrationOptions {
                target: target.clone(),
                online: false,
                with_local_disks: true,
            };

            match self.api.migrate_vm(node, vm.vmid, &options).await {
                Ok(_) => {
                    info!(
                        "migrated VM {} ({}) from maintenance node {node} to {target}",
                        vm.vmid, vm.name
                    );
                    migrated += 1;
                    self.rate_limit_sleep().await;
                }
                Err(e) => {
                    error!(
                        "failed to migrate VM {} ({}) from {node} to {target}: {e}",
                        vm.vmid, vm.name
                    );
                    continue;
                }
            }
        }

        Ok(migrated)
    }

    /// Drain eligibility per VM kind.
    async fn should_drain(
        &self,
        vm: &Vm,
        resource: Option<&HaResource>,
        node: &str,
        shared_map: &HashMap<String, bool>,
    ) -> bool {
        // Templates move when nothing ties them to local storage.
        if vm.is_template() {
            return match self.api.vm_config(node, vm.vmid).await {
                Ok(config) => all_disks_shared(vm.vmid, &config.disks, shared_map),
                Err(e) => {
                    warn!(
                        "failed to read config of template {} to check storage: {e}",
                        vm.vmid
                    );
                    false
                }
            };
        }

        // The HA manager moves running workloads itself.
        if vm.status == VM_STATUS_RUNNING {
            debug!("VM {} ({}) is running, leaving it to HA", vm.vmid, vm.name);
            return false;
        }

        match resource {
            Some(r) if r.group.contains("crs-vm-prefer") => {
                debug!(
                    "VM {} ({}) is stopped and in prefer group {}, draining",
                    vm.vmid, vm.name, r.group
                );
                true
            }
            Some(r) => {
                debug!(
                    "VM {} ({}) is in group {}, staying put",
                    vm.vmid, vm.name, r.group
                );
                false
            }
            None => {
                debug!("VM {} ({}) has no HA resource, not draining", vm.vmid, vm.name);
                false
            }
        }
    }
}
