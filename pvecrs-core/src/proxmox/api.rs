//! Operation surface of the Proxmox API.
//!
//! [`PveApi`] is the seam between the reconciliation engine and the
//! cluster: the engine only ever talks to this trait. Production uses
//! [`PveClient`]; tests inject an in-memory fake that records mutations.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::client::PveClient;
use super::types::{
    ClusterOptions, ClusterResource, HaGroup, HaResource, MigrationOptions, Node, Storage, Vm,
    VmConfig, VmConfigUpdate,
};
use crate::error::CrsResult;

#[async_trait]
pub trait PveApi: Send + Sync {
    async fn nodes(&self) -> CrsResult<Vec<Node>>;
    async fn node_vms(&self, node: &str) -> CrsResult<Vec<Vm>>;

    async fn vm_config(&self, node: &str, vmid: u32) -> CrsResult<VmConfig>;
    async fn update_vm_config(
        &self,
        node: &str,
        vmid: u32,
        update: &VmConfigUpdate,
    ) -> CrsResult<()>;
    /// Starts a migration; returns the task identifier.
    async fn migrate_vm(
        &self,
        node: &str,
        vmid: u32,
        options: &MigrationOptions,
    ) -> CrsResult<String>;

    async fn storages(&self) -> CrsResult<Vec<Storage>>;
    async fn cluster_resources(&self) -> CrsResult<Vec<ClusterResource>>;

    async fn ha_groups(&self) -> CrsResult<Vec<HaGroup>>;
    async fn create_ha_group(&self, group: &HaGroup) -> CrsResult<()>;
    async fn update_ha_group(&self, group: &HaGroup) -> CrsResult<()>;
    async fn delete_ha_group(&self, group: &str) -> CrsResult<()>;

    async fn ha_resources(&self) -> CrsResult<Vec<HaResource>>;
    async fn create_ha_resource(&self, resource: &HaResource) -> CrsResult<()>;
    async fn update_ha_resource(&self, resource: &HaResource) -> CrsResult<()>;
    async fn delete_ha_resource(&self, sid: &str) -> CrsResult<()>;

    async fn cluster_options(&self) -> CrsResult<ClusterOptions>;
    async fn update_cluster_options(&self, options: &ClusterOptions) -> CrsResult<()>;
}

fn ha_group_form(group: &HaGroup, include_name: bool) -> Vec<(String, String)> {
    let mut form = Vec::new();
    if include_name {
        form.push(("group".to_string(), group.group.clone()));
    }
    form.push(("nodes".to_string(), group.nodes.clone()));
    if group.restricted > 0 {
        form.push(("restricted".to_string(), group.restricted.to_string()));
    }
    if group.nofailback > 0 {
        form.push(("nofailback".to_string(), group.nofailback.to_string()));
    }
    form
}

fn ha_resource_form(resource: &HaResource, include_sid: bool) -> Vec<(String, String)> {
    let mut form = Vec::new();
    if include_sid {
        form.push(("sid".to_string(), resource.sid.clone()));
        if !resource.kind.is_empty() {
            form.push(("type".to_string(), resource.kind.clone()));
        }
    }
    if !resource.group.is_empty() {
        form.push(("group".to_string(), resource.group.clone()));
    }
    if resource.max_relocate > 0 {
        form.push(("max_relocate".to_string(), resource.max_relocate.to_string()));
    }
    if resource.max_restart > 0 {
        form.push(("max_restart".to_string(), resource.max_restart.to_string()));
    }
    if !resource.state.is_empty() {
        form.push(("state".to_string(), resource.state.clone()));
    }
    if !resource.comment.is_empty() {
        form.push(("comment".to_string(), resource.comment.clone()));
    }
    form
}

#[async_trait]
impl PveApi for PveClient {
    async fn nodes(&self) -> CrsResult<Vec<Node>> {
        let nodes: Vec<Node> = self.get_json("nodes").await?;
        debug!("retrieved {} nodes", nodes.len());
        Ok(nodes)
    }

    async fn node_vms(&self, node: &str) -> CrsResult<Vec<Vm>> {
        let vms: Vec<Vm> = self.get_json(&format!("nodes/{node}/qemu")).await?;
        debug!("retrieved {} VMs on node {node}", vms.len());
        Ok(vms)
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> CrsResult<VmConfig> {
        self.get_json(&format!("nodes/{node}/qemu/{vmid}/config"))
            .await
    }

    async fn update_vm_config(
        &self,
        node: &str,
        vmid: u32,
        update: &VmConfigUpdate,
    ) -> CrsResult<()> {
        let _: Option<Value> = self
            .put_form(&format!("nodes/{node}/qemu/{vmid}/config"), &update.to_form())
            .await?;
        info!("updated config of VM {vmid} on node {node}");
        Ok(())
    }

    async fn migrate_vm(
        &self,
        node: &str,
        vmid: u32,
        options: &MigrationOptions,
    ) -> CrsResult<String> {
        let mut form = vec![("target".to_string(), options.target.clone())];
        if options.online {
            form.push(("online".to_string(), "1".to_string()));
        }
        if options.with_local_disks {
            form.push(("with-local-disks".to_string(), "1".to_string()));
        }
        let task: Option<String> = self
            .post_form(&format!("nodes/{node}/qemu/{vmid}/migrate"), &form)
            .await?;
        let task = task.unwrap_or_default();
        info!(
            "migrating VM {vmid} from node {node} to {}, task {task}",
            options.target
        );
        Ok(task)
    }

    async fn storages(&self) -> CrsResult<Vec<Storage>> {
        let storages: Vec<Storage> = self.get_json("storage").await?;
        debug!("retrieved {} storage entries", storages.len());
        Ok(storages)
    }

    async fn cluster_resources(&self) -> CrsResult<Vec<ClusterResource>> {
        let resources: Vec<ClusterResource> = self.get_json("cluster/resources").await?;
        debug!("retrieved {} cluster resources", resources.len());
        Ok(resources)
    }

    async fn ha_groups(&self) -> CrsResult<Vec<HaGroup>> {
        let groups: Vec<HaGroup> = self.get_json("cluster/ha/groups").await?;
        debug!("retrieved {} HA groups", groups.len());
        Ok(groups)
    }

    async fn create_ha_group(&self, group: &HaGroup) -> CrsResult<()> {
        let _: Option<Value> = self
            .post_form("cluster/ha/groups", &ha_group_form(group, true))
            .await?;
        info!("created HA group {}", group.group);
        Ok(())
    }

    async fn update_ha_group(&self, group: &HaGroup) -> CrsResult<()> {
        let _: Option<Value> = self
            .put_form(
                &format!("cluster/ha/groups/{}", group.group),
                &ha_group_form(group, false),
            )
            .await?;
        info!("updated HA group {}", group.group);
        Ok(())
    }

    async fn delete_ha_group(&self, group: &str) -> CrsResult<()> {
        let _: Option<Value> = self.delete(&format!("cluster/ha/groups/{group}")).await?;
        info!("deleted HA group {group}");
        Ok(())
    }

    async fn ha_resources(&self) -> CrsResult<Vec<HaResource>> {
        let resources: Vec<HaResource> = self.get_json("cluster/ha/resources").await?;
        debug!("retrieved {} HA resources", resources.len());
        Ok(resources)
    }

    async fn create_ha_resource(&self, resource: &HaResource) -> CrsResult<()> {
        let _: Option<Value> = self
            .post_form("cluster/ha/resources", &ha_resource_form(resource, true))
            .await?;
        info!("created HA resource {}", resource.sid);
        Ok(())
    }

    async fn update_ha_resource(&self, resource: &HaResource) -> CrsResult<()> {
        let _: Option<Value> = self
            .put_form(
                &format!("cluster/ha/resources/{}", resource.sid),
                &ha_resource_form(resource, false),
            )
            .await?;
        info!("updated HA resource {}", resource.sid);
        Ok(())
    }

    async fn delete_ha_resource(&self, sid: &str) -> CrsResult<()> {
        let _: Option<Value> = self.delete(&format!("cluster/ha/resources/{sid}")).await?;
        info!("deleted HA resource {sid}");
        Ok(())
    }

    async fn cluster_options(&self) -> CrsResult<ClusterOptions> {
        self.get_json("cluster/options").await
    }

    async fn update_cluster_options(&self, options: &ClusterOptions) -> CrsResult<()> {
        let form = vec![(
            "registered-tags".to_string(),
            options.registered_tags.join(";"),
        )];
        let _: Option<Value> = self.put_form("cluster/options", &form).await?;
        info!("updated cluster options");
        Ok(())
    }
}
