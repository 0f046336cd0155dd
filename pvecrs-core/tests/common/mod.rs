//! In-memory fake of the Proxmox API for integration tests.
//!
//! The fake keeps a mutable cluster model and records every mutating
//! call in order, so tests can assert the exact sequence a tick issues.
//! Writes are applied to the model: HA state changes take effect
//! immediately (as if the HA manager reacted instantly), which makes a
//! second tick observe the converged cluster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use pvecrs_core::consul::{Coordinator, LockHandle};
use pvecrs_core::error::{CrsError, CrsResult};
use pvecrs_core::proxmox::types::{
    ClusterOptions, ClusterResource, HaGroup, HaResource, MigrationOptions, Node, Storage, Vm,
    VmConfig, VmConfigUpdate,
};
use pvecrs_core::proxmox::PveApi;
use pvecrs_core::{ControllerConfig, Reconciler};

#[derive(Default)]
pub struct FakeCluster {
    pub nodes: Vec<Node>,
    /// VMs per node name.
    pub vms: BTreeMap<String, Vec<Vm>>,
    pub storages: Vec<Storage>,
    pub ha_groups: Vec<HaGroup>,
    pub ha_resources: Vec<HaResource>,
    pub options: ClusterOptions,
    pub vm_configs: BTreeMap<u32, VmConfig>,
    /// HA state per VM as `/cluster/resources` reports it.
    pub vm_ha_states: BTreeMap<u32, String>,
    /// HA state per node (`maintenance` drives the drain).
    pub node_ha_states: BTreeMap<String, String>,
    /// Reject `PUT /cluster/options` like an old cluster would.
    pub reject_options_update: bool,
    /// Fail `GET /cluster/ha/groups`, aborting any phase that reads it.
    pub fail_ha_groups: bool,
    /// Keep VM HA states frozen; recovery polls then time out.
    pub freeze_vm_ha_states: bool,
}

pub struct FakePve {
    pub state: Mutex<FakeCluster>,
    pub calls: Mutex<Vec<String>>,
}

impl FakePve {
    pub fn new(state: FakeCluster) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn sid_vmid(sid: &str) -> Option<u32> {
    sid.strip_prefix("vm:").and_then(|id| id.parse().ok())
}

#[async_trait]
impl PveApi for FakePve {
    async fn nodes(&self) -> CrsResult<Vec<Node>> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn node_vms(&self, node: &str) -> CrsResult<Vec<Vm>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .vms
            .get(node)
            .cloned()
            .unwrap_or_default())
    }

    async fn vm_config(&self, _node: &str, vmid: u32) -> CrsResult<VmConfig> {
        self.state
            .lock()
            .unwrap()
            .vm_configs
            .get(&vmid)
            .cloned()
            .ok_or_else(|| CrsError::Api {
                status: 500,
                message: format!("no config for VM {vmid}"),
            })
    }

    async fn update_vm_config(
        &self,
        node: &str,
        vmid: u32,
        update: &VmConfigUpdate,
    ) -> CrsResult<()> {
        let mut parts = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let config = state.vm_configs.entry(vmid).or_default();
            if let Some(startup) = &update.startup {
                config.startup = Some(startup.clone());
                parts.push(format!("startup={startup}"));
            }
            for (slot, value) in &update.disks {
                if value.is_empty() {
                    config.disks.remove(slot);
                } else {
                    config.disks.insert(slot.clone(), value.clone());
                }
                parts.push(format!("{slot}={value}"));
            }
        }
        self.record(format!(
            "PUT /nodes/{node}/qemu/{vmid}/config {}",
            parts.join(",")
        ));
        Ok(())
    }

    async fn migrate_vm(
        &self,
        node: &str,
        vmid: u32,
        options: &MigrationOptions,
    ) -> CrsResult<String> {
        {
            let mut state = self.state.lock().unwrap();
            let vm = state
                .vms
                .get_mut(node)
                .and_then(|vms| {
                    vms.iter()
                        .position(|vm| vm.vmid == vmid)
                        .map(|i| vms.remove(i))
                });
            if let Some(vm) = vm {
                state.vms.entry(options.target.clone()).or_default().push(vm);
            }
        }
        self.record(format!(
            "POST /nodes/{node}/qemu/{vmid}/migrate target={}",
            options.target
        ));
        Ok(format!("UPID:{node}:{vmid}"))
    }

    async fn storages(&self) -> CrsResult<Vec<Storage>> {
        Ok(self.state.lock().unwrap().storages.clone())
    }

    async fn cluster_resources(&self) -> CrsResult<Vec<ClusterResource>> {
        let state = self.state.lock().unwrap();
        let mut resources = Vec::new();

        for node in &state.nodes {
            resources.push(ClusterResource {
                kind: "node".to_string(),
                id: format!("node/{}", node.node),
                node: node.node.clone(),
                vmid: 0,
                name: node.node.clone(),
                status: node.status.clone(),
                template: 0,
                tags: String::new(),
                uptime: node.uptime,
                hastate: state.node_ha_states.get(&node.node).cloned(),
            });
        }

        for (node, vms) in &state.vms {
            for vm in vms {
                resources.push(ClusterResource {
                    kind: "qemu".to_string(),
                    id: format!("qemu/{}", vm.vmid),
                    node: node.clone(),
                    vmid: vm.vmid,
                    name: vm.name.clone(),
                    status: vm.status.clone(),
                    template: vm.template,
                    tags: vm.tags.clone(),
                    uptime: vm.uptime,
                    hastate: state.vm_ha_states.get(&vm.vmid).cloned(),
                });
            }
        }

        Ok(resources)
    }

    async fn ha_groups(&self) -> CrsResult<Vec<HaGroup>> {
        let state = self.state.lock().unwrap();
        if state.fail_ha_groups {
            return Err(CrsError::Api {
                status: 500,
                message: "ha groups unavailable".to_string(),
            });
        }
        Ok(state.ha_groups.clone())
    }

    async fn create_ha_group(&self, group: &HaGroup) -> CrsResult<()> {
        self.state.lock().unwrap().ha_groups.push(group.clone());
        self.record(format!(
            "POST /cluster/ha/groups {} nodes={}",
            group.group, group.nodes
        ));
        Ok(())
    }

    async fn update_ha_group(&self, group: &HaGroup) -> CrsResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.ha_groups.iter_mut().find(|g| g.group == group.group) {
                existing.nodes = group.nodes.clone();
                existing.restricted = group.restricted;
                existing.nofailback = group.nofailback;
            }
        }
        self.record(format!(
            "PUT /cluster/ha/groups/{} nodes={}",
            group.group, group.nodes
        ));
        Ok(())
    }

    async fn delete_ha_group(&self, group: &str) -> CrsResult<()> {
        self.state
            .lock()
            .unwrap()
            .ha_groups
            .retain(|g| g.group != group);
        self.record(format!("DELETE /cluster/ha/groups/{group}"));
        Ok(())
    }

    async fn ha_resources(&self) -> CrsResult<Vec<HaResource>> {
        Ok(self.state.lock().unwrap().ha_resources.clone())
    }

    async fn create_ha_resource(&self, resource: &HaResource) -> CrsResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let mut created = resource.clone();
            created.requested_state = resource.state.clone();
            state.ha_resources.push(created);
            if let Some(vmid) = sid_vmid(&resource.sid) {
                if !state.freeze_vm_ha_states {
                    state.vm_ha_states.insert(vmid, resource.state.clone());
                }
            }
        }
        self.record(format!(
            "POST /cluster/ha/resources {} group={} state={}",
            resource.sid, resource.group, resource.state
        ));
        Ok(())
    }

    async fn update_ha_resource(&self, resource: &HaResource) -> CrsResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let freeze = state.freeze_vm_ha_states;
            if let Some(existing) = state
                .ha_resources
                .iter_mut()
                .find(|r| r.sid == resource.sid)
            {
                if !resource.state.is_empty() {
                    existing.state = resource.state.clone();
                    existing.requested_state = resource.state.clone();
                }
                if !resource.group.is_empty() {
                    existing.group = resource.group.clone();
                }
            }
            if !resource.state.is_empty() && !freeze {
                if let Some(vmid) = sid_vmid(&resource.sid) {
                    state.vm_ha_states.insert(vmid, resource.state.clone());
                }
            }
        }
        self.record(format!(
            "PUT /cluster/ha/resources/{} group={} state={}",
            resource.sid, resource.group, resource.state
        ));
        Ok(())
    }

    async fn delete_ha_resource(&self, sid: &str) -> CrsResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.ha_resources.retain(|r| r.sid != sid);
            if let Some(vmid) = sid_vmid(sid) {
                state.vm_ha_states.remove(&vmid);
            }
        }
        self.record(format!("DELETE /cluster/ha/resources/{sid}"));
        Ok(())
    }

    async fn cluster_options(&self) -> CrsResult<ClusterOptions> {
        Ok(self.state.lock().unwrap().options.clone())
    }

    async fn update_cluster_options(&self, options: &ClusterOptions) -> CrsResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.reject_options_update {
                return Err(CrsError::Api {
                    status: 403,
                    message: "permission denied".to_string(),
                });
            }
            state.options = options.clone();
        }
        self.record(format!(
            "PUT /cluster/options registered-tags={}",
            options.registered_tags.join(";")
        ));
        Ok(())
    }
}

/// Coordinator stub for driver tests.
pub struct FakeCoordinator {
    pub lockable: bool,
    pub acquires: Mutex<u32>,
    pub releases: Mutex<u32>,
}

impl FakeCoordinator {
    pub fn new(lockable: bool) -> Arc<Self> {
        Arc::new(Self {
            lockable,
            acquires: Mutex::new(0),
            releases: Mutex::new(0),
        })
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn pve_endpoints(&self) -> CrsResult<Vec<String>> {
        Ok(vec!["https://pve1.example.com:8006".to_string()])
    }

    async fn pve_auth_token(&self) -> CrsResult<String> {
        Ok("crs@pve!scheduler=secret".to_string())
    }

    async fn acquire_lock(&self, key: &str) -> CrsResult<Option<LockHandle>> {
        *self.acquires.lock().unwrap() += 1;
        if self.lockable {
            Ok(Some(LockHandle::new(key, "session-1")))
        } else {
            Ok(None)
        }
    }

    async fn release_lock(&self, _handle: LockHandle) -> CrsResult<()> {
        *self.releases.lock().unwrap() += 1;
        Ok(())
    }
}

// Fixture builders.

pub fn node(name: &str) -> Node {
    Node {
        node: name.to_string(),
        status: "online".to_string(),
        uptime: 3600,
    }
}

pub fn vm(vmid: u32, name: &str, status: &str) -> Vm {
    Vm {
        vmid,
        name: name.to_string(),
        status: status.to_string(),
        template: 0,
        tags: String::new(),
        uptime: 0,
    }
}

pub fn template(vmid: u32, name: &str) -> Vm {
    Vm {
        template: 1,
        status: "stopped".to_string(),
        ..vm(vmid, name, "stopped")
    }
}

pub fn storage(name: &str, shared: u8, content: &str) -> Storage {
    let json = format!(
        r#"{{"storage": "{name}", "shared": {shared}, "content": "{content}"}}"#
    );
    serde_json::from_str(&json).unwrap()
}

pub fn ha_group(name: &str, nodes: &str) -> HaGroup {
    let json = format!(
        r#"{{"group": "{name}", "nodes": "{nodes}", "restricted": 1, "nofailback": 1}}"#
    );
    serde_json::from_str(&json).unwrap()
}

pub fn ha_resource(sid: &str, group: &str, state: &str) -> HaResource {
    let json = format!(
        r#"{{"sid": "{sid}", "group": "{group}", "state": "{state}", "request": "{state}",
             "max_relocate": 10, "max_restart": 10, "comment": "crs-managed", "type": "vm"}}"#
    );
    serde_json::from_str(&json).unwrap()
}

pub fn vm_config(disks: &[(&str, &str)]) -> VmConfig {
    let mut entries = Vec::new();
    for (slot, value) in disks {
        entries.push(format!(r#""{slot}": "{value}""#));
    }
    serde_json::from_str(&format!("{{{}}}", entries.join(","))).unwrap()
}

/// Registered tags that keep the tag-registration phase quiet.
pub fn registered_tags() -> ClusterOptions {
    serde_json::from_str(r#"{"registered-tags": ["crs-skip", "crs-critical"]}"#).unwrap()
}

pub fn reconciler_for(api: Arc<FakePve>) -> Reconciler {
    Reconciler::new(api, ControllerConfig::for_testing())
}
