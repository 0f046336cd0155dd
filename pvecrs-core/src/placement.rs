//! Storage-driven placement decisions.
//!
//! A VM is either pinned to its node or allowed to prefer it with
//! failover. Pinning is forced by hardware passthrough or by any disk on
//! non-shared storage; a VM whose disks all live on shared storage may
//! float.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::config::{
    HA_STATE_IGNORED, HA_STATE_STARTED, HA_STATE_STOPPED, VM_STATUS_RUNNING, VM_STATUS_STOPPED,
};
use crate::naming::{pin_group_name, prefer_group_name};
use crate::proxmox::types::{Storage, VmConfig};

// Slot keys only: `scsi0` is a disk, `scsihw` is a controller knob.
static DISK_SLOT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(virtio|sata|scsi|ide)\d+$").expect("disk slot regex"));
static HOSTPCI_SLOT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^hostpci\d+$").expect("hostpci slot regex"));

/// Whether a config key names a storage slot.
pub fn is_disk_slot(key: &str) -> bool {
    DISK_SLOT_RE.is_match(key)
}

/// Whether a config key names a PCI passthrough slot.
pub fn is_hostpci_slot(key: &str) -> bool {
    HOSTPCI_SLOT_RE.is_match(key)
}

/// Whether a disk slot holds a CD-ROM: explicit `media=cdrom` or an ISO
/// image.
pub fn is_cdrom_entry(key: &str, value: &str) -> bool {
    is_disk_slot(key) && (value.contains("media=cdrom") || value.contains(".iso"))
}

/// Storage identifier of a disk config value: the part before the first
/// `:`. Empty CD-ROM slots (`none,media=cdrom`) have no storage.
pub fn storage_of_disk(value: &str) -> Option<&str> {
    if value.starts_with("none,") || value == "none" {
        return None;
    }
    let id = value.split(':').next().unwrap_or("");
    if id.is_empty() { None } else { Some(id) }
}

/// Placement class of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Locked to its current node.
    Pin,
    /// Prefers its current node, may fail over.
    Prefer,
}

/// Lookup table from storage name to shared flag.
pub fn shared_storage_map(storages: &[Storage]) -> HashMap<String, bool> {
    storages
        .iter()
        .map(|s| (s.storage.clone(), s.is_shared()))
        .collect()
}

/// Whether every disk slot resolves to shared storage. Unknown storages
/// count as non-shared. An empty disk set counts as all-shared.
pub fn all_disks_shared(
    vmid: u32,
    disks: &BTreeMap<String, String>,
    shared_map: &HashMap<String, bool>,
) -> bool {
    for (slot, value) in disks {
        let storage = match storage_of_disk(value) {
            Some(storage) => storage,
            None => continue,
        };
        match shared_map.get(storage) {
            Some(true) => {}
            Some(false) => return false,
            None => {
                warn!("storage {storage} of vm {vmid} slot {slot} not in cluster storage list");
                return false;
            }
        }
    }
    true
}

/// Classifies a VM from its config and the storage catalog.
pub fn classify(vmid: u32, config: &VmConfig, shared_map: &HashMap<String, bool>) -> Placement {
    if !config.hostpci.is_empty() {
        return Placement::Pin;
    }
    if all_disks_shared(vmid, &config.disks, shared_map) {
        Placement::Prefer
    } else {
        Placement::Pin
    }
}

/// Materializes a placement to the owning node's group name.
pub fn target_group(placement: Placement, node: &str) -> String {
    match placement {
        Placement::Pin => pin_group_name(node),
        Placement::Prefer => prefer_group_name(node),
    }
}

/// Initial HA state for a VM, from its observed status.
pub fn target_state(vm_status: &str) -> &'static str {
    match vm_status {
        VM_STATUS_RUNNING => HA_STATE_STARTED,
        VM_STATUS_STOPPED => HA_STATE_STOPPED,
        _ => HA_STATE_IGNORED,
    }
}
