//! Canonical names and tag predicates.
//!
//! Group names embed the node's short hostname: the first DNS label,
//! lowercased. API calls keep using the full node name as the cluster
//! reports it; only the derived group names are shortened.

use crate::config::{CRITICAL_TAG, PIN_GROUP_PREFIX, PREFER_GROUP_PREFIX, SKIP_TAG};

/// Short form of a node name: everything before the first `.`, lowercased.
pub fn node_short_name(name: &str) -> String {
    let label = name.split('.').next().unwrap_or(name);
    label.to_lowercase()
}

/// Name of the pin group owned by `node`.
pub fn pin_group_name(node: &str) -> String {
    format!("{}{}", PIN_GROUP_PREFIX, node_short_name(node))
}

/// Name of the prefer group owned by `node`.
pub fn prefer_group_name(node: &str) -> String {
    format!("{}{}", PREFER_GROUP_PREFIX, node_short_name(node))
}

/// Service identifier of a VM's HA resource.
pub fn vm_sid(vmid: u32) -> String {
    format!("vm:{vmid}")
}

/// Tests membership of `tag` in a VM tag string. Tags are separated by
/// `;` or whitespace; elements are trimmed and matched case-sensitively.
pub fn has_tag(tags: &str, tag: &str) -> bool {
    tags.split(|c: char| c == ';' || c.is_whitespace())
        .map(str::trim)
        .any(|t| t == tag)
}

pub fn has_skip_tag(tags: &str) -> bool {
    has_tag(tags, SKIP_TAG)
}

pub fn has_critical_tag(tags: &str) -> bool {
    has_tag(tags, CRITICAL_TAG)
}
