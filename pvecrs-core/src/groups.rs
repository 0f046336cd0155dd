//! HA group planning and reconciliation.
//!
//! Pin groups lock a VM to one node; prefer groups list every node with a
//! deterministic fallback ring so that equal clusters always produce
//! byte-equal configurations. Nodes strings are compared in normalized
//! form, making equality independent of entry order and spacing.

use std::collections::HashSet;

use tracing::info;

use crate::config::{GROUP_PREFIX, MAX_NODE_PRIORITY, MIN_NODE_PRIORITY, PRIORITY_STEP};
use crate::error::CrsResult;
use crate::naming::{pin_group_name, prefer_group_name};
use crate::proxmox::types::{HaGroup, Node};
use crate::reconciler::Reconciler;

/// Nodes string of a pin group: the owning node at maximum priority.
pub fn pin_nodes_string(node: &str) -> String {
    format!("{node}:{MAX_NODE_PRIORITY}")
}

/// Nodes string of a prefer group. The preferred node keeps maximum
/// priority; every other node drops by a fixed step per position in the
/// ring starting after the preferred node. Entries are sorted to make the
/// result canonical.
pub fn prefer_nodes_string(nodes: &[Node], preferred: &str) -> String {
    let mut sorted: Vec<&str> = nodes.iter().map(|n| n.node.as_str()).collect();
    sorted.sort_unstable();

    let count = sorted.len();
    let preferred_idx = sorted.iter().position(|n| *n == preferred).unwrap_or(0);

    let mut entries: Vec<String> = sorted
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let priority = if *name == preferred {
                MAX_NODE_PRIORITY
            } else {
                let mut rel = (i + count - preferred_idx) % count;
                if rel == 0 {
                    rel = count;
                }
                MAX_NODE_PRIORITY
                    .saturating_sub(PRIORITY_STEP * rel as u32)
                    .max(MIN_NODE_PRIORITY)
            };
            format!("{name}:{priority}")
        })
        .collect();

    entries.sort_unstable();
    entries.join(",")
}

/// Canonical form of a nodes string: entries trimmed and sorted.
pub fn normalize_nodes(nodes: &str) -> String {
    if nodes.is_empty() {
        return String::new();
    }
    let mut entries: Vec<&str> = nodes.split(',').map(str::trim).collect();
    entries.sort_unstable();
    entries.join(",")
}

/// Whether two nodes strings describe the same configuration.
pub fn nodes_equal(existing: &str, expected: &str) -> bool {
    existing == expected || normalize_nodes(existing) == normalize_nodes(expected)
}

fn planned_group(name: &str, nodes: String) -> HaGroup {
    HaGroup {
        group: name.to_string(),
        nodes,
        restricted: 1,
        nofailback: 1,
    }
}

impl Reconciler {
    /// Creates or repairs the per-node pin groups.
    pub async fn setup_pin_groups(&self) -> CrsResult<()> {
        let ha_groups = self.api.ha_groups().await?;
        let nodes = self.sorted_nodes().await?;

        for node in &nodes {
            let name = pin_group_name(&node.node);
            let expected = pin_nodes_string(&node.node);

            match ha_groups.iter().find(|g| g.group == name) {
                None => {
                    info!("creating HA group {name}");
                    self.api
                        .create_ha_group(&planned_group(&name, expected))
                        .await?;
                    self.rate_limit_sleep().await;
                }
                Some(existing) if !nodes_equal(&existing.nodes, &expected) => {
                    info!(
                        "updating HA group {name}: before={:?}, after={expected:?}",
                        existing.nodes
                    );
                    self.api
                        .update_ha_group(&planned_group(&name, expected))
                        .await?;
                    self.rate_limit_sleep().await;
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Creates or repairs the per-node prefer groups. Without qualifying
    /// shared storage there is nothing a prefer group could express, so
    /// none are planned.
    pub async fn setup_prefer_groups(&self) -> CrsResult<()> {
        if !self.has_qualifying_shared_storage().await? {
            return Ok(());
        }

        let ha_groups = self.api.ha_groups().await?;
        let nodes = self.sorted_nodes().await?;

        for node in &nodes {
            let name = prefer_group_name(&node.node);
            let expected = prefer_nodes_string(&nodes, &node.node);

            match ha_groups.iter().find(|g| g.group == name) {
                None => {
                    info!("creating HA group {name}");
                    self.api
                        .create_ha_group(&planned_group(&name, expected))
                        .await?;
                    self.rate_limit_sleep().await;
                }
                Some(existing) if !nodes_equal(&existing.nodes, &expected) => {
                    info!(
                        "updating HA group {name}: before={:?}, after={expected:?}",
                        existing.nodes
                    );
                    self.api
                        .update_ha_group(&planned_group(&name, expected))
                        .await?;
                    self.rate_limit_sleep().await;
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Deletes controller-prefixed groups that are no longer planned.
    /// Every HA resource referencing a doomed group is removed first.
    pub async fn cleanup_orphaned_groups(&self) -> CrsResult<()> {
        let planned = self.planned_group_names().await?;
        let mut ha_groups = self.api.ha_groups().await?;
        ha_groups.sort_by(|a, b| a.group.cmp(&b.group));

        for group in &ha_groups {
            if !group.group.starts_with(GROUP_PREFIX) || planned.contains(&group.group) {
                continue;
            }

            info!("found orphaned HA group {}", group.group);
            self.evict_group_resources(&group.group).await?;

            info!("deleting orphaned HA group {}", group.group);
            self.api.delete_ha_group(&group.group).await?;
            self.rate_limit_sleep().await;
        }

        Ok(())
    }

    /// The set of group names the current inventory justifies.
    async fn planned_group_names(&self) -> CrsResult<HashSet<String>> {
        let nodes = self.sorted_nodes().await?;
        let mut planned: HashSet<String> =
            nodes.iter().map(|n| pin_group_name(&n.node)).collect();

        if self.has_qualifying_shared_storage().await? {
            planned.extend(nodes.iter().map(|n| prefer_group_name(&n.node)));
        }

        Ok(planned)
    }

    /// Deletes every HA resource assigned to `group`.
    async fn evict_group_resources(&self, group: &str) -> CrsResult<()> {
        let mut resources = self.api.ha_resources().await?;
        resources.sort_by(|a, b| a.sid.cmp(&b.sid));

        for resource in &resources {
            if resource.group == group {
                info!("removing HA resource {} from group {group}", resource.sid);
                self.api.delete_ha_resource(&resource.sid).await?;
                self.rate_limit_sleep().await;
            }
        }

        Ok(())
    }
}
