//! The reconciliation engine.
//!
//! One tick is a strictly ordered pipeline over observed cluster state.
//! Phases mutate the cluster through [`PveApi`] only; nothing is cached
//! across ticks, so an aborted tick costs nothing but time. Phase bodies
//! live in sibling modules (`tags`, `groups`, `resources`, `recovery`,
//! `maintenance`, `metadata`).

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::CrsResult;
use crate::proxmox::types::Node;
use crate::proxmox::PveApi;

pub struct Reconciler {
    pub(crate) api: Arc<dyn PveApi>,
    pub(crate) config: ControllerConfig,
}

impl Reconciler {
    pub fn new(api: Arc<dyn PveApi>, config: ControllerConfig) -> Self {
        Self { api, config }
    }

    /// Runs one full reconciliation tick. The first phase error aborts
    /// the tick; the next tick re-derives everything from scratch.
    pub async fn run_tick(&self) -> CrsResult<()> {
        debug!("starting reconciliation tick");

        // Best effort: a rejection is expected on older cluster versions
        // or restricted tokens, anything else deserves a louder note.
        // Neither aborts the tick.
        if let Err(e) = self.ensure_tags_registered().await {
            if e.is_permission_denied() {
                debug!("tag registration not permitted by the cluster: {e}");
            } else {
                warn!("tag registration failed: {e}");
            }
        }

        self.setup_pin_groups().await?;
        self.setup_prefer_groups().await?;
        self.cleanup_orphaned_groups().await?;
        self.evict_skip_tagged().await?;
        self.recover_ha_resources().await?;
        self.drain_maintenance_nodes().await?;
        self.update_vm_metadata().await?;
        self.setup_vm_resources().await?;

        info!("reconciliation tick complete");
        Ok(())
    }

    /// Gap between successive mutating API calls.
    pub(crate) async fn rate_limit_sleep(&self) {
        if !self.config.disable_rate_limit {
            tokio::time::sleep(self.config.rate_limit_delay).await;
        }
    }

    /// Cluster nodes in deterministic order.
    pub(crate) async fn sorted_nodes(&self) -> CrsResult<Vec<Node>> {
        let mut nodes = self.api.nodes().await?;
        nodes.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(nodes)
    }

    /// Whether any storage qualifies for floating VM placement.
    pub(crate) async fn has_qualifying_shared_storage(&self) -> CrsResult<bool> {
        let storages = self.api.storages().await?;
        Ok(storages.iter().any(|s| s.qualifies_for_placement()))
    }
}
