//! Registered-tags reconciliation.
//!
//! Proxmox maintains a cluster-wide set of registered tags. Making sure
//! the scheduler's tags are in it keeps them selectable in the UI. Old
//! cluster versions (or restricted tokens) refuse the write, which is why
//! the caller treats a failure here as non-fatal.

use tracing::{debug, info};

use crate::config::{CRITICAL_TAG, SKIP_TAG};
use crate::error::CrsResult;
use crate::proxmox::types::ClusterOptions;
use crate::reconciler::Reconciler;

impl Reconciler {
    /// Appends the skip and critical tags to the cluster's registered
    /// tag set when missing.
    pub async fn ensure_tags_registered(&self) -> CrsResult<()> {
        let options = self.api.cluster_options().await?;
        debug!("registered tags: {:?}", options.registered_tags);

        let missing: Vec<&str> = [SKIP_TAG, CRITICAL_TAG]
            .into_iter()
            .filter(|tag| {
                !options
                    .registered_tags
                    .iter()
                    .any(|existing| existing.trim() == *tag)
            })
            .collect();

        if missing.is_empty() {
            debug!("all scheduler tags already registered");
            return Ok(());
        }

        let mut registered_tags = options.registered_tags.clone();
        registered_tags.extend(missing.iter().map(|t| t.to_string()));

        self.api
            .update_cluster_options(&ClusterOptions { registered_tags })
            .await?;

        info!("registered scheduler tags {missing:?} in cluster options");
        Ok(())
    }
}
