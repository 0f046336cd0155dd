//! Periodic driver and leader election.
//!
//! One tick runs unconditionally at startup so configuration faults
//! surface immediately, then the loop fires on a fixed cadence. Periodic
//! ticks run under the cluster-wide lock; instances that fail to acquire
//! it simply wait for the next cadence boundary. A termination signal
//! drops the in-flight tick future, which aborts it at its next
//! suspension point; the lock's TTL session cleans up after an abandoned
//! acquisition.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::ControllerConfig;
use crate::consul::Coordinator;
use crate::error::{CrsError, CrsResult};
use crate::reconciler::Reconciler;

/// KV key of the tick lock.
pub const LOCK_KEY: &str = "crs/_internal/lock/periodic";

pub struct Driver {
    reconciler: Arc<Reconciler>,
    coordinator: Arc<dyn Coordinator>,
    config: ControllerConfig,
}

impl Driver {
    pub fn new(
        reconciler: Arc<Reconciler>,
        coordinator: Arc<dyn Coordinator>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler,
            coordinator,
            config,
        }
    }

    /// Runs one tick if this instance can take the lock. Returns whether
    /// the tick ran.
    pub async fn run_tick_if_leader(&self) -> CrsResult<bool> {
        let handle = match self.coordinator.acquire_lock(LOCK_KEY).await? {
            Some(handle) => handle,
            None => {
                debug!("another instance holds the tick lock");
                return Ok(false);
            }
        };

        // A lost session means another instance may already be
        // reconciling; abort at the next suspension point instead of
        // racing it.
        let result = tokio::select! {
            result = self.reconciler.run_tick() => result,
            _ = handle.lost() => {
                error!("tick lock lost mid-tick, aborting");
                Err(CrsError::Cancelled)
            }
        };

        if let Err(e) = self.coordinator.release_lock(handle).await {
            error!("failed to release tick lock: {e}");
        }

        result.map(|()| true)
    }

    /// Runs the controller until a termination signal arrives. The
    /// startup tick runs unconditionally and is fatal on error, so
    /// configuration faults surface before the process settles into the
    /// cadence; only the periodic ticks go through the lock, and their
    /// errors are logged while the loop continues.
    pub async fn run(&self) -> CrsResult<()> {
        self.reconciler.run_tick().await?;
        debug!("startup tick complete");

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; the startup tick
        // above already covered it.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tokio::select! {
                        result = self.run_tick_if_leader() => {
                            if let Err(e) = result {
                                error!("reconciliation tick failed: {e}");
                            }
                        }
                        _ = shutdown_signal() => {
                            info!("shutdown requested, aborting in-flight tick");
                            return Ok(());
                        }
                    }
                }
                _ = shutdown_signal() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Completes when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install SIGINT handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
