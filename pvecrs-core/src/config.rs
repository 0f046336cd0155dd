//! Controller configuration and process-wide constants.
//!
//! The tag names, group prefixes and priority bounds are contractual: they
//! are what the controller writes into the cluster, and what it scans for
//! when cleaning up. Changing them orphans previously managed objects.

use std::time::Duration;

/// Prefix shared by every HA group the controller owns.
pub const GROUP_PREFIX: &str = "crs-";
/// Prefix of pin groups (one node, locked placement).
pub const PIN_GROUP_PREFIX: &str = "crs-vm-pin-";
/// Prefix of prefer groups (all nodes, fallback ring).
pub const PREFER_GROUP_PREFIX: &str = "crs-vm-prefer-";

/// Tag that excludes a VM from all reconciliation.
pub const SKIP_TAG: &str = "crs-skip";
/// Tag that enforces start order and always-started state.
pub const CRITICAL_TAG: &str = "crs-critical";

/// Comment marker on HA resources created by the controller.
pub const MANAGED_COMMENT: &str = "crs-managed";

pub const MAX_NODE_PRIORITY: u32 = 1000;
pub const MIN_NODE_PRIORITY: u32 = 1;
/// Priority decrement per position in the prefer-group fallback ring.
pub const PRIORITY_STEP: u32 = 5;

/// HA states as the cluster reports them.
pub const HA_STATE_STARTED: &str = "started";
pub const HA_STATE_STOPPED: &str = "stopped";
pub const HA_STATE_IGNORED: &str = "ignored";
pub const HA_STATE_DISABLED: &str = "disabled";
pub const HA_STATE_ERROR: &str = "error";
pub const HA_STATE_MAINTENANCE: &str = "maintenance";

pub const VM_STATUS_RUNNING: &str = "running";
pub const VM_STATUS_STOPPED: &str = "stopped";

/// `type` of qemu rows in `/cluster/resources`.
pub const RESOURCE_TYPE_VM: &str = "qemu";
pub const RESOURCE_TYPE_NODE: &str = "node";

/// `type` of HA resources managed here.
pub const HA_RESOURCE_TYPE: &str = "vm";

pub const HA_MAX_RELOCATE: u32 = 10;
pub const HA_MAX_RESTART: u32 = 10;

/// Startup order enforced on critical VMs.
pub const CRITICAL_STARTUP_ORDER: &str = "order=1";

/// Uptime threshold after which leftover installer CD-ROMs are detached.
pub const LONG_RUNNING_UPTIME_SECS: u64 = 86_400;

/// Runtime knobs for the control loop. One instance is built at startup
/// and shared by the reconciler and the driver; tests shrink the poll
/// bounds and disable the rate limiter.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Cadence of the periodic driver.
    pub tick_interval: Duration,
    /// Gap inserted between successive mutating API calls.
    pub rate_limit_delay: Duration,
    /// Disables the rate-limit sleep; test builds only.
    pub disable_rate_limit: bool,
    /// Attempts when polling for an HA state transition.
    pub recovery_poll_attempts: u32,
    /// Sleep before each recovery poll read.
    pub recovery_poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            rate_limit_delay: Duration::from_millis(500),
            disable_rate_limit: false,
            recovery_poll_attempts: 30,
            recovery_poll_interval: Duration::from_secs(10),
        }
    }
}

impl ControllerConfig {
    /// Configuration for tests: no rate limiting, millisecond polls.
    pub fn for_testing() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            rate_limit_delay: Duration::ZERO,
            disable_rate_limit: true,
            recovery_poll_attempts: 3,
            recovery_poll_interval: Duration::from_millis(10),
        }
    }
}
