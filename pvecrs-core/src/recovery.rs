//! HA state recovery.
//!
//! Three conditions get a VM flagged: the HA manager latched it into
//! `error`, it sits in `disabled`, or it carries the critical tag without
//! being `started`. Error recovery flips the resource through `disabled`
//! before re-asserting the original state; the HA manager only clears a
//! latched error on that transition. Each transition is confirmed by
//! bounded polling against the cluster inventory.

use tracing::{debug, info, warn};

use crate::config::{
    GROUP_PREFIX, HA_STATE_DISABLED, HA_STATE_ERROR, HA_STATE_STARTED, RESOURCE_TYPE_VM,
};
use crate::error::CrsResult;
use crate::naming::{has_critical_tag, has_skip_tag, vm_sid};
use crate::proxmox::types::HaResource;
use crate::reconciler::Reconciler;

impl Reconciler {
    /// Scans the inventory for VMs needing HA state repair and drives
    /// them back, one at a time. Per-VM failures are logged and do not
    /// abort the tick; the next tick retries.
    pub async fn recover_ha_resources(&self) -> CrsResult<()> {
        let mut resources = self.api.cluster_resources().await?;
        resources.sort_by_key(|r| r.vmid);

        let mut error_vms = Vec::new();
        let mut disabled_vms = Vec::new();
        let mut critical_vms = Vec::new();

        for resource in &resources {
            if resource.kind != RESOURCE_TYPE_VM {
                continue;
            }
            if has_skip_tag(&resource.tags) {
                debug!(
                    "skipping VM {} ({}) with skip tag for HA recovery",
                    resource.vmid, resource.name
                );
                continue;
            }

            // Each VM lands in at most one bucket; the state-driven cases
            // win over the critical-tag case since their repair already
            // ends in `started`.
            let sid = vm_sid(resource.vmid);
            match resource.ha_state() {
                HA_STATE_ERROR => error_vms.push(sid),
                HA_STATE_DISABLED => disabled_vms.push(sid),
                state if has_critical_tag(&resource.tags) && state != HA_STATE_STARTED => {
                    critical_vms.push(sid)
                }
                _ => {}
            }
        }

        if error_vms.is_empty() && disabled_vms.is_empty() && critical_vms.is_empty() {
            debug!("no VMs need HA state recovery");
            return Ok(());
        }

        if !error_vms.is_empty() {
            info!("found {} VMs in HA error state: {error_vms:?}", error_vms.len());
        }
        if !disabled_vms.is_empty() {
            info!(
                "found {} VMs in HA disabled state: {disabled_vms:?}",
                disabled_vms.len()
            );
        }
        if !critical_vms.is_empty() {
            info!(
                "found {} critical VMs not started: {critical_vms:?}",
                critical_vms.len()
            );
        }

        let ha_resources = self.api.ha_resources().await?;

        for sid in &error_vms {
            if let Some(resource) = self.managed_resource(sid, &ha_resources) {
                info!("recovering HA resource {sid} from error state via disabled");
                if self.fix_error_state(sid, resource).await {
                    info!("recovered HA resource {sid} from error state");
                }
            }
        }

        for sid in &disabled_vms {
            if let Some(resource) = self.managed_resource(sid, &ha_resources) {
                info!("starting disabled HA resource {sid}");
                if self.start_resource(sid, resource, HA_STATE_DISABLED).await {
                    info!("started disabled HA resource {sid}");
                }
            }
        }

        for sid in &critical_vms {
            if let Some(resource) = self.managed_resource(sid, &ha_resources) {
                info!("ensuring critical HA resource {sid} is started");
                if self.start_resource(sid, resource, &resource.state).await {
                    info!("critical HA resource {sid} is started");
                }
            }
        }

        Ok(())
    }

    /// Looks up the HA resource of `sid`, filtering to controller-owned
    /// groups.
    fn managed_resource<'a>(
        &self,
        sid: &str,
        ha_resources: &'a [HaResource],
    ) -> Option<&'a HaResource> {
        let resource = match ha_resources.iter().find(|r| r.sid == sid) {
            Some(resource) => resource,
            None => {
                warn!("VM {sid} needs HA recovery but has no HA resource");
                return None;
            }
        };
        if !resource.group.starts_with(GROUP_PREFIX) {
            debug!(
                "skipping {sid}: group {} is not scheduler-managed",
                resource.group
            );
            return None;
        }
        Some(resource)
    }

    /// Error recovery: disable, wait for the error to clear, restore the
    /// originally requested state, wait for it to stick.
    async fn fix_error_state(&self, sid: &str, resource: &HaResource) -> bool {
        let original_state = if !resource.requested_state.is_empty()
            && resource.requested_state != HA_STATE_ERROR
        {
            resource.requested_state.clone()
        } else {
            HA_STATE_STARTED.to_string()
        };

        let mut disabled = resource.clone();
        disabled.state = HA_STATE_DISABLED.to_string();
        if let Err(e) = self.api.update_ha_resource(&disabled).await {
            warn!("failed to set HA resource {sid} to disabled: {e}");
            return false;
        }

        if !self
            .wait_for_ha_state(sid, Some(HA_STATE_ERROR), HA_STATE_DISABLED)
            .await
        {
            warn!("HA resource {sid} did not leave error state within timeout");
            return false;
        }

        let mut restored = resource.clone();
        restored.state = original_state.clone();
        if let Err(e) = self.api.update_ha_resource(&restored).await {
            warn!("failed to restore HA resource {sid} to {original_state}: {e}");
            return false;
        }

        if !self.wait_for_ha_state(sid, None, &original_state).await {
            warn!("HA resource {sid} restoration to {original_state} not confirmed within timeout");
            return false;
        }
        true
    }

    /// Drives a resource to `started` and waits for confirmation.
    async fn start_resource(&self, sid: &str, resource: &HaResource, from_state: &str) -> bool {
        let mut started = resource.clone();
        started.state = HA_STATE_STARTED.to_string();
        if let Err(e) = self.api.update_ha_resource(&started).await {
            warn!("failed to set HA resource {sid} to started: {e}");
            return false;
        }

        let confirmed = if from_state == HA_STATE_ERROR {
            self.wait_for_ha_state(sid, Some(HA_STATE_ERROR), HA_STATE_STARTED)
                .await
        } else {
            self.wait_for_ha_state(sid, None, HA_STATE_STARTED).await
        };
        if !confirmed {
            warn!("HA resource {sid} did not reach started state within timeout");
        }
        confirmed
    }

    /// Polls the cluster inventory until the VM's HA state reaches
    /// `target` (or, when `leave_state` is given, merely leaves that
    /// state). Sleeps before every read. Read failures are retried and
    /// count against the attempt limit.
    async fn wait_for_ha_state(
        &self,
        sid: &str,
        leave_state: Option<&str>,
        target: &str,
    ) -> bool {
        let attempts = self.config.recovery_poll_attempts;
        let interval = self.config.recovery_poll_interval;
        debug!(
            "waiting for HA resource {sid} to reach {target} (max {attempts} attempts, {interval:?} apart)"
        );

        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;

            let resources = match self.api.cluster_resources().await {
                Ok(resources) => resources,
                Err(e) => {
                    warn!("attempt {attempt}/{attempts}: failed to read cluster resources: {e}");
                    continue;
                }
            };

            let current = resources
                .iter()
                .find(|r| r.kind == RESOURCE_TYPE_VM && vm_sid(r.vmid) == sid)
                .map(|r| r.ha_state().to_string());

            if let Some(current) = current {
                debug!(
                    "attempt {attempt}/{attempts}: HA resource {sid} state {current:?} (target {target})"
                );
                if let Some(from) = leave_state {
                    if current != from {
                        return true;
                    }
                }
                if current == target {
                    return true;
                }
            }
        }

        warn!(
            "HA resource {sid} did not reach {target} after {attempts} attempts ({:?} total)",
            interval * attempts
        );
        false
    }
}
