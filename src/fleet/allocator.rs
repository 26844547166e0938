//! Allocation policy: pick the VM that takes the next match.

use tracing::{debug, info};

use super::FleetController;
use crate::registry::VmRecord;

/// Order candidates by (matchCount, lastSeen, instanceId) and return the
/// least-loaded reachable VM with free capacity.
pub(crate) fn select_candidate(vms: &[VmRecord], full_match_limit: u32) -> Option<VmRecord> {
    let mut candidates: Vec<&VmRecord> = vms
        .iter()
        .filter(|vm| vm.match_count < full_match_limit && vm.unreachable_count == 0)
        .collect();

    candidates.sort_by(|a, b| {
        a.match_count
            .cmp(&b.match_count)
            .then(a.last_seen.cmp(&b.last_seen))
            .then(a.instance_id.cmp(&b.instance_id))
    });

    candidates.first().map(|vm| (*vm).clone())
}

impl FleetController {
    /// Find a VM for the next match, or launch one.
    ///
    /// Probes the whole pool first so the decision runs against fresh
    /// counts. Returns `None` when the pool is full, the ceiling is reached,
    /// and no launch could complete; the caller surfaces that as
    /// no-capacity.
    pub async fn get_available_vm(&self) -> Option<VmRecord> {
        let snapshot = self.registry.snapshot().await;
        let probed = self.probe_all(&snapshot).await;
        let refreshed: Vec<VmRecord> = probed.into_iter().map(|(record, _)| record).collect();

        if let Some(vm) = select_candidate(&refreshed, self.config.full_match_limit) {
            debug!(
                instance_id = %vm.instance_id,
                match_count = vm.match_count,
                "Selected VM for allocation"
            );
            return Some(vm);
        }

        info!(
            pool_size = refreshed.len(),
            "No VM with free capacity, attempting launch"
        );
        self.launch_backup_vm().await
    }
}
