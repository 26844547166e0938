//! Periodic reconciliation loop.
//!
//! Each tick converges the in-memory pool with the cloud and the workers:
//! cloud sync, health refresh with idle/unreachable scale-down, minimum-pool
//! top-up, low-capacity scale-up, protected-VM upkeep. Phase errors are
//! logged and never abort the loop; the next tick retries against reality.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::FleetController;
use crate::cloud::InstanceState;
use crate::matches::MatchStore;
use crate::registry::{ProbeOutcome, VmRecord};

/// Counters from a single reconciliation tick.
#[derive(Debug, Default, Clone)]
pub struct TickStats {
    pub synced_added: u32,
    pub synced_removed: u32,
    pub probes_ok: u32,
    pub probes_failed: u32,
    pub free_slots: u64,
    pub terminated: u32,
    pub launched: u32,
    pub matches_swept: u32,
}

/// Drives `FleetController` on a fixed period.
pub struct Reconciler {
    fleet: Arc<FleetController>,
    matches: Arc<MatchStore>,
}

impl Reconciler {
    pub fn new(fleet: Arc<FleetController>, matches: Arc<MatchStore>) -> Self {
        Self { fleet, matches }
    }

    /// Run one tick at startup, then every `UPDATE_INTERVAL_MS` until
    /// shutdown. A tick that overruns the interval makes the timer skip,
    /// never queue: at most one tick is ever in flight.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.fleet.config().update_interval_ms);
        info!(interval_ms = period.as_millis() as u64, "Starting reconciler");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.tick().await;
                    debug!(?stats, "Reconcile tick complete");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full reconciliation pass.
    pub async fn tick(&self) -> TickStats {
        let mut stats = TickStats::default();

        self.sync_with_cloud(&mut stats).await;
        self.refresh_health(&mut stats).await;
        self.top_up_pool(&mut stats).await;
        self.scale_up_near_capacity(&mut stats).await;
        self.ensure_protected().await;
        self.sweep_matches(&mut stats).await;

        if stats.synced_removed > 0 || stats.terminated > 0 || stats.launched > 0 {
            let pool_size = self.fleet.registry().len().await;
            info!(
                pool_size,
                added = stats.synced_added,
                removed = stats.synced_removed,
                terminated = stats.terminated,
                launched = stats.launched,
                "Pool changed this tick"
            );
        }
        stats
    }

    /// Phase (a): make the registry agree with the cloud's view.
    ///
    /// A describe failure aborts only this phase; the remaining phases run
    /// against last-known state.
    async fn sync_with_cloud(&self, stats: &mut TickStats) {
        let instances = match self.fleet.cloud().describe_all().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "Cloud sync failed, keeping last-known pool");
                return;
            }
        };

        let running: HashMap<String, String> = instances
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .filter_map(|i| {
                i.public_ip()
                    .map(|ip| (i.instance_id.clone(), ip.to_string()))
            })
            .collect();

        let cloud_states: HashMap<&str, InstanceState> = instances
            .iter()
            .map(|i| (i.instance_id.as_str(), i.state))
            .collect();

        // Drop tracked VMs the cloud no longer reports as RUNNING.
        for record in self.fleet.registry().snapshot().await {
            let gone = !matches!(
                cloud_states.get(record.instance_id.as_str()),
                Some(InstanceState::Running)
            );
            if gone {
                info!(instance_id = %record.instance_id, "VM gone from cloud, untracking");
                self.fleet.registry().remove(&record.instance_id).await;
                stats.synced_removed += 1;
            }
        }

        // Track newly discovered RUNNING instances; refresh reassigned IPs.
        for (instance_id, ip) in &running {
            if self.fleet.registry().upsert_from_cloud(instance_id, ip).await {
                info!(instance_id = %instance_id, ip = %ip, "Discovered running VM");
                stats.synced_added += 1;
            }
        }
    }

    /// Phase (b): probe every worker, then terminate idle or unreachable
    /// VMs that are old enough, unprotected, and above the pool floor.
    ///
    /// Termination decisions are collected first and executed serially so
    /// the idle and unreachable paths cannot race within one tick.
    async fn refresh_health(&self, stats: &mut TickStats) {
        let snapshot = self.fleet.registry().snapshot().await;
        if snapshot.is_empty() {
            return;
        }

        let outcomes = self.fleet.probe_all(&snapshot).await;
        let now = Utc::now();
        let min_age = chrono::Duration::minutes(self.fleet.config().vm_age_terminate_minutes);
        let protected = self.fleet.registry().protected().await;

        let mut to_terminate: Vec<String> = Vec::new();
        for (record, outcome) in outcomes {
            let old_enough = record.age(now) >= min_age;
            let is_protected = protected.as_deref() == Some(record.instance_id.as_str());
            match outcome {
                ProbeOutcome::Success { .. } => {
                    stats.probes_ok += 1;
                    stats.free_slots += u64::from(
                        self.fleet
                            .config()
                            .full_match_limit
                            .saturating_sub(record.match_count),
                    );
                    if record.match_count == 0 && old_enough && !is_protected {
                        debug!(instance_id = %record.instance_id, "Idle VM eligible for scale-down");
                        to_terminate.push(record.instance_id);
                    }
                }
                ProbeOutcome::Failure => {
                    stats.probes_failed += 1;
                    let threshold = self.fleet.config().vm_unreachable_terminate_threshold;
                    if record.unreachable_count >= threshold && old_enough && !is_protected {
                        debug!(
                            instance_id = %record.instance_id,
                            unreachable_count = record.unreachable_count,
                            "Unreachable VM eligible for termination"
                        );
                        to_terminate.push(record.instance_id);
                    }
                }
            }
        }

        for instance_id in to_terminate {
            if self.fleet.registry().len().await <= self.fleet.config().min_backup_vms {
                debug!("Pool at floor, deferring remaining terminations");
                break;
            }
            self.fleet.terminate_and_remove(&instance_id).await;
            stats.terminated += 1;
        }
    }

    /// Phase (c): one launch attempt toward the pool floor. Single-flight
    /// launches mean one tick closes at most one VM of the gap.
    async fn top_up_pool(&self, stats: &mut TickStats) {
        if self.fleet.registry().len().await < self.fleet.config().min_backup_vms
            && self.fleet.launch_backup_vm().await.is_some()
        {
            stats.launched += 1;
        }
    }

    /// Phase (d): launch once when the fleet is nearly at capacity.
    ///
    /// Capacity added by this tick's own top-up launch counts toward the
    /// free total: a VM that just registered has not been probed yet but is
    /// entirely free.
    async fn scale_up_near_capacity(&self, stats: &mut TickStats) {
        let config = self.fleet.config();
        let free_slots =
            stats.free_slots + u64::from(stats.launched) * u64::from(config.full_match_limit);
        if free_slots <= u64::from(config.near_capacity_threshold)
            && self.fleet.registry().len().await < config.max_backup_vms
        {
            info!(free_slots, "Near capacity, launching backup VM");
            if self.fleet.launch_backup_vm().await.is_some() {
                stats.launched += 1;
            }
        }
    }

    /// Phase (e): keep the protected slot pointing at a sensible VM.
    async fn ensure_protected(&self) {
        let snapshot = self.fleet.registry().snapshot().await;
        if snapshot.is_empty() {
            return;
        }

        let registry = self.fleet.registry();
        match registry.protected().await {
            None => {
                if let Some(oldest) = oldest_vm(snapshot.iter()) {
                    info!(instance_id = %oldest.instance_id, "Protecting oldest VM");
                    registry.set_protected(Some(oldest.instance_id.clone())).await;
                }
            }
            Some(protected_id) => {
                let Some(current) = snapshot.iter().find(|vm| vm.instance_id == protected_id)
                else {
                    // remove() clears the slot; nothing to do until the next
                    // tick re-picks.
                    return;
                };

                let idle_for = Utc::now().signed_duration_since(current.last_seen);
                let window =
                    chrono::Duration::minutes(self.fleet.config().protected_idle_rotate_minutes);
                if idle_for > window {
                    let next = oldest_vm(
                        snapshot
                            .iter()
                            .filter(|vm| vm.instance_id != protected_id),
                    );
                    if let Some(next) = next {
                        info!(
                            from = %protected_id,
                            to = %next.instance_id,
                            idle_minutes = idle_for.num_minutes(),
                            "Rotating protected VM"
                        );
                        registry.set_protected(Some(next.instance_id.clone())).await;
                    }
                }
            }
        }
    }

    /// Phase (f), optional: drop match records whose VM left the pool.
    async fn sweep_matches(&self, stats: &mut TickStats) {
        if !self.fleet.config().match_sweep {
            return;
        }
        let live: HashSet<String> = self
            .fleet
            .registry()
            .snapshot()
            .await
            .into_iter()
            .map(|vm| vm.instance_id)
            .collect();
        let swept = self.matches.sweep_missing_vms(&live).await;
        if swept > 0 {
            info!(swept, "Dropped match records for departed VMs");
            stats.matches_swept = swept as u32;
        }
    }
}

/// Earliest `launched_at`, ties broken by `instanceId`.
fn oldest_vm<'a, I>(vms: I) -> Option<&'a VmRecord>
where
    I: Iterator<Item = &'a VmRecord>,
{
    vms.min_by(|a, b| {
        a.launched_at
            .cmp(&b.launched_at)
            .then(a.instance_id.cmp(&b.instance_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudProvider, MockCloud};
    use crate::config::Config;
    use chrono::Duration as ChronoDuration;

    fn test_config() -> Config {
        Config {
            port: 0,
            worker_port: 1, // nothing listens here; probes fail fast
            full_match_limit: 5,
            max_backup_vms: 3,
            min_backup_vms: 1,
            near_capacity_threshold: 1,
            vm_unreachable_terminate_threshold: 2,
            vm_age_terminate_minutes: 5,
            status_timeout_ms: 200,
            update_interval_ms: 30_000,
            protected_idle_rotate_minutes: 60,
            match_sweep: false,
            cloud_provider: "mock".to_string(),
            vm_template: crate::cloud::VmTemplate {
                image_id: "img-test".to_string(),
                instance_type: "standard.medium".to_string(),
                zone: "zone-a".to_string(),
                vpc_id: String::new(),
                subnet_id: String::new(),
                security_group_id: String::new(),
                bandwidth_mbps: 100,
                name_prefix: "match-server".to_string(),
            },
            playfab_secret_key: "secret".to_string(),
            log_level: "info".to_string(),
            launch_max_poll: 3,
            launch_poll_base_delay_ms: 10,
            launch_poll_delay_step_ms: 5,
        }
    }

    fn reconciler_with(config: Config, cloud: Arc<MockCloud>) -> Reconciler {
        let fleet = Arc::new(FleetController::new(
            config,
            cloud as Arc<dyn CloudProvider>,
        ));
        Reconciler::new(fleet, Arc::new(MatchStore::new()))
    }

    fn backdated(id: &str, ip: &str, age_minutes: i64) -> VmRecord {
        let launched = Utc::now() - ChronoDuration::minutes(age_minutes);
        VmRecord {
            instance_id: id.to_string(),
            ip: ip.to_string(),
            match_count: 0,
            unreachable_count: 0,
            launched_at: launched,
            last_seen: launched,
        }
    }

    #[tokio::test]
    async fn cold_start_tops_up_to_floor_and_protects() {
        let cloud = Arc::new(MockCloud::new());
        cloud.push_launch_ip("203.0.113.10").await;
        let reconciler = reconciler_with(test_config(), Arc::clone(&cloud));

        let stats = reconciler.tick().await;

        assert_eq!(stats.launched, 1);
        let registry = reconciler.fleet.registry();
        assert_eq!(registry.len().await, 1);
        let protected = registry.protected().await.unwrap();
        assert!(registry.get(&protected).await.is_some());
    }

    #[tokio::test]
    async fn sync_untracks_vms_missing_from_cloud() {
        let cloud = Arc::new(MockCloud::new());
        cloud.seed_running("i-keep", "192.0.2.1").await;
        cloud.set_fail_run(true); // keep scale-up out of this scenario
        let mut config = test_config();
        config.min_backup_vms = 0;
        let reconciler = reconciler_with(config, Arc::clone(&cloud));

        let registry = reconciler.fleet.registry();
        registry.insert(backdated("i-keep", "192.0.2.1", 1)).await;
        registry.insert(backdated("i-gone", "192.0.2.2", 1)).await;
        registry.set_protected(Some("i-gone".to_string())).await;

        let stats = reconciler.tick().await;

        assert_eq!(stats.synced_removed, 1);
        assert!(registry.get("i-gone").await.is_none());
        assert!(registry.get("i-keep").await.is_some());
        // Protection moved off the removed VM onto a live one.
        assert_eq!(registry.protected().await.as_deref(), Some("i-keep"));
    }

    #[tokio::test]
    async fn sync_discovers_running_instances_and_updated_ips() {
        let cloud = Arc::new(MockCloud::new());
        cloud.seed_running("i-new", "198.51.100.1").await;
        cloud.seed_running("i-moved", "198.51.100.9").await;
        cloud.set_fail_run(true);
        let mut config = test_config();
        config.min_backup_vms = 0;
        let reconciler = reconciler_with(config, Arc::clone(&cloud));

        let registry = reconciler.fleet.registry();
        registry.insert(backdated("i-moved", "198.51.100.2", 1)).await;

        let stats = reconciler.tick().await;

        assert_eq!(stats.synced_added, 1);
        assert_eq!(registry.get("i-new").await.unwrap().ip, "198.51.100.1");
        assert_eq!(registry.get("i-moved").await.unwrap().ip, "198.51.100.9");
    }

    #[tokio::test]
    async fn sync_failure_keeps_last_known_pool() {
        let cloud = Arc::new(MockCloud::new());
        cloud.set_fail_describe(true);
        cloud.set_fail_run(true);
        let mut config = test_config();
        config.min_backup_vms = 0;
        let reconciler = reconciler_with(config, Arc::clone(&cloud));

        let registry = reconciler.fleet.registry();
        registry.insert(backdated("i-1", "192.0.2.1", 1)).await;

        reconciler.tick().await;

        assert!(registry.get("i-1").await.is_some());
    }

    #[tokio::test]
    async fn unreachable_old_vms_are_terminated_above_floor() {
        let cloud = Arc::new(MockCloud::new());
        for (id, ip) in [
            ("i-1", "192.0.2.1"),
            ("i-2", "192.0.2.2"),
            ("i-3", "192.0.2.3"),
        ] {
            cloud.seed_running(id, ip).await;
        }
        cloud.set_fail_run(true);
        let reconciler = reconciler_with(test_config(), Arc::clone(&cloud));
        let registry = reconciler.fleet.registry();
        for (id, ip) in [
            ("i-1", "192.0.2.1"),
            ("i-2", "192.0.2.2"),
            ("i-3", "192.0.2.3"),
        ] {
            registry.insert(backdated(id, ip, 10)).await;
        }
        registry.set_protected(Some("i-1".to_string())).await;

        // Nothing listens on worker_port: every probe fails. First tick
        // takes each VM to unreachable_count == 1, below the threshold.
        let first = reconciler.tick().await;
        assert_eq!(first.terminated, 0);
        assert_eq!(registry.len().await, 3);

        // Second tick crosses the threshold; the protected VM survives.
        let second = reconciler.tick().await;
        assert_eq!(second.terminated, 2);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.protected().await.as_deref(), Some("i-1"));
        assert_eq!(cloud.terminated_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn young_vms_survive_failed_probes() {
        let cloud = Arc::new(MockCloud::new());
        for (id, ip) in [("i-1", "192.0.2.1"), ("i-2", "192.0.2.2")] {
            cloud.seed_running(id, ip).await;
        }
        let mut config = test_config();
        config.max_backup_vms = 2;
        let reconciler = reconciler_with(config, Arc::clone(&cloud));
        let registry = reconciler.fleet.registry();
        // Age 0: below VM_AGE_TERMINATE_MINUTES.
        registry.insert(backdated("i-1", "192.0.2.1", 0)).await;
        registry.insert(backdated("i-2", "192.0.2.2", 0)).await;

        reconciler.tick().await;
        let second = reconciler.tick().await;

        assert_eq!(second.terminated, 0);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn floor_is_never_crossed_by_terminations() {
        let cloud = Arc::new(MockCloud::new());
        for (id, ip) in [("i-1", "192.0.2.1"), ("i-2", "192.0.2.2")] {
            cloud.seed_running(id, ip).await;
        }
        let mut config = test_config();
        config.min_backup_vms = 2;
        config.max_backup_vms = 2;
        let reconciler = reconciler_with(config, Arc::clone(&cloud));
        let registry = reconciler.fleet.registry();
        registry.insert(backdated("i-1", "192.0.2.1", 10)).await;
        registry.insert(backdated("i-2", "192.0.2.2", 10)).await;

        for _ in 0..3 {
            reconciler.tick().await;
        }

        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn protection_rotates_off_idle_vm() {
        let cloud = Arc::new(MockCloud::new());
        for (id, ip) in [("i-old", "192.0.2.1"), ("i-young", "192.0.2.2")] {
            cloud.seed_running(id, ip).await;
        }
        let mut config = test_config();
        config.max_backup_vms = 2;
        config.min_backup_vms = 2; // keep both alive through failed probes
        let reconciler = reconciler_with(config, Arc::clone(&cloud));
        let registry = reconciler.fleet.registry();

        registry.insert(backdated("i-old", "192.0.2.1", 600)).await;
        // Protected VM idle for well over the rotation window.
        registry.insert(backdated("i-young", "192.0.2.2", 90)).await;
        registry.set_protected(Some("i-young".to_string())).await;

        reconciler.tick().await;

        assert_eq!(registry.protected().await.as_deref(), Some("i-old"));
    }

    #[tokio::test]
    async fn two_quiet_ticks_leave_identical_pools() {
        let cloud = Arc::new(MockCloud::new());
        cloud.seed_running("i-1", "192.0.2.1").await;
        cloud.set_fail_run(true);
        let mut config = test_config();
        config.vm_unreachable_terminate_threshold = 100; // quiet: no churn
        let reconciler = reconciler_with(config, Arc::clone(&cloud));
        let registry = reconciler.fleet.registry();
        registry.insert(backdated("i-1", "192.0.2.1", 10)).await;

        reconciler.tick().await;
        let after_first: Vec<String> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|vm| (vm.instance_id))
            .collect();
        reconciler.tick().await;
        let after_second: Vec<String> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|vm| (vm.instance_id))
            .collect();

        assert_eq!(after_first, after_second);
        assert_eq!(after_first, vec!["i-1".to_string()]);
    }

    #[tokio::test]
    async fn sweep_drops_matches_for_departed_vms() {
        let cloud = Arc::new(MockCloud::new());
        cloud.seed_running("i-live", "192.0.2.1").await;
        cloud.set_fail_run(true);
        let mut config = test_config();
        config.match_sweep = true;
        config.min_backup_vms = 0;
        let fleet = Arc::new(FleetController::new(
            config,
            cloud as Arc<dyn CloudProvider>,
        ));
        let matches = Arc::new(MatchStore::new());
        matches
            .insert(crate::matches::MatchRecord {
                match_id: "m-orphan".to_string(),
                game_mode: "VersusMen_Online".to_string(),
                match_privacy: "Public".to_string(),
                tick_rate: 60,
                match_type: "QuickPlay".to_string(),
                server_ip: "192.0.2.99".to_string(),
                server_port: 7890,
                container_id: "c-1".to_string(),
                vm_instance_id: "i-gone".to_string(),
                started_at: Utc::now(),
            })
            .await;
        let reconciler = Reconciler::new(Arc::clone(&fleet), Arc::clone(&matches));
        fleet
            .registry()
            .insert(backdated("i-live", "192.0.2.1", 1))
            .await;

        let stats = reconciler.tick().await;

        assert_eq!(stats.matches_swept, 1);
        assert!(matches.get("m-orphan").await.is_none());
    }

    #[test]
    fn oldest_vm_breaks_ties_on_instance_id() {
        let t = Utc::now();
        let mut a = backdated("i-b", "192.0.2.1", 10);
        let mut b = backdated("i-a", "192.0.2.2", 10);
        a.launched_at = t;
        b.launched_at = t;
        let vms = [a, b];
        let picked = oldest_vm(vms.iter()).unwrap();
        assert_eq!(picked.instance_id, "i-a");
    }
}
