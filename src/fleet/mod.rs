//! Fleet controller.
//!
//! Owns the VM registry, the cloud adapter, and the worker probe client.
//! The allocator (request path) and the reconciler (control loop) both run
//! against this one long-lived value; the registry lock and the single-flight
//! launch flag are the only coordination between them.

mod allocator;
mod reconciler;

pub use reconciler::{Reconciler, TickStats};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::cloud::{CloudProvider, InstanceState};
use crate::config::Config;
use crate::registry::{ProbeOutcome, VmRecord, VmRegistry};
use crate::worker::WorkerClient;

/// Clears the launch flag when the launch future completes or is dropped.
struct LaunchGuard<'a>(&'a AtomicBool);

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct FleetController {
    config: Config,
    cloud: Arc<dyn CloudProvider>,
    worker: WorkerClient,
    registry: VmRegistry,
    launching: AtomicBool,
}

impl FleetController {
    pub fn new(config: Config, cloud: Arc<dyn CloudProvider>) -> Self {
        let worker = WorkerClient::new(config.worker_port, config.status_timeout_ms);
        Self {
            config,
            cloud,
            worker,
            registry: VmRegistry::new(),
            launching: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    pub fn worker(&self) -> &WorkerClient {
        &self.worker
    }

    pub(crate) fn cloud(&self) -> &Arc<dyn CloudProvider> {
        &self.cloud
    }

    /// Probe every VM in `vms` concurrently and fold the outcomes into the
    /// registry. Returns the updated record alongside each outcome; VMs that
    /// left the registry mid-probe are dropped.
    pub async fn probe_all(&self, vms: &[VmRecord]) -> Vec<(VmRecord, ProbeOutcome)> {
        let probes = vms.iter().map(|vm| {
            let instance_id = vm.instance_id.clone();
            let ip = vm.ip.clone();
            async move {
                let outcome = match self.worker.status(&ip).await {
                    Ok(status) => ProbeOutcome::Success {
                        active_matches: status.active_matches,
                    },
                    Err(e) => {
                        debug!(instance_id = %instance_id, ip = %ip, error = %e, "Status probe failed");
                        ProbeOutcome::Failure
                    }
                };
                (instance_id, outcome)
            }
        });

        let mut results = Vec::with_capacity(vms.len());
        for (instance_id, outcome) in join_all(probes).await {
            if let Some(updated) = self.registry.apply_probe(&instance_id, outcome).await {
                results.push((updated, outcome));
            }
        }
        results
    }

    /// Launch one backup VM and wait for it to reach RUNNING with a public
    /// IP.
    ///
    /// Single-flight: at most one launch may be in progress process-wide.
    /// Concurrent callers get `None` immediately. Returns `None` when the
    /// pool is at its ceiling, the launch fails, or polling exhausts (in
    /// which case the instance is terminated best-effort).
    pub async fn launch_backup_vm(&self) -> Option<VmRecord> {
        if self.registry.len().await >= self.config.max_backup_vms {
            debug!(
                max_backup_vms = self.config.max_backup_vms,
                "Pool at ceiling, not launching"
            );
            return None;
        }

        if self
            .launching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Launch already in flight");
            return None;
        }
        let _guard = LaunchGuard(&self.launching);

        let name = format!(
            "{}-{}",
            self.config.vm_template.name_prefix,
            Utc::now().timestamp_millis()
        );

        let instance_id = match self.cloud.run_one(&self.config.vm_template, &name).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Launch request failed");
                return None;
            }
        };

        info!(instance_id = %instance_id, name = %name, "Launch submitted, polling for RUNNING");

        let ids = vec![instance_id.clone()];
        for attempt in 0..self.config.launch_max_poll {
            match self.cloud.describe(&ids).await {
                Ok(instances) => {
                    let ready = instances.iter().find(|i| {
                        i.instance_id == instance_id
                            && i.state == InstanceState::Running
                            && i.public_ip().is_some()
                    });
                    if let Some(instance) = ready {
                        let ip = instance.public_ip().unwrap_or_default().to_string();
                        let record = VmRecord::new(instance_id.clone(), ip);
                        self.registry.insert(record.clone()).await;
                        if self.registry.protected().await.is_none() {
                            self.registry.set_protected(Some(instance_id.clone())).await;
                        }
                        info!(
                            instance_id = %instance_id,
                            ip = %record.ip,
                            attempts = attempt + 1,
                            "Backup VM running"
                        );
                        return Some(record);
                    }
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Launch poll failed");
                }
            }

            if attempt + 1 < self.config.launch_max_poll {
                let delay = Duration::from_millis(
                    self.config.launch_poll_base_delay_ms
                        + u64::from(attempt) * self.config.launch_poll_delay_step_ms,
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(instance_id = %instance_id, "Launch poll exhausted, terminating");
        if let Err(e) = self.cloud.terminate(&ids).await {
            warn!(instance_id = %instance_id, error = %e, "Cleanup terminate failed");
        }
        None
    }

    /// Terminate a VM (best-effort) and drop it from the registry.
    pub(crate) async fn terminate_and_remove(&self, instance_id: &str) {
        if let Err(e) = self.cloud.terminate(&[instance_id.to_string()]).await {
            warn!(instance_id = %instance_id, error = %e, "Terminate request failed");
        }
        self.registry.remove(instance_id).await;
        info!(instance_id = %instance_id, "VM terminated and removed from pool");
    }
}
