//! Cloud compute adapter.
//!
//! The `CloudProvider` trait is the only place the controller touches the
//! compute provider: describe the fleet, submit a spot launch, request
//! termination. Implementations return normalized instance records, never
//! provider payloads.
//!
//! A mock implementation is provided for testing and development.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Cloud adapter errors.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Network failures, rate limits, provider 5xx. Retried next tick.
    #[error("transient cloud error: {0}")]
    Transient(String),

    /// Auth failures, invalid parameters. Needs operator intervention.
    #[error("permanent cloud error: {0}")]
    Permanent(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }
}

/// Normalized instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Terminated,
}

/// Normalized instance record returned by `describe` calls.
#[derive(Debug, Clone)]
pub struct CloudInstance {
    /// Opaque provider-assigned identifier.
    pub instance_id: String,

    /// Lifecycle state.
    pub state: InstanceState,

    /// Public IPv4 addresses, possibly empty while the instance boots.
    pub public_ips: Vec<String>,
}

impl CloudInstance {
    /// First public IP, if the provider has assigned one.
    pub fn public_ip(&self) -> Option<&str> {
        self.public_ips.first().map(|s| s.as_str())
    }
}

/// Fixed launch template for worker VMs.
#[derive(Debug, Clone)]
pub struct VmTemplate {
    pub image_id: String,
    pub instance_type: String,
    pub zone: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group_id: String,
    pub bandwidth_mbps: u32,
    pub name_prefix: String,
}

/// Cloud provider interface.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Describe every instance ascribed to this project/region.
    async fn describe_all(&self) -> Result<Vec<CloudInstance>, CloudError>;

    /// Describe a specific set of instances.
    async fn describe(&self, instance_ids: &[String]) -> Result<Vec<CloudInstance>, CloudError>;

    /// Submit a spot-priced launch. Returns the assigned identifier before
    /// the instance reaches `Running`.
    async fn run_one(&self, template: &VmTemplate, name: &str) -> Result<String, CloudError>;

    /// Request termination. Best-effort: callers log failures, never retry
    /// here.
    async fn terminate(&self, instance_ids: &[String]) -> Result<(), CloudError>;
}

struct MockInstance {
    record: CloudInstance,
    /// Describe calls remaining before the instance reports `Running`.
    describes_until_running: u32,
    pending_ip: Option<String>,
}

/// Mock provider for testing and development.
///
/// Launched instances transition to `Running` after a configurable number of
/// describe calls, mirroring the boot delay of a real provider.
pub struct MockCloud {
    instances: Mutex<Vec<MockInstance>>,
    next_ips: Mutex<VecDeque<String>>,
    launch_counter: AtomicU64,
    describes_until_running: u32,
    fail_describe: AtomicBool,
    fail_run: AtomicBool,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(Vec::new()),
            next_ips: Mutex::new(VecDeque::new()),
            launch_counter: AtomicU64::new(0),
            describes_until_running: 0,
            fail_describe: AtomicBool::new(false),
            fail_run: AtomicBool::new(false),
        }
    }

    /// Mock whose launched instances need `n` describe calls to become
    /// `Running`.
    pub fn with_boot_delay(n: u32) -> Self {
        Self {
            describes_until_running: n,
            ..Self::new()
        }
    }

    /// Pre-register a running instance, as if it existed before startup.
    pub async fn seed_running(&self, instance_id: &str, ip: &str) {
        let mut instances = self.instances.lock().await;
        instances.push(MockInstance {
            record: CloudInstance {
                instance_id: instance_id.to_string(),
                state: InstanceState::Running,
                public_ips: vec![ip.to_string()],
            },
            describes_until_running: 0,
            pending_ip: None,
        });
    }

    /// Queue the public IP the next launched instance will receive.
    pub async fn push_launch_ip(&self, ip: &str) {
        self.next_ips.lock().await.push_back(ip.to_string());
    }

    /// Force an existing instance out of `Running`.
    pub async fn set_state(&self, instance_id: &str, state: InstanceState) {
        let mut instances = self.instances.lock().await;
        if let Some(inst) = instances
            .iter_mut()
            .find(|i| i.record.instance_id == instance_id)
        {
            inst.record.state = state;
        }
    }

    /// Reassign an instance's public IP.
    pub async fn set_ip(&self, instance_id: &str, ip: &str) {
        let mut instances = self.instances.lock().await;
        if let Some(inst) = instances
            .iter_mut()
            .find(|i| i.record.instance_id == instance_id)
        {
            inst.record.public_ips = vec![ip.to_string()];
        }
    }

    pub fn set_fail_describe(&self, fail: bool) {
        self.fail_describe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_run(&self, fail: bool) {
        self.fail_run.store(fail, Ordering::SeqCst);
    }

    /// Instance ids currently known to the mock, including terminated ones.
    pub async fn instance_ids(&self) -> Vec<String> {
        let instances = self.instances.lock().await;
        instances
            .iter()
            .map(|i| i.record.instance_id.clone())
            .collect()
    }

    /// Ids of instances that have been terminated.
    pub async fn terminated_ids(&self) -> Vec<String> {
        let instances = self.instances.lock().await;
        instances
            .iter()
            .filter(|i| i.record.state == InstanceState::Terminated)
            .map(|i| i.record.instance_id.clone())
            .collect()
    }

    async fn advance_and_collect(&self, filter: Option<&[String]>) -> Vec<CloudInstance> {
        let mut instances = self.instances.lock().await;
        let mut out = Vec::new();
        for inst in instances.iter_mut() {
            if let Some(ids) = filter {
                if !ids.iter().any(|id| *id == inst.record.instance_id) {
                    continue;
                }
            }
            if inst.record.state == InstanceState::Pending {
                if inst.describes_until_running == 0 {
                    inst.record.state = InstanceState::Running;
                    if let Some(ip) = inst.pending_ip.take() {
                        inst.record.public_ips = vec![ip];
                    }
                } else {
                    inst.describes_until_running -= 1;
                }
            }
            out.push(inst.record.clone());
        }
        out
    }
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn describe_all(&self) -> Result<Vec<CloudInstance>, CloudError> {
        if self.fail_describe.load(Ordering::SeqCst) {
            return Err(CloudError::Transient("mock describe failure".to_string()));
        }
        Ok(self.advance_and_collect(None).await)
    }

    async fn describe(&self, instance_ids: &[String]) -> Result<Vec<CloudInstance>, CloudError> {
        if self.fail_describe.load(Ordering::SeqCst) {
            return Err(CloudError::Transient("mock describe failure".to_string()));
        }
        Ok(self.advance_and_collect(Some(instance_ids)).await)
    }

    async fn run_one(&self, _template: &VmTemplate, name: &str) -> Result<String, CloudError> {
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(CloudError::Transient("mock launch failure".to_string()));
        }

        let n = self.launch_counter.fetch_add(1, Ordering::SeqCst);
        let instance_id = format!("i-mock{:06}", n);
        let ip = self
            .next_ips
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| format!("10.0.0.{}", n + 1));

        info!(instance_id = %instance_id, name = %name, "[MOCK] Launching instance");

        let mut instances = self.instances.lock().await;
        instances.push(MockInstance {
            record: CloudInstance {
                instance_id: instance_id.clone(),
                state: InstanceState::Pending,
                public_ips: Vec::new(),
            },
            describes_until_running: self.describes_until_running,
            pending_ip: Some(ip),
        });

        Ok(instance_id)
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<(), CloudError> {
        debug!(count = instance_ids.len(), "[MOCK] Terminating instances");
        let mut instances = self.instances.lock().await;
        for inst in instances.iter_mut() {
            if instance_ids.iter().any(|id| *id == inst.record.instance_id) {
                inst.record.state = InstanceState::Terminated;
                inst.record.public_ips.clear();
            }
        }
        Ok(())
    }
}
