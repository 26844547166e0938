//! In-memory VM registry.
//!
//! One record per tracked worker VM, plus the protected-VM slot. All reads
//! and writes go through a single lock; callers snapshot under the lock,
//! perform HTTP I/O outside it, and apply results back under the lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

/// A tracked worker VM.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    /// Cloud-assigned identifier; primary key.
    pub instance_id: String,

    /// Current public IPv4 address. Never empty: records without an IP are
    /// never inserted.
    pub ip: String,

    /// Active matches last reported by the worker, or an optimistic
    /// increment after allocation.
    pub match_count: u32,

    /// Consecutive failed status probes; resets to 0 on any success.
    pub unreachable_count: u32,

    /// When the VM was first tracked.
    pub launched_at: DateTime<Utc>,

    /// Most recent successful status probe; equals `launched_at` if never
    /// probed successfully.
    pub last_seen: DateTime<Utc>,
}

impl VmRecord {
    /// Fresh record for a VM first seen now.
    pub fn new(instance_id: String, ip: String) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            ip,
            match_count: 0,
            unreachable_count: 0,
            launched_at: now,
            last_seen: now,
        }
    }

    /// VM age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.launched_at)
    }
}

/// Outcome of one status probe, ready to fold into the registry.
#[derive(Debug, Clone, Copy)]
pub enum ProbeOutcome {
    Success { active_matches: u32 },
    Failure,
}

#[derive(Default)]
struct Inner {
    vms: HashMap<String, VmRecord>,
    protected: Option<String>,
}

/// Process-wide VM pool. The single mutation point for fleet state.
#[derive(Default)]
pub struct VmRegistry {
    inner: RwLock<Inner>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked VMs.
    pub async fn len(&self) -> usize {
        self.inner.read().await.vms.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.vms.is_empty()
    }

    /// Insert a record, replacing any previous entry for the instance.
    pub async fn insert(&self, record: VmRecord) {
        let mut inner = self.inner.write().await;
        inner.vms.insert(record.instance_id.clone(), record);
    }

    /// Fold a cloud-sync observation in: insert if untracked, update the IP
    /// if the provider reassigned it. Returns true if a record was inserted.
    pub async fn upsert_from_cloud(&self, instance_id: &str, ip: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.vms.get_mut(instance_id) {
            Some(record) => {
                if record.ip != ip {
                    record.ip = ip.to_string();
                }
                false
            }
            None => {
                inner.vms.insert(
                    instance_id.to_string(),
                    VmRecord::new(instance_id.to_string(), ip.to_string()),
                );
                true
            }
        }
    }

    /// Remove a record. Clears the protected slot if it pointed here.
    pub async fn remove(&self, instance_id: &str) -> Option<VmRecord> {
        let mut inner = self.inner.write().await;
        let removed = inner.vms.remove(instance_id);
        if removed.is_some() && inner.protected.as_deref() == Some(instance_id) {
            inner.protected = None;
        }
        removed
    }

    pub async fn get(&self, instance_id: &str) -> Option<VmRecord> {
        self.inner.read().await.vms.get(instance_id).cloned()
    }

    /// Copy of the current pool, for selection outside the lock.
    pub async fn snapshot(&self) -> Vec<VmRecord> {
        self.inner.read().await.vms.values().cloned().collect()
    }

    /// Apply one probe outcome atomically. Returns the updated record.
    pub async fn apply_probe(&self, instance_id: &str, outcome: ProbeOutcome) -> Option<VmRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.vms.get_mut(instance_id)?;
        match outcome {
            ProbeOutcome::Success { active_matches } => {
                record.match_count = active_matches;
                record.unreachable_count = 0;
                record.last_seen = Utc::now();
            }
            ProbeOutcome::Failure => {
                record.unreachable_count += 1;
            }
        }
        Some(record.clone())
    }

    /// Optimistic bump after a successful start-match. The next probe
    /// overwrites any drift.
    pub async fn increment_match_count(&self, instance_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.vms.get_mut(instance_id) {
            record.match_count += 1;
        }
    }

    /// Current protected VM, if any.
    pub async fn protected(&self) -> Option<String> {
        self.inner.read().await.protected.clone()
    }

    /// Point protection at an existing record. A target that is not in the
    /// pool is refused, keeping the pointer valid.
    pub async fn set_protected(&self, instance_id: Option<String>) {
        let mut inner = self.inner.write().await;
        match instance_id {
            Some(id) if !inner.vms.contains_key(&id) => {
                warn!(instance_id = %id, "Refusing to protect untracked VM");
            }
            other => inner.protected = other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_inserts_then_updates_ip() {
        let registry = VmRegistry::new();

        assert!(registry.upsert_from_cloud("i-1", "192.0.2.1").await);
        assert!(!registry.upsert_from_cloud("i-1", "192.0.2.9").await);

        let record = registry.get("i-1").await.unwrap();
        assert_eq!(record.ip, "192.0.2.9");
        assert_eq!(record.match_count, 0);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_clears_protected_slot() {
        let registry = VmRegistry::new();
        registry.insert(VmRecord::new("i-1".into(), "192.0.2.1".into())).await;
        registry.set_protected(Some("i-1".to_string())).await;
        assert_eq!(registry.protected().await.as_deref(), Some("i-1"));

        registry.remove("i-1").await;
        assert_eq!(registry.protected().await, None);
    }

    #[tokio::test]
    async fn protecting_untracked_vm_is_refused() {
        let registry = VmRegistry::new();
        registry.set_protected(Some("i-ghost".to_string())).await;
        assert_eq!(registry.protected().await, None);
    }

    #[tokio::test]
    async fn probe_success_resets_unreachable_count() {
        let registry = VmRegistry::new();
        registry.insert(VmRecord::new("i-1".into(), "192.0.2.1".into())).await;

        registry.apply_probe("i-1", ProbeOutcome::Failure).await;
        let record = registry.apply_probe("i-1", ProbeOutcome::Failure).await.unwrap();
        assert_eq!(record.unreachable_count, 2);

        let record = registry
            .apply_probe("i-1", ProbeOutcome::Success { active_matches: 3 })
            .await
            .unwrap();
        assert_eq!(record.unreachable_count, 0);
        assert_eq!(record.match_count, 3);
        assert!(record.last_seen >= record.launched_at);
    }

    #[tokio::test]
    async fn snapshot_is_a_copy() {
        let registry = VmRegistry::new();
        registry.insert(VmRecord::new("i-1".into(), "192.0.2.1".into())).await;

        let snapshot = registry.snapshot().await;
        registry.increment_match_count("i-1").await;

        assert_eq!(snapshot[0].match_count, 0);
        assert_eq!(registry.get("i-1").await.unwrap().match_count, 1);
    }
}
