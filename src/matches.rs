//! Active match records.
//!
//! One record per started match, keyed by matchId. Records are written once
//! and never mutated; the optional sweep removes entries whose VM has left
//! the pool.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// An active game-server session pinned to a VM.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub match_id: String,
    pub game_mode: String,
    pub match_privacy: String,
    pub tick_rate: u32,
    pub match_type: String,
    #[serde(rename = "serverIP")]
    pub server_ip: String,
    pub server_port: u16,
    pub container_id: String,
    pub vm_instance_id: String,
    pub started_at: DateTime<Utc>,
}

/// In-memory match map. Lost on restart by design.
#[derive(Default)]
pub struct MatchStore {
    matches: RwLock<HashMap<String, MatchRecord>>,
}

impl MatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: MatchRecord) {
        let mut matches = self.matches.write().await;
        matches.insert(record.match_id.clone(), record);
    }

    pub async fn get(&self, match_id: &str) -> Option<MatchRecord> {
        self.matches.read().await.get(match_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.matches.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.matches.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<MatchRecord> {
        self.matches.read().await.values().cloned().collect()
    }

    /// Drop records whose VM is no longer tracked. Returns how many were
    /// removed.
    pub async fn sweep_missing_vms(&self, live_instance_ids: &HashSet<String>) -> usize {
        let mut matches = self.matches.write().await;
        let before = matches.len();
        matches.retain(|_, m| live_instance_ids.contains(&m.vm_instance_id));
        before - matches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(match_id: &str, vm: &str) -> MatchRecord {
        MatchRecord {
            match_id: match_id.to_string(),
            game_mode: "VersusMen_Online".to_string(),
            match_privacy: "Public".to_string(),
            tick_rate: 60,
            match_type: "QuickPlay".to_string(),
            server_ip: "192.0.2.1".to_string(),
            server_port: 7890,
            container_id: "c-1".to_string(),
            vm_instance_id: vm.to_string(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_then_lookup() {
        let store = MatchStore::new();
        store.insert(record("m1", "i-1")).await;

        let found = store.get("m1").await.unwrap();
        assert_eq!(found.vm_instance_id, "i-1");
        assert!(store.get("m2").await.is_none());
    }

    #[tokio::test]
    async fn sweep_drops_only_orphaned_matches() {
        let store = MatchStore::new();
        store.insert(record("m1", "i-live")).await;
        store.insert(record("m2", "i-gone")).await;

        let live: HashSet<String> = ["i-live".to_string()].into_iter().collect();
        let removed = store.sweep_missing_vms(&live).await;

        assert_eq!(removed, 1);
        assert!(store.get("m1").await.is_some());
        assert!(store.get("m2").await.is_none());
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let json = serde_json::to_string(&record("m1", "i-1")).unwrap();
        assert!(json.contains("\"matchId\":\"m1\""));
        assert!(json.contains("\"serverIP\":\"192.0.2.1\""));
        assert!(json.contains("\"vmInstanceId\":\"i-1\""));
    }
}
