use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// What a shard is allowed to do. A shard is usable for an operation only
/// when it is healthy and carries the matching capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Replicate,
    Admin,
}

/// Authoritative metadata for one shard: where it lives, whether it is
/// healthy, and what it may do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: String,
    pub primary_endpoint: String,
    #[serde(default)]
    pub replica_endpoints: Vec<String>,
    pub datacenter: String,
    #[serde(default)]
    pub rack: String,
    pub token_range_start: u64,
    pub token_range_end: u64,
    pub is_healthy: bool,
    #[serde(default)]
    pub certificate_serial: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl ShardInfo {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Healthy and allowed to perform `cap`.
    pub fn is_usable_for(&self, cap: Capability) -> bool {
        self.is_healthy && self.has_capability(cap)
    }
}

/// Pluggable backing store for the topology. The core does not mandate a
/// technology; the file binding below is the default, an etcd or gossip
/// binding slots in behind the same trait. The ring must be rebuilt from
/// the topology within the caller's refresh interval so lookups never lag
/// membership changes beyond that bound.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    async fn load(&self) -> AppResult<Vec<ShardInfo>>;
    async fn save(&self, shards: &[ShardInfo]) -> AppResult<()>;
}

/// JSON-file topology store. Writes go to a temp file first and are
/// renamed into place so readers never observe a torn file.
pub struct FileTopologyStore {
    path: PathBuf,
}

impl FileTopologyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TopologyStore for FileTopologyStore {
    async fn load(&self) -> AppResult<Vec<ShardInfo>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let shards: Vec<ShardInfo> = serde_json::from_str(&raw)?;
        Ok(shards)
    }

    async fn save(&self, shards: &[ShardInfo]) -> AppResult<()> {
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_string_pretty(shards)
            .map_err(|e| AppError::Internal(format!("Failed to serialize topology: {}", e)))?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Cluster topology: shard id -> ShardInfo under a single exclusive lock.
/// Critical sections are short map operations; refresh/save I/O happens
/// outside the lock.
pub struct ShardTopology {
    shards: Mutex<HashMap<String, ShardInfo>>,
    store: Option<Box<dyn TopologyStore>>,
}

#[derive(Debug, Serialize)]
pub struct TopologyStats {
    pub total_shards: usize,
    pub healthy_shards: usize,
}

impl ShardTopology {
    pub fn new() -> Self {
        Self {
            shards: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_store(store: Box<dyn TopologyStore>) -> Self {
        Self {
            shards: Mutex::new(HashMap::new()),
            store: Some(store),
        }
    }

    /// Add or replace a shard entry.
    pub fn add_shard(&self, shard: ShardInfo) {
        info!("Adding shard {} to topology", shard.shard_id);
        self.shards
            .lock()
            .unwrap()
            .insert(shard.shard_id.clone(), shard);
    }

    pub fn remove_shard(&self, shard_id: &str) {
        warn!("Removing shard {} from topology", shard_id);
        self.shards.lock().unwrap().remove(shard_id);
    }

    pub fn get_shard(&self, shard_id: &str) -> Option<ShardInfo> {
        self.shards.lock().unwrap().get(shard_id).cloned()
    }

    pub fn get_all_shards(&self) -> Vec<ShardInfo> {
        let mut shards: Vec<ShardInfo> = self.shards.lock().unwrap().values().cloned().collect();
        shards.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        shards
    }

    pub fn get_healthy_shards(&self) -> Vec<ShardInfo> {
        self.get_all_shards()
            .into_iter()
            .filter(|s| s.is_healthy)
            .collect()
    }

    pub fn update_health(&self, shard_id: &str, is_healthy: bool) {
        let mut shards = self.shards.lock().unwrap();
        if let Some(info) = shards.get_mut(shard_id) {
            if info.is_healthy != is_healthy {
                info!(
                    "Shard {} health changed: {} -> {}",
                    shard_id, info.is_healthy, is_healthy
                );
            }
            info.is_healthy = is_healthy;
        }
    }

    /// Reload from the backing store, replacing the in-memory map.
    pub async fn refresh(&self) -> AppResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let loaded = store.load().await?;
        let mut shards = self.shards.lock().unwrap();
        shards.clear();
        for shard in loaded {
            shards.insert(shard.shard_id.clone(), shard);
        }
        info!("Topology refreshed: {} shards", shards.len());
        Ok(())
    }

    /// Persist the current map to the backing store.
    pub async fn save(&self) -> AppResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.get_all_shards();
        store.save(&snapshot).await
    }

    pub fn shard_count(&self) -> usize {
        self.shards.lock().unwrap().len()
    }

    pub fn has_shard(&self, shard_id: &str) -> bool {
        self.shards.lock().unwrap().contains_key(shard_id)
    }

    pub fn clear(&self) {
        self.shards.lock().unwrap().clear();
    }

    pub fn stats(&self) -> TopologyStats {
        let shards = self.shards.lock().unwrap();
        TopologyStats {
            total_shards: shards.len(),
            healthy_shards: shards.values().filter(|s| s.is_healthy).count(),
        }
    }
}

impl Default for ShardTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShardTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardTopology")
            .field("shards", &self.shard_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_shard(shard_id: &str, healthy: bool) -> ShardInfo {
    ShardInfo {
        shard_id: shard_id.to_string(),
        primary_endpoint: format!("{}.dc1.themis.local:8443", shard_id.replace('_', "-")),
        replica_endpoints: vec![],
        datacenter: "dc1".to_string(),
        rack: "rack01".to_string(),
        token_range_start: 0,
        token_range_end: u64::MAX,
        is_healthy: healthy,
        certificate_serial: String::new(),
        capabilities: vec![Capability::Read, Capability::Write],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let topology = ShardTopology::new();
        topology.add_shard(test_shard("shard_001", true));
        topology.add_shard(test_shard("shard_002", true));

        assert_eq!(topology.shard_count(), 2);
        assert!(topology.has_shard("shard_001"));
        assert_eq!(
            topology.get_shard("shard_001").unwrap().datacenter,
            "dc1"
        );

        topology.remove_shard("shard_001");
        assert!(!topology.has_shard("shard_001"));
        assert!(topology.get_shard("shard_001").is_none());
    }

    #[test]
    fn test_healthy_subset_of_all() {
        let topology = ShardTopology::new();
        topology.add_shard(test_shard("shard_001", true));
        topology.add_shard(test_shard("shard_002", false));
        topology.add_shard(test_shard("shard_003", true));

        let all = topology.get_all_shards();
        let healthy = topology.get_healthy_shards();
        assert_eq!(all.len(), 3);
        assert_eq!(healthy.len(), 2);
        for shard in &healthy {
            assert!(all.iter().any(|s| s.shard_id == shard.shard_id));
        }
    }

    #[test]
    fn test_update_health() {
        let topology = ShardTopology::new();
        topology.add_shard(test_shard("shard_001", true));
        topology.update_health("shard_001", false);
        assert!(!topology.get_shard("shard_001").unwrap().is_healthy);
        assert!(topology.get_healthy_shards().is_empty());

        // Unknown shard is ignored.
        topology.update_health("shard_404", true);
        assert_eq!(topology.shard_count(), 1);
    }

    #[test]
    fn test_capability_checks() {
        let mut shard = test_shard("shard_001", true);
        assert!(shard.is_usable_for(Capability::Read));
        assert!(!shard.has_capability(Capability::Admin));

        shard.is_healthy = false;
        assert!(!shard.is_usable_for(Capability::Read));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.json");
        let store = FileTopologyStore::new(&path);

        let topology = ShardTopology::with_store(Box::new(FileTopologyStore::new(&path)));
        topology.add_shard(test_shard("shard_001", true));
        topology.add_shard(test_shard("shard_002", false));
        topology.save().await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);

        let reloaded = ShardTopology::with_store(Box::new(FileTopologyStore::new(&path)));
        reloaded.refresh().await.unwrap();
        assert_eq!(reloaded.shard_count(), 2);
        assert!(!reloaded.get_shard("shard_002").unwrap().is_healthy);
    }

    #[tokio::test]
    async fn test_refresh_without_store_is_noop() {
        let topology = ShardTopology::new();
        topology.add_shard(test_shard("shard_001", true));
        topology.refresh().await.unwrap();
        assert_eq!(topology.shard_count(), 1);
    }
}
