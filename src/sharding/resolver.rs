use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::sharding::hash_ring::ConsistentHashRing;
use crate::sharding::topology::{ShardInfo, ShardTopology};
use crate::sharding::urn::Urn;

/// Maps URNs to shard locations: ring for placement, topology for
/// endpoints. The two change at different rates, the ring with
/// resharding and the topology with health flaps, so they stay split.
pub struct UrnResolver {
    topology: Arc<ShardTopology>,
    hash_ring: Arc<ConsistentHashRing>,
    local_shard_id: String,
}

impl UrnResolver {
    pub fn new(
        topology: Arc<ShardTopology>,
        hash_ring: Arc<ConsistentHashRing>,
        local_shard_id: impl Into<String>,
    ) -> Self {
        Self {
            topology,
            hash_ring,
            local_shard_id: local_shard_id.into(),
        }
    }

    /// Primary shard owning `urn`.
    pub fn resolve_primary(&self, urn: &Urn) -> AppResult<ShardInfo> {
        let shard_id = self
            .hash_ring
            .shard_for_urn(urn)
            .ok_or(AppError::RingEmpty)?;
        self.topology
            .get_shard(&shard_id)
            .ok_or(AppError::TopologyMiss(shard_id))
    }

    /// Primary plus up to `replica_count` healthy successor shards,
    /// all distinct. Unhealthy successors are skipped, so fewer entries
    /// come back when the cluster is degraded.
    pub fn resolve_replicas(&self, urn: &Urn, replica_count: usize) -> Vec<ShardInfo> {
        let Ok(primary) = self.resolve_primary(urn) else {
            return Vec::new();
        };
        let primary_id = primary.shard_id.clone();
        let mut result = vec![primary];

        // Walk far enough past the primary that skipped unhealthy shards
        // still leave `replica_count` candidates.
        let candidates = self
            .hash_ring
            .successors(urn.hash(), replica_count + 1 + self.topology.shard_count());

        for shard_id in candidates {
            if result.len() > replica_count {
                break;
            }
            if shard_id == primary_id {
                continue;
            }
            if let Some(info) = self.topology.get_shard(&shard_id) {
                if info.is_healthy {
                    result.push(info);
                }
            }
        }

        result
    }

    /// True when this node is the primary for `urn`.
    pub fn is_local(&self, urn: &Urn) -> bool {
        if self.local_shard_id.is_empty() {
            return false;
        }
        self.hash_ring
            .shard_for_urn(urn)
            .map(|id| id == self.local_shard_id)
            .unwrap_or(false)
    }

    /// Shard id only, skipping the topology lookup.
    pub fn get_shard_id(&self, urn: &Urn) -> Option<String> {
        self.hash_ring.shard_for_urn(urn)
    }

    pub fn get_all_shards(&self) -> Vec<ShardInfo> {
        self.topology.get_all_shards()
    }

    pub fn get_healthy_shards(&self) -> Vec<ShardInfo> {
        self.topology.get_healthy_shards()
    }

    pub async fn refresh_topology(&self) -> AppResult<()> {
        self.topology.refresh().await
    }

    pub fn local_shard_id(&self) -> &str {
        &self.local_shard_id
    }

    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    pub fn hash_ring(&self) -> &Arc<ConsistentHashRing> {
        &self.hash_ring
    }
}

impl std::fmt::Debug for UrnResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrnResolver")
            .field("local_shard_id", &self.local_shard_id)
            .finish()
    }
}
