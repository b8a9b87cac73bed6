// Sharding core: addressing, placement, and secure shard-to-shard calls
pub mod certificate; // X.509 shard identity certificates
pub mod hash_ring; // Consistent hash ring with virtual nodes
pub mod mtls_client; // Mutual-TLS HTTP client
pub mod remote_executor; // Signed request execution on remote shards
pub mod resolver; // URN -> shard location
pub mod router; // Operation and query routing
pub mod signed_request; // Envelope signing and replay defense
pub mod topology; // Cluster membership and health
pub mod urn; // Canonical resource names

pub use hash_ring::ConsistentHashRing;
pub use remote_executor::{RemoteDispatch, RemoteExecutor, ShardResult};
pub use resolver::UrnResolver;
pub use router::{LocalExecutor, RouterConfig, RoutingStrategy, ShardRouter};
pub use signed_request::{SignedRequest, SignedRequestSigner, SignedRequestVerifier};
pub use topology::{Capability, ShardInfo, ShardTopology, TopologyStore};
pub use urn::{DataModel, Urn};
