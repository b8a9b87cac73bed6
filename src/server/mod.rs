// Shard HTTP surface - the API peers and clients call on this shard
pub mod handlers;
pub mod local_store;

pub use handlers::{create_shard_router, ShardServerState};
pub use local_store::MemoryExecutor;
