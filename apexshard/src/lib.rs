//! ApexShard — shard metadata and chunk routing core
//!
//! Maintains the authoritative map from shard-key ranges (*chunks*) to
//! backend shards for horizontally partitioned document collections.
//! Drives auto-splitting of oversized chunks, migration of chunks between
//! shards, and answers the query planner's "which shards must I contact"
//! question through a coalesced range view.
//!
//! The crate owns metadata only. Actual shard traffic, metadata
//! persistence and the cluster lock service sit behind the traits in
//! [`backend`]; [`mem_cluster::MemCluster`] implements them in-process
//! for embedded deployments and tests.

pub mod backend;
pub mod chunk;
pub mod data;
pub mod hashtab;
pub mod key;
pub mod manager;
pub mod mem_cluster;
pub mod query;
pub mod range;
pub mod topology;

// Re-export main types
pub use backend::{ChunkRecord, ChunkVersion, ClusterEnv, MetaStore, ShardClient};
pub use chunk::{Chunk, ChunkInfo};
pub use data::{Document, Value};
pub use hashtab::{FixedHashTable, TableKey};
pub use key::{ChunkFilter, OrderedKey, ShardKeyPattern};
pub use manager::{ChunkManager, QueryRoute, ShardingCatalog};
pub use mem_cluster::MemCluster;
pub use query::{CompareOp, Predicate};
pub use range::{ChunkRange, ChunkRangeIndex};
pub use topology::{Shard, ShardRegistry};

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for the split/migrate machinery
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Split a chunk once its physical size crosses this many bytes
    pub max_chunk_size: u64,
}

impl ShardingConfig {
    pub fn with_max_chunk_size(mut self, bytes: u64) -> Self {
        self.max_chunk_size = bytes;
        self
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 200 * 1024 * 1024,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Sharding core error type
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cannot split chunk at {0}: does the range hold only one distinct value?")]
    CannotSplit(String),

    #[error("chunk already lives on shard '{0}'")]
    MoveToSelf(String),

    #[error("failed to lock namespace '{ns}' on shard '{shard}'")]
    LockFailed { shard: String, ns: String },

    #[error("'{command}' failed on shard '{shard}': {detail}")]
    Remote {
        shard: String,
        command: String,
        detail: String,
    },

    #[error("sharding metadata inconsistent: {0}")]
    Consistency(String),

    #[error("no shard routing support for query: {0}")]
    UnsupportedQuery(String),

    #[error("document is missing the shard key: {0}")]
    MissingShardKey(String),

    #[error("collection '{0}' is not sharded")]
    NotSharded(String),

    #[error("cluster lock servers not all reachable")]
    LockServersDown,

    #[error("invalid chunk record: {0}")]
    InvalidRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Stable numeric code reported to drivers
    pub fn code(&self) -> u32 {
        match self {
            ClusterError::CannotSplit(_) => 13003,
            ClusterError::MoveToSelf(_) => 10167,
            ClusterError::LockFailed { .. } => 10166,
            ClusterError::Remote { .. } => 10164,
            ClusterError::Consistency(_) => 13141,
            ClusterError::UnsupportedQuery(_) => 13088,
            ClusterError::MissingShardKey(_) => 8011,
            ClusterError::NotSharded(_) => 10176,
            ClusterError::LockServersDown => 10174,
            ClusterError::InvalidRecord(_) => 10170,
            ClusterError::Io(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
