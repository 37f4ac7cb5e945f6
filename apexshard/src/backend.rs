//! Backend contracts
//!
//! The chunk core never speaks a wire protocol itself. Three traits stand
//! in for its collaborators: `ShardClient` (commands against a backend
//! shard), `MetaStore` (the cluster metadata store holding chunk records
//! and the change log) and `ClusterLock` (the cluster-wide namespace lock
//! service). `mem_cluster` implements all three in-process.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::Document;
use crate::key::{ChunkFilter, ShardKeyPattern};
use crate::topology::{Shard, ShardRegistry};
use crate::{ClusterError, Result, ShardingConfig};

/// Chunk version, a monotonic timestamp assigned by the metadata store.
/// Zero means "not persisted yet" (or cleared, forcing reassignment).
pub type ChunkVersion = u64;

// ============================================================================
// Persisted chunk record
// ============================================================================

/// One chunk document as persisted in the metadata store
///
/// `min`/`max` are the canonical bound fields. Records written by old
/// releases carry `minDotted`/`maxDotted` instead; `bounds()` normalizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub lastmod: ChunkVersion,
    pub ns: String,
    #[serde(default)]
    pub min: Option<Document>,
    #[serde(default)]
    pub max: Option<Document>,
    #[serde(rename = "minDotted", default)]
    pub min_dotted: Option<Document>,
    #[serde(rename = "maxDotted", default)]
    pub max_dotted: Option<Document>,
    pub shard: String,
}

impl ChunkRecord {
    /// Extract the chunk bounds, accepting the dotted legacy layout
    pub fn bounds(&self) -> Result<(Document, Document)> {
        let (min, max) = if let Some(min) = &self.min_dotted {
            (Some(min), self.max_dotted.as_ref())
        } else {
            (self.min.as_ref(), self.max.as_ref())
        };
        match (min, max) {
            (Some(min), Some(max)) if !min.is_empty() && !max.is_empty() => {
                Ok((min.clone(), max.clone()))
            }
            _ => Err(ClusterError::InvalidRecord(format!(
                "chunk '{}' needs min and max bounds",
                self.id
            ))),
        }
    }

    /// Reject records missing required fields
    pub fn validate(&self) -> Result<()> {
        if self.ns.is_empty() {
            return Err(ClusterError::InvalidRecord(format!(
                "chunk '{}' needs a namespace",
                self.id
            )));
        }
        if self.shard.is_empty() {
            return Err(ClusterError::InvalidRecord(format!(
                "chunk '{}' needs a shard",
                self.id
            )));
        }
        self.bounds().map(|_| ())
    }
}

/// One audit entry in the change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub what: String,
    pub ns: String,
    pub details: Document,
    /// Wall-clock seconds when the event was recorded
    pub at: i64,
}

/// Opaque handle returned by `move_chunk_start` and required to finish
/// the transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishToken(u64);

impl FinishToken {
    pub fn new(token: u64) -> Self {
        Self(token)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Commands the core issues against a backend shard
pub trait ShardClient: Send + Sync {
    /// Extracted key of the first document in shard-key order
    /// (reverse order probes the top end of the collection)
    fn first_key(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        reverse: bool,
    ) -> Result<Option<Document>>;

    /// Extracted key of the first document whose first key field is
    /// strictly above `after`'s, in shard-key order
    fn first_key_above(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        after: &Document,
    ) -> Result<Option<Document>>;

    /// The backend's `median_key` command over `[min, max)`
    fn median_key(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        min: &Document,
        max: &Document,
    ) -> Result<Document>;

    /// Physical size of the range in bytes, capped at `max_size`
    fn data_size(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        min: &Document,
        max: &Document,
        max_size: u64,
    ) -> Result<u64>;

    /// Number of documents in the range
    fn count_range(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        filter: &ChunkFilter,
    ) -> Result<u64>;

    /// Phase one of a chunk transfer; the source starts copying
    fn move_chunk_start(
        &self,
        from: &Shard,
        to: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        filter: &ChunkFilter,
    ) -> Result<FinishToken>;

    /// Phase two; the source hands off ownership at `new_version`
    fn move_chunk_finish(
        &self,
        from: &Shard,
        to: &Shard,
        ns: &str,
        new_version: ChunkVersion,
        token: FinishToken,
    ) -> Result<()>;

    /// Idempotent per shard
    fn ensure_index(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        unique: bool,
    ) -> Result<()>;

    fn drop_collection(&self, shard: &Shard, ns: &str) -> Result<()>;

    fn set_shard_version(
        &self,
        shard: &Shard,
        ns: &str,
        version: ChunkVersion,
        authoritative: bool,
    ) -> Result<()>;
}

/// The cluster metadata store (`config.chunks` plus the change log)
pub trait MetaStore: Send + Sync {
    fn load_chunks(&self, ns: &str) -> Result<Vec<ChunkRecord>>;

    fn load_chunk(&self, id: &str) -> Result<Option<ChunkRecord>>;

    /// Persist one record. A record arriving with `lastmod == 0` is
    /// assigned a fresh version, strictly above every version assigned
    /// before. Returns the stored version.
    fn save_chunk(&self, record: &ChunkRecord) -> Result<ChunkVersion>;

    fn remove_chunks(&self, ns: &str) -> Result<()>;

    /// Drop the sharding entry for a namespace; false if none existed
    fn remove_sharding(&self, ns: &str) -> Result<bool>;

    fn log_change(&self, what: &str, ns: &str, details: Document) -> Result<()>;
}

/// The cluster-wide namespace lock service
pub trait ClusterLock: Send + Sync {
    /// Non-blocking acquisition; `LockFailed` if already held
    fn try_lock_namespace(&self, shard: &Shard, ns: &str) -> Result<()>;

    fn release_namespace(&self, shard: &Shard, ns: &str);

    /// Whether every lock server is reachable
    fn all_up(&self) -> bool;
}

// ============================================================================
// Lock guard
// ============================================================================

/// Holds a namespace lock on one shard; released on drop
pub struct NamespaceGuard {
    locks: Arc<dyn ClusterLock>,
    shard: Shard,
    ns: String,
}

impl NamespaceGuard {
    pub fn acquire(locks: Arc<dyn ClusterLock>, shard: &Shard, ns: &str) -> Result<Self> {
        locks.try_lock_namespace(shard, ns)?;
        Ok(Self {
            locks,
            shard: shard.clone(),
            ns: ns.to_string(),
        })
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        self.locks.release_namespace(&self.shard, &self.ns);
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Everything a chunk manager needs to reach the outside world
#[derive(Clone)]
pub struct ClusterEnv {
    pub client: Arc<dyn ShardClient>,
    pub meta: Arc<dyn MetaStore>,
    pub locks: Arc<dyn ClusterLock>,
    pub shards: Arc<ShardRegistry>,
    pub settings: ShardingConfig,
}

// ============================================================================
// Tests
// ============================================================================
