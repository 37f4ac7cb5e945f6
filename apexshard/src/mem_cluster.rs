//! In-process cluster backend
//!
//! `MemCluster` implements all three backend traits over in-memory
//! per-shard document stores. It is the backend for embedded single-process
//! deployments and the deterministic double for tests: versions are
//! assigned from a monotonic counter standing in for the config server's
//! timestamps, chunk transfers actually move documents between shard
//! stores, and a held namespace lock makes a second acquisition fail.
//!
//! The chunk catalog can be snapshotted to disk and loaded back, so an
//! embedded cluster survives restarts.

use std::path::Path;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::{
    ChangeEvent, ChunkRecord, ChunkVersion, ClusterLock, FinishToken, MetaStore, ShardClient,
};
use crate::data::Document;
use crate::key::{ChunkFilter, ShardKeyPattern};
use crate::topology::Shard;
use crate::{ClusterError, Result};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone)]
struct PendingMove {
    from: String,
    to: String,
    ns: String,
    pattern: ShardKeyPattern,
    filter: ChunkFilter,
}

#[derive(Default)]
struct ClusterState {
    /// shard name → namespace → documents
    docs: AHashMap<String, AHashMap<String, Vec<Document>>>,
    /// chunk records by id
    chunks: AHashMap<String, ChunkRecord>,
    /// namespaces with sharding metadata
    sharded: AHashSet<String>,
    /// next version to hand out; versions only grow
    next_version: ChunkVersion,
    changes: Vec<ChangeEvent>,
    held_locks: AHashSet<(String, String)>,
    pending_moves: AHashMap<u64, PendingMove>,
    next_token: u64,
    /// (shard, ns) pairs with the shard-key index ensured
    indexes: AHashSet<(String, String)>,
    /// last version pushed to each (shard, ns), with the authoritative flag
    shard_versions: AHashMap<(String, String), (ChunkVersion, bool)>,
    up: bool,
}

/// In-memory cluster: shard stores, metadata store and lock service in one
pub struct MemCluster {
    state: Mutex<ClusterState>,
}

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                next_version: 1,
                next_token: 1,
                up: true,
                ..Default::default()
            }),
        }
    }

    // ========================================================================
    // Shard stores
    // ========================================================================

    /// Put a document on a shard, bypassing routing (test setup / ingest)
    pub fn insert_doc(&self, shard: &Shard, ns: &str, doc: Document) {
        let mut state = self.state.lock();
        state
            .docs
            .entry(shard.name().to_string())
            .or_default()
            .entry(ns.to_string())
            .or_default()
            .push(doc);
    }

    pub fn docs_on(&self, shard: &Shard, ns: &str) -> Vec<Document> {
        self.state
            .lock()
            .docs
            .get(shard.name())
            .and_then(|m| m.get(ns))
            .cloned()
            .unwrap_or_default()
    }

    /// Recorded change-log events, oldest first
    pub fn changes(&self) -> Vec<ChangeEvent> {
        self.state.lock().changes.clone()
    }

    pub fn shard_version(&self, shard: &Shard, ns: &str) -> Option<(ChunkVersion, bool)> {
        self.state
            .lock()
            .shard_versions
            .get(&(shard.name().to_string(), ns.to_string()))
            .copied()
    }

    pub fn has_index(&self, shard: &Shard, ns: &str) -> bool {
        self.state
            .lock()
            .indexes
            .contains(&(shard.name().to_string(), ns.to_string()))
    }

    /// Mark the lock servers unreachable (drives the all-up failure path)
    pub fn set_up(&self, up: bool) {
        self.state.lock().up = up;
    }

    fn keys_on(
        state: &ClusterState,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
    ) -> Vec<Document> {
        let mut keys: Vec<Document> = state
            .docs
            .get(shard.name())
            .and_then(|m| m.get(ns))
            .map(|docs| docs.iter().filter_map(|d| pattern.extract_key(d)).collect())
            .unwrap_or_default();
        keys.sort_by(|a, b| pattern.compare(a, b));
        keys
    }

    // ========================================================================
    // Catalog snapshots
    // ========================================================================

    /// Write the chunk catalog to disk
    pub fn save_catalog(&self, path: &Path) -> Result<()> {
        let state = self.state.lock();
        let mut chunks: Vec<ChunkRecord> = state.chunks.values().cloned().collect();
        chunks.sort_by(|a, b| a.id.cmp(&b.id));
        let snapshot = CatalogSnapshot {
            chunks,
            sharded: state.sharded.iter().cloned().collect(),
            next_version: state.next_version,
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| ClusterError::InvalidRecord(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a catalog written by `save_catalog`; a missing file yields a
    /// fresh cluster
    pub fn load_catalog(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path)?;
        let snapshot: CatalogSnapshot =
            bincode::deserialize(&bytes).map_err(|e| ClusterError::InvalidRecord(e.to_string()))?;

        let cluster = Self::new();
        {
            let mut state = cluster.state.lock();
            for record in snapshot.chunks {
                record.validate()?;
                state.chunks.insert(record.id.clone(), record);
            }
            state.sharded = snapshot.sharded.into_iter().collect();
            state.next_version = snapshot.next_version;
        }
        Ok(cluster)
    }
}

#[derive(Serialize, Deserialize)]
struct CatalogSnapshot {
    chunks: Vec<ChunkRecord>,
    sharded: Vec<String>,
    next_version: ChunkVersion,
}

fn remote(shard: &Shard, command: &str, detail: impl Into<String>) -> ClusterError {
    ClusterError::Remote {
        shard: shard.name().to_string(),
        command: command.to_string(),
        detail: detail.into(),
    }
}

// ============================================================================
// ShardClient
// ============================================================================

impl ShardClient for MemCluster {
    fn first_key(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        reverse: bool,
    ) -> Result<Option<Document>> {
        let state = self.state.lock();
        let keys = Self::keys_on(&state, shard, ns, pattern);
        Ok(if reverse {
            keys.last().cloned()
        } else {
            keys.first().cloned()
        })
    }

    fn first_key_above(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        after: &Document,
    ) -> Result<Option<Document>> {
        let field = pattern.first_field();
        let floor = after
            .get(field)
            .ok_or_else(|| remote(shard, "find", format!("key is missing '{}'", field)))?;
        let state = self.state.lock();
        let keys = Self::keys_on(&state, shard, ns, pattern);
        Ok(keys
            .into_iter()
            .find(|k| k.get(field).map(|v| v > floor).unwrap_or(false)))
    }

    fn median_key(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        min: &Document,
        max: &Document,
    ) -> Result<Document> {
        let filter = pattern.filter(min, max);
        let state = self.state.lock();
        let keys: Vec<Document> = Self::keys_on(&state, shard, ns, pattern)
            .into_iter()
            .filter(|k| filter.matches(pattern, k))
            .collect();
        // an empty range reports its lower bound, like the server command
        Ok(keys
            .get(keys.len() / 2)
            .cloned()
            .unwrap_or_else(|| min.clone()))
    }

    fn data_size(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        min: &Document,
        max: &Document,
        max_size: u64,
    ) -> Result<u64> {
        let filter = pattern.filter(min, max);
        let state = self.state.lock();
        let mut total = 0u64;
        if let Some(docs) = state.docs.get(shard.name()).and_then(|m| m.get(ns)) {
            for doc in docs {
                if filter.matches(pattern, doc) {
                    total += bincode::serialized_size(doc)
                        .map_err(|e| remote(shard, "datasize", e.to_string()))?;
                    if total > max_size {
                        return Ok(max_size);
                    }
                }
            }
        }
        Ok(total)
    }

    fn count_range(
        &self,
        shard: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        filter: &ChunkFilter,
    ) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .docs
            .get(shard.name())
            .and_then(|m| m.get(ns))
            .map(|docs| docs.iter().filter(|d| filter.matches(pattern, d)).count() as u64)
            .unwrap_or(0))
    }

    fn move_chunk_start(
        &self,
        from: &Shard,
        to: &Shard,
        ns: &str,
        pattern: &ShardKeyPattern,
        filter: &ChunkFilter,
    ) -> Result<FinishToken> {
        if from == to {
            return Err(remote(from, "movechunk.start", "source equals target"));
        }
        let mut state = self.state.lock();
        let token = state.next_token;
        state.next_token += 1;
        state.pending_moves.insert(
            token,
            PendingMove {
                from: from.name().to_string(),
                to: to.name().to_string(),
                ns: ns.to_string(),
                pattern: pattern.clone(),
                filter: filter.clone(),
            },
        );
        Ok(FinishToken::new(token))
    }

    fn move_chunk_finish(
        &self,
        from: &Shard,
        to: &Shard,
        ns: &str,
        new_version: ChunkVersion,
        token: FinishToken,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let pending = state
            .pending_moves
            .remove(&token.value())
            .ok_or_else(|| remote(from, "movechunk.finish", "unknown finish token"))?;
        if pending.from != from.name() || pending.to != to.name() || pending.ns != ns {
            return Err(remote(
                from,
                "movechunk.finish",
                "finish token does not match the transfer",
            ));
        }

        let moved: Vec<Document> = {
            let source = state
                .docs
                .entry(pending.from.clone())
                .or_default()
                .entry(pending.ns.clone())
                .or_default();
            let (keep, moved): (Vec<Document>, Vec<Document>) = source
                .drain(..)
                .partition(|d| !pending.filter.matches(&pending.pattern, d));
            *source = keep;
            moved
        };
        state
            .docs
            .entry(pending.to.clone())
            .or_default()
            .entry(pending.ns.clone())
            .or_default()
            .extend(moved);

        state
            .shard_versions
            .insert((pending.from, pending.ns), (new_version, false));
        Ok(())
    }

    fn ensure_index(
        &self,
        shard: &Shard,
        ns: &str,
        _pattern: &ShardKeyPattern,
        _unique: bool,
    ) -> Result<()> {
        self.state
            .lock()
            .indexes
            .insert((shard.name().to_string(), ns.to_string()));
        Ok(())
    }

    fn drop_collection(&self, shard: &Shard, ns: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(m) = state.docs.get_mut(shard.name()) {
            m.remove(ns);
        }
        Ok(())
    }

    fn set_shard_version(
        &self,
        shard: &Shard,
        ns: &str,
        version: ChunkVersion,
        authoritative: bool,
    ) -> Result<()> {
        self.state.lock().shard_versions.insert(
            (shard.name().to_string(), ns.to_string()),
            (version, authoritative),
        );
        Ok(())
    }
}

// ============================================================================
// MetaStore
// ============================================================================

impl MetaStore for MemCluster {
    fn load_chunks(&self, ns: &str) -> Result<Vec<ChunkRecord>> {
        let state = self.state.lock();
        let mut records: Vec<ChunkRecord> = state
            .chunks
            .values()
            .filter(|r| r.ns == ns)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn load_chunk(&self, id: &str) -> Result<Option<ChunkRecord>> {
        Ok(self.state.lock().chunks.get(id).cloned())
    }

    fn save_chunk(&self, record: &ChunkRecord) -> Result<ChunkVersion> {
        record.validate()?;
        let mut state = self.state.lock();
        let version = if record.lastmod == 0 {
            let v = state.next_version;
            state.next_version += 1;
            v
        } else {
            record.lastmod
        };
        let mut stored = record.clone();
        stored.lastmod = version;
        state.sharded.insert(stored.ns.clone());
        state.chunks.insert(stored.id.clone(), stored);
        Ok(version)
    }

    fn remove_chunks(&self, ns: &str) -> Result<()> {
        self.state.lock().chunks.retain(|_, r| r.ns != ns);
        Ok(())
    }

    fn remove_sharding(&self, ns: &str) -> Result<bool> {
        Ok(self.state.lock().sharded.remove(ns))
    }

    fn log_change(&self, what: &str, ns: &str, details: Document) -> Result<()> {
        self.state.lock().changes.push(ChangeEvent {
            what: what.to_string(),
            ns: ns.to_string(),
            details,
            at: chrono::Utc::now().timestamp(),
        });
        Ok(())
    }
}

// ============================================================================
// ClusterLock
// ============================================================================

impl ClusterLock for MemCluster {
    fn try_lock_namespace(&self, shard: &Shard, ns: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state
            .held_locks
            .insert((shard.name().to_string(), ns.to_string()))
        {
            return Err(ClusterError::LockFailed {
                shard: shard.name().to_string(),
                ns: ns.to_string(),
            });
        }
        Ok(())
    }

    fn release_namespace(&self, shard: &Shard, ns: &str) {
        self.state
            .lock()
            .held_locks
            .remove(&(shard.name().to_string(), ns.to_string()));
    }

    fn all_up(&self) -> bool {
        self.state.lock().up
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    fn record(id: &str, min: i64, max: i64) -> ChunkRecord {
        ChunkRecord {
            id: id.into(),
            lastmod: 0,
            ns: "t.c".into(),
            min: Some(Document::new().with("a", min)),
            max: Some(Document::new().with("a", max)),
            min_dotted: None,
            max_dotted: None,
            shard: "rs0".into(),
        }
    }

    #[test]
    fn test_versions_strictly_increase() {
        let cluster = MemCluster::new();
        let v1 = cluster.save_chunk(&record("t.c-a_0", 0, 10)).unwrap();
        let v2 = cluster.save_chunk(&record("t.c-a_10", 10, 20)).unwrap();
        assert!(v2 > v1);

        // a record that already has a version keeps it
        let mut r = record("t.c-a_0", 0, 10);
        r.lastmod = v1;
        assert_eq!(cluster.save_chunk(&r).unwrap(), v1);
    }

    #[test]
    fn test_lock_contention() {
        let cluster = MemCluster::new();
        let rs0 = Shard::new("rs0");
        cluster.try_lock_namespace(&rs0, "t.c").unwrap();
        assert!(matches!(
            cluster.try_lock_namespace(&rs0, "t.c"),
            Err(ClusterError::LockFailed { .. })
        ));
        cluster.release_namespace(&rs0, "t.c");
        cluster.try_lock_namespace(&rs0, "t.c").unwrap();
    }

    #[test]
    fn test_move_chunk_transfers_documents() {
        let cluster = MemCluster::new();
        let rs0 = Shard::new("rs0");
        let rs1 = Shard::new("rs1");
        let pattern = ShardKeyPattern::on("a");
        for i in 0..10 {
            cluster.insert_doc(&rs0, "t.c", Document::new().with("a", i));
        }

        let filter = pattern.filter(
            &Document::new().with("a", 5),
            &Document::new().with("a", 10),
        );
        let token = cluster
            .move_chunk_start(&rs0, &rs1, "t.c", &pattern, &filter)
            .unwrap();
        cluster
            .move_chunk_finish(&rs0, &rs1, "t.c", 9, token)
            .unwrap();

        assert_eq!(cluster.docs_on(&rs0, "t.c").len(), 5);
        assert_eq!(cluster.docs_on(&rs1, "t.c").len(), 5);
        assert_eq!(cluster.shard_version(&rs0, "t.c"), Some((9, false)));
        assert!(cluster
            .docs_on(&rs1, "t.c")
            .iter()
            .all(|d| d.get("a").unwrap() >= &Value::Int(5)));
    }

    #[test]
    fn test_finish_token_must_match() {
        let cluster = MemCluster::new();
        let rs0 = Shard::new("rs0");
        let rs1 = Shard::new("rs1");
        let rs2 = Shard::new("rs2");
        let pattern = ShardKeyPattern::on("a");
        let filter = pattern.filter(
            &Document::new().with("a", 0),
            &Document::new().with("a", 10),
        );
        let token = cluster
            .move_chunk_start(&rs0, &rs1, "t.c", &pattern, &filter)
            .unwrap();
        assert!(cluster
            .move_chunk_finish(&rs0, &rs2, "t.c", 9, token.clone())
            .is_err());
        // the bad finish consumed the token
        assert!(cluster.move_chunk_finish(&rs0, &rs1, "t.c", 9, token).is_err());
    }

    #[test]
    fn test_catalog_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.bin");

        let cluster = MemCluster::new();
        cluster.save_chunk(&record("t.c-a_0", 0, 10)).unwrap();
        cluster.save_chunk(&record("t.c-a_10", 10, 20)).unwrap();
        cluster.save_catalog(&path).unwrap();

        let restored = MemCluster::load_catalog(&path).unwrap();
        let records = restored.load_chunks("t.c").unwrap();
        assert_eq!(records.len(), 2);
        // versions keep increasing after a reload
        let v = restored.save_chunk(&record("t.c-a_20", 20, 30)).unwrap();
        assert!(v > records.iter().map(|r| r.lastmod).max().unwrap());
    }

    #[test]
    fn test_load_catalog_missing_file_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = MemCluster::load_catalog(&dir.path().join("none.bin")).unwrap();
        assert!(cluster.load_chunks("t.c").unwrap().is_empty());
    }

    #[test]
    fn test_change_log_records_events() {
        let cluster = MemCluster::new();
        cluster
            .log_change("split", "t.c", Document::new().with("at", 5))
            .unwrap();
        let changes = cluster.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].what, "split");
        assert_eq!(changes[0].ns, "t.c");
    }
}
