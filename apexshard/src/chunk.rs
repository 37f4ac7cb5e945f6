//! Chunk — one half-open shard-key range living on one shard
//!
//! A chunk is the unit of splitting and migration. It owns no documents;
//! it records that every document whose shard key falls in `[min, max)`
//! belongs to one backend shard. Chunks are held and mutated by their
//! `ChunkManager` under its reader/writer lock; the methods here are the
//! chunk-local pieces: containment, persistence, split-point selection and
//! the backend queries that size a range.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{ChunkRecord, ChunkVersion, MetaStore, ShardClient};
use crate::data::Document;
use crate::key::{ChunkFilter, OrderedKey, ShardKeyPattern};
use crate::topology::Shard;
use crate::{ClusterError, Result};

/// Ordered chunk storage, keyed by each chunk's max bound so that
/// `upper_bound(key)` yields the unique chunk containing `key`
pub type ChunkMap = std::collections::BTreeMap<OrderedKey, Chunk>;

// ============================================================================
// Chunk
// ============================================================================

/// One `[min, max)` range of the shard-key space, resident on one shard
#[derive(Debug)]
pub struct Chunk {
    pub(crate) ns: String,
    pub(crate) min: Document,
    pub(crate) max: Document,
    pub(crate) shard: Shard,
    /// Version assigned by the metadata store; 0 until persisted
    pub(crate) lastmod: ChunkVersion,
    /// Dirty flag: the record must be written on the next manager save
    pub(crate) modified: bool,
    /// Bytes written into the range since the last autosplit check
    pub(crate) data_written: AtomicU64,
}

impl Clone for Chunk {
    fn clone(&self) -> Self {
        Self {
            ns: self.ns.clone(),
            min: self.min.clone(),
            max: self.max.clone(),
            shard: self.shard.clone(),
            lastmod: self.lastmod,
            modified: self.modified,
            data_written: AtomicU64::new(self.data_written.load(Ordering::SeqCst)),
        }
    }
}

impl Chunk {
    pub fn new(ns: &str, min: Document, max: Document, shard: Shard) -> Self {
        Self {
            ns: ns.to_string(),
            min,
            max,
            shard,
            lastmod: 0,
            modified: false,
            data_written: AtomicU64::new(0),
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn min(&self) -> &Document {
        &self.min
    }

    pub fn max(&self) -> &Document {
        &self.max
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn lastmod(&self) -> ChunkVersion {
        self.lastmod
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Deterministic record id, derived from namespace and lower bound
    pub fn gen_id(ns: &str, min: &Document) -> String {
        let mut id = format!("{}-", ns);
        for (name, value) in min.iter() {
            id.push_str(name);
            id.push('_');
            id.push_str(&value.to_string());
        }
        id
    }

    pub fn id(&self) -> String {
        Self::gen_id(&self.ns, &self.min)
    }

    // ========================================================================
    // Containment
    // ========================================================================

    /// Whether the document's shard key falls inside `[min, max)`
    pub fn contains(&self, pattern: &ShardKeyPattern, doc: &Document) -> bool {
        self.filter(pattern).matches(pattern, doc)
    }

    /// Server-side predicate selecting exactly this chunk's documents
    pub fn filter(&self, pattern: &ShardKeyPattern) -> ChunkFilter {
        pattern.filter(&self.min, &self.max)
    }

    pub fn min_is_inf(&self, pattern: &ShardKeyPattern) -> bool {
        pattern.compare(&pattern.global_min(), &self.min) == std::cmp::Ordering::Equal
    }

    pub fn max_is_inf(&self, pattern: &ShardKeyPattern) -> bool {
        pattern.compare(&self.max, &pattern.global_max()) == std::cmp::Ordering::Equal
    }

    /// Range equality under the pattern (shard and version ignored)
    pub fn same_range(&self, pattern: &ShardKeyPattern, other: &Chunk) -> bool {
        pattern.compare(&self.min, &other.min) == std::cmp::Ordering::Equal
            && pattern.compare(&self.max, &other.max) == std::cmp::Ordering::Equal
    }

    /// The `{min, max}` summary embedded in change-log events
    pub fn short_version(&self) -> Document {
        Document::new()
            .with("min", self.min.clone())
            .with("max", self.max.clone())
    }

    // ========================================================================
    // Write accounting
    // ========================================================================

    /// Accumulate bytes written into the range; returns the running total
    pub fn note_written(&self, bytes: u64) -> u64 {
        self.data_written.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    pub fn reset_data_written(&self) {
        self.data_written.store(0, Ordering::SeqCst);
    }

    // ========================================================================
    // Dirty tracking
    // ========================================================================

    /// Mark the chunk for persistence. Clearing `lastmod` makes the store
    /// assign a fresh version on the next save; that is what advances the
    /// shard version after splits and migrations.
    pub(crate) fn mark_modified(&mut self) {
        self.modified = true;
        self.lastmod = 0;
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn serialize(&self) -> ChunkRecord {
        ChunkRecord {
            id: self.id(),
            lastmod: self.lastmod,
            ns: self.ns.clone(),
            min: Some(self.min.clone()),
            max: Some(self.max.clone()),
            min_dotted: None,
            max_dotted: None,
            shard: self.shard.name().to_string(),
        }
    }

    pub fn unserialize(record: &ChunkRecord) -> Result<Self> {
        record.validate()?;
        let (min, max) = record.bounds()?;
        Ok(Self {
            ns: record.ns.clone(),
            min,
            max,
            shard: Shard::new(&record.shard),
            lastmod: record.lastmod,
            modified: false,
            data_written: AtomicU64::new(0),
        })
    }

    /// Persist the record. A chunk saved with `lastmod == 0` picks up the
    /// version the store assigned; with `check` the record is read back and
    /// must be content-identical with a stable id.
    pub(crate) fn save(&mut self, meta: &dyn MetaStore, check: bool) -> Result<ChunkVersion> {
        let needs_reload = self.lastmod == 0;
        let record = self.serialize();
        let assigned = meta.save_chunk(&record)?;

        if needs_reload {
            self.lastmod = assigned;
            if check {
                let id = record.id.clone();
                let loaded = meta.load_chunk(&id)?.ok_or_else(|| {
                    ClusterError::Consistency(format!("chunk '{}' vanished after save", id))
                })?;
                if loaded.id != id {
                    return Err(ClusterError::Consistency(format!(
                        "chunk id changed on save: '{}' became '{}'",
                        id, loaded.id
                    )));
                }
                if loaded.lastmod != assigned {
                    return Err(ClusterError::Consistency(format!(
                        "chunk '{}' version changed on reload: {} != {}",
                        id, loaded.lastmod, assigned
                    )));
                }
                let reread = Chunk::unserialize(&loaded)?;
                if reread.ns != self.ns
                    || reread.min != self.min
                    || reread.max != self.max
                    || reread.shard != self.shard
                {
                    return Err(ClusterError::Consistency(format!(
                        "chunk '{}' content changed on reload",
                        id
                    )));
                }
            }
        }

        self.modified = false;
        Ok(self.lastmod)
    }

    // ========================================================================
    // Backend queries
    // ========================================================================

    /// Choose where to split this chunk.
    ///
    /// A chunk with exactly one unbounded end is split right at the first
    /// key from that end, keeping the edge chunk small. Everything else
    /// splits at the backend's median; a median equal to `min` (heavy skew
    /// onto the lower bound) steps to the next distinct first-field key.
    /// The returned document is empty when no usable point exists.
    pub fn pick_split_point(
        &self,
        client: &dyn ShardClient,
        pattern: &ShardKeyPattern,
    ) -> Result<Document> {
        let min_inf = self.min_is_inf(pattern);
        let max_inf = self.max_is_inf(pattern);
        if min_inf != max_inf {
            if let Some(key) = client.first_key(&self.shard, &self.ns, pattern, max_inf)? {
                return Ok(key);
            }
        }

        let median = client.median_key(&self.shard, &self.ns, pattern, &self.min, &self.max)?;
        if pattern.compare(&median, &self.min) == std::cmp::Ordering::Equal {
            let stepped = client.first_key_above(&self.shard, &self.ns, pattern, &self.min)?;
            return Ok(stepped.unwrap_or_default());
        }
        Ok(median)
    }

    /// Physical size of the range in bytes, capped just above the split
    /// threshold so the backend can stop counting early
    pub fn physical_size(
        &self,
        client: &dyn ShardClient,
        pattern: &ShardKeyPattern,
        max_chunk_size: u64,
    ) -> Result<u64> {
        client.data_size(
            &self.shard,
            &self.ns,
            pattern,
            &self.min,
            &self.max,
            max_chunk_size + 1,
        )
    }

    pub fn count_objects(
        &self,
        client: &dyn ShardClient,
        pattern: &ShardKeyPattern,
    ) -> Result<u64> {
        client.count_range(&self.shard, &self.ns, pattern, &self.filter(pattern))
    }
}

// ============================================================================
// ChunkInfo
// ============================================================================

/// Read-only snapshot of a chunk, handed to callers outside the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub ns: String,
    pub min: Document,
    pub max: Document,
    pub shard: Shard,
    pub lastmod: ChunkVersion,
}

impl From<&Chunk> for ChunkInfo {
    fn from(c: &Chunk) -> Self {
        Self {
            ns: c.ns.clone(),
            min: c.min.clone(),
            max: c.max.clone(),
            shard: c.shard.clone(),
            lastmod: c.lastmod,
        }
    }
}

impl fmt::Display for ChunkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ns: {} shard: {} min: {} max: {}",
            self.ns, self.shard, self.min, self.max
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;
    use crate::mem_cluster::MemCluster;
    use std::sync::Arc;

    fn key() -> ShardKeyPattern {
        ShardKeyPattern::on("a")
    }

    fn chunk(min: i64, max: i64) -> Chunk {
        Chunk::new(
            "t.c",
            Document::new().with("a", min),
            Document::new().with("a", max),
            Shard::new("rs0"),
        )
    }

    #[test]
    fn test_contains_half_open() {
        let c = chunk(0, 100);
        let k = key();
        assert!(c.contains(&k, &Document::new().with("a", 0)));
        assert!(c.contains(&k, &Document::new().with("a", 99).with("b", 1)));
        assert!(!c.contains(&k, &Document::new().with("a", 100)));
        assert!(!c.contains(&k, &Document::new().with("a", -1)));
    }

    #[test]
    fn test_sentinel_detection() {
        let k = key();
        let edge = Chunk::new(
            "t.c",
            k.global_min(),
            Document::new().with("a", 10),
            Shard::new("rs0"),
        );
        assert!(edge.min_is_inf(&k));
        assert!(!edge.max_is_inf(&k));
        assert!(!chunk(0, 10).min_is_inf(&k));
    }

    #[test]
    fn test_gen_id_distinguishes_ns_and_min() {
        let a = Chunk::gen_id("t.c", &Document::new().with("a", 0));
        let b = Chunk::gen_id("t.c", &Document::new().with("a", 1));
        let c = Chunk::gen_id("t.d", &Document::new().with("a", 0));
        assert_eq!(a, "t.c-a_0");
        assert_ne!(a, b);
        assert_ne!(a, c);

        let compound = Chunk::gen_id("t.c", &Document::new().with("a", 0).with("b", "x"));
        assert_eq!(compound, "t.c-a_0b_\"x\"");
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut c = chunk(0, 100);
        c.lastmod = 7;
        let back = Chunk::unserialize(&c.serialize()).unwrap();
        assert_eq!(back.ns, c.ns);
        assert_eq!(back.min, c.min);
        assert_eq!(back.max, c.max);
        assert_eq!(back.shard, c.shard);
        assert_eq!(back.lastmod, 7);
    }

    #[test]
    fn test_unserialize_legacy_dotted() {
        let mut record = chunk(0, 100).serialize();
        record.min_dotted = Some(Document::new().with("a", 5));
        record.max_dotted = Some(Document::new().with("a", 50));
        record.min = None;
        record.max = None;
        let c = Chunk::unserialize(&record).unwrap();
        assert_eq!(c.min.get("a"), Some(&Value::Int(5)));
        assert_eq!(c.max.get("a"), Some(&Value::Int(50)));
    }

    #[test]
    fn test_save_assigns_version_and_checks() {
        let cluster = Arc::new(MemCluster::new());
        let mut c = chunk(0, 100);
        c.mark_modified();
        let v = c.save(cluster.as_ref(), true).unwrap();
        assert!(v > 0);
        assert_eq!(c.lastmod(), v);
        assert!(!c.is_modified());

        // an unchanged re-save keeps the version
        let v2 = c.save(cluster.as_ref(), true).unwrap();
        assert_eq!(v2, v);

        // marking modified forces a fresh, higher version
        c.mark_modified();
        let v3 = c.save(cluster.as_ref(), true).unwrap();
        assert!(v3 > v);
    }

    #[test]
    fn test_pick_split_point_median() {
        let cluster = Arc::new(MemCluster::new());
        let rs0 = Shard::new("rs0");
        for i in 0..10 {
            cluster.insert_doc(&rs0, "t.c", Document::new().with("a", i));
        }
        let point = chunk(0, 100).pick_split_point(cluster.as_ref(), &key()).unwrap();
        assert_eq!(point.get("a"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_pick_split_point_unbounded_end_uses_first_key() {
        let cluster = Arc::new(MemCluster::new());
        let rs0 = Shard::new("rs0");
        for i in [3, 9, 27] {
            cluster.insert_doc(&rs0, "t.c", Document::new().with("a", i));
        }
        let k = key();

        let low_edge = Chunk::new("t.c", k.global_min(), Document::new().with("a", 100), rs0.clone());
        let point = low_edge.pick_split_point(cluster.as_ref(), &k).unwrap();
        assert_eq!(point.get("a"), Some(&Value::Int(3)));

        let high_edge = Chunk::new("t.c", Document::new().with("a", 0), k.global_max(), rs0);
        let point = high_edge.pick_split_point(cluster.as_ref(), &k).unwrap();
        assert_eq!(point.get("a"), Some(&Value::Int(27)));
    }

    #[test]
    fn test_pick_split_point_skewed_median_steps_forward() {
        let cluster = Arc::new(MemCluster::new());
        let rs0 = Shard::new("rs0");
        // almost everything sits on a = 0, so the median lands on min
        for _ in 0..20 {
            cluster.insert_doc(&rs0, "t.c", Document::new().with("a", 0));
        }
        cluster.insert_doc(&rs0, "t.c", Document::new().with("a", 42));
        let point = chunk(0, 100).pick_split_point(cluster.as_ref(), &key()).unwrap();
        assert_eq!(point.get("a"), Some(&Value::Int(42)));
    }

    #[test]
    fn test_pick_split_point_single_value_is_empty() {
        let cluster = Arc::new(MemCluster::new());
        let rs0 = Shard::new("rs0");
        for _ in 0..5 {
            cluster.insert_doc(&rs0, "t.c", Document::new().with("a", 0));
        }
        let point = chunk(0, 100).pick_split_point(cluster.as_ref(), &key()).unwrap();
        assert!(point.is_empty());
    }

    #[test]
    fn test_note_written_accumulates() {
        let c = chunk(0, 100);
        assert_eq!(c.note_written(10), 10);
        assert_eq!(c.note_written(5), 15);
        c.reset_data_written();
        assert_eq!(c.note_written(1), 1);
    }
}
