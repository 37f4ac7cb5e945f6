//! ChunkManager — the authoritative chunk map for one sharded namespace
//!
//! Owns every chunk of one collection: serves routing lookups, plans
//! queries against the coalesced range view, orchestrates splits and
//! migrations, and persists modified chunks to the metadata store.
//!
//! Concurrency: one reader/writer lock guards the chunk map and the range
//! index together — a writer updates both before readers see either.
//! Routing threads take the read side; reloads, splits and migrations take
//! the write side. A process-wide try-lock serializes autosplits across
//! managers; contention simply skips the check.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::backend::{ChunkVersion, ClusterEnv, NamespaceGuard};
use crate::chunk::{Chunk, ChunkInfo, ChunkMap};
use crate::data::Document;
use crate::key::{OrderedKey, ShardKeyPattern};
use crate::query::{FieldRange, Predicate};
use crate::range::{ChunkRange, ChunkRangeIndex};
use crate::topology::Shard;
use crate::{ClusterError, Result};

/// Fresh sequence numbers, process-wide; a manager picks one up whenever
/// its view of the cluster changes so callers can detect staleness
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, AtomicOrdering::SeqCst)
}

/// One autosplit at a time per process. Also serializes the cluster-wide
/// namespace locking step across namespaces sharing shards.
static SPLIT_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

// ============================================================================
// Query routing result
// ============================================================================

/// What a predicate resolves to against the range view
#[derive(Debug, Clone)]
pub enum QueryRoute {
    /// The predicate cannot be narrowed; contact everything
    All,
    /// The (deduplicated, min-ordered) ranges the predicate can touch
    Ranges(Vec<Arc<ChunkRange>>),
}

// ============================================================================
// ChunkManager
// ============================================================================

struct ChunkSet {
    chunks: ChunkMap,
    ranges: ChunkRangeIndex,
}

/// Owns and serves the chunk metadata of one sharded namespace
pub struct ChunkManager {
    env: ClusterEnv,
    ns: String,
    key: ShardKeyPattern,
    unique: bool,
    state: RwLock<ChunkSet>,
    sequence: AtomicU64,
}

impl ChunkManager {
    /// Load the persisted chunks of `ns`, or bootstrap a single chunk
    /// spanning the whole key space on the database's primary shard
    pub fn open(
        env: ClusterEnv,
        ns: &str,
        key: ShardKeyPattern,
        unique: bool,
        primary: &Shard,
    ) -> Result<Self> {
        let mgr = Self {
            env,
            ns: ns.to_string(),
            key,
            unique,
            state: RwLock::new(ChunkSet {
                chunks: ChunkMap::new(),
                ranges: ChunkRangeIndex::new(),
            }),
            sequence: AtomicU64::new(next_sequence()),
        };

        {
            let mut state = mgr.state.write();
            mgr.load_into(&mut state)?;

            if state.chunks.is_empty() {
                let mut first = Chunk::new(
                    &mgr.ns,
                    mgr.key.global_min(),
                    mgr.key.global_max(),
                    primary.clone(),
                );
                first.mark_modified();
                log::info!(
                    "no chunks for {}, creating first: {}",
                    mgr.ns,
                    ChunkInfo::from(&first)
                );
                state.chunks.insert(mgr.key.ordered(first.max()), first);
                let ChunkSet { chunks, ranges } = &mut *state;
                ranges.reload_all(&mgr.key, chunks);
            }
        }

        mgr.publish_counts();
        Ok(mgr)
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn shard_key(&self) -> &ShardKeyPattern {
        &self.key
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn num_chunks(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// Snapshot of every chunk, in key order
    pub fn chunks(&self) -> Vec<ChunkInfo> {
        self.state.read().chunks.values().map(ChunkInfo::from).collect()
    }

    pub fn num_ranges(&self) -> usize {
        self.state.read().ranges.len()
    }

    /// Bumped every time this manager's view of the cluster changes
    pub fn sequence_number(&self) -> u64 {
        self.sequence.load(AtomicOrdering::SeqCst)
    }

    pub fn has_shard_key(&self, doc: &Document) -> bool {
        self.key.has_shard_key(doc)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    fn load_into(&self, state: &mut ChunkSet) -> Result<()> {
        state.chunks.clear();
        state.ranges.clear();
        for record in self.env.meta.load_chunks(&self.ns)? {
            let chunk = Chunk::unserialize(&record)?;
            state.chunks.insert(self.key.ordered(chunk.max()), chunk);
        }
        let ChunkSet { chunks, ranges } = state;
        ranges.reload_all(&self.key, chunks);
        Ok(())
    }

    /// Throw the in-memory view away and reload it from the metadata store
    pub fn reload(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            self.load_into(&mut state)?;
        }
        self.sequence.store(next_sequence(), AtomicOrdering::SeqCst);
        self.publish_counts();
        Ok(())
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// The chunk owning a document's shard key. A lookup miss reloads from
    /// the metadata store and retries once; a second miss means the chunk
    /// map is corrupt and the manager must be rebuilt.
    pub fn find_chunk(&self, doc: &Document) -> Result<ChunkInfo> {
        let key_doc = self
            .key
            .extract_key(doc)
            .ok_or_else(|| ClusterError::MissingShardKey(doc.to_string()))?;

        if let Some(info) = self.lookup(&key_doc) {
            return Ok(info);
        }

        log::info!(
            "no chunk covers {} in {}; reloading and retrying",
            key_doc,
            self.ns
        );
        self.reload()?;
        self.lookup(&key_doc).ok_or_else(|| {
            ClusterError::Consistency(format!(
                "no chunk covers {} in {} after reload",
                key_doc, self.ns
            ))
        })
    }

    fn lookup(&self, key_doc: &Document) -> Option<ChunkInfo> {
        let state = self.state.read();
        let chunk = chunk_at(&state.chunks, &self.key.ordered(key_doc))?;
        chunk
            .contains(&self.key, key_doc)
            .then(|| ChunkInfo::from(chunk))
    }

    /// Any chunk currently living on `shard`
    pub fn find_chunk_on_shard(&self, shard: &Shard) -> Option<ChunkInfo> {
        let state = self.state.read();
        state
            .chunks
            .values()
            .find(|c| c.shard() == shard)
            .map(ChunkInfo::from)
    }

    /// Every shard currently holding at least one chunk
    pub fn all_shards(&self) -> Vec<Shard> {
        let state = self.state.read();
        let set: BTreeSet<Shard> = state.chunks.values().map(|c| c.shard().clone()).collect();
        set.into_iter().collect()
    }

    // ========================================================================
    // Query planning
    // ========================================================================

    /// Resolve a predicate against the coalesced range view
    pub fn route_for_query(&self, predicate: &Predicate) -> Result<QueryRoute> {
        let state = self.state.read();
        let field = self.key.first_field();
        let range = FieldRange::for_field(predicate, field);

        if let Some(kind) = range.special() {
            return Err(ClusterError::UnsupportedQuery(kind.to_string()));
        }
        if range.is_empty() {
            return Ok(QueryRoute::Ranges(Vec::new()));
        }
        if let Some(value) = range.equality() {
            let key = self.key.ordered_first(value.clone());
            let (_, covering) = state.ranges.upper_bound(&key).ok_or_else(|| {
                ClusterError::Consistency(format!("no range covers {} = {}", field, value))
            })?;
            return Ok(QueryRoute::Ranges(vec![covering.clone()]));
        }
        if !range.nontrivial() {
            return Ok(QueryRoute::All);
        }

        // map each interval onto a run of range entries, dedup by range min
        let mut hits: BTreeMap<OrderedKey, Arc<ChunkRange>> = BTreeMap::new();
        for interval in range.intervals() {
            let mut lo = (interval.lower.value.clone(), interval.lower.inclusive);
            let mut hi = (interval.upper.value.clone(), interval.upper.inclusive);
            let mut lo_key = self.key.ordered_first(lo.0.clone());
            let mut hi_key = self.key.ordered_first(hi.0.clone());
            if lo_key > hi_key {
                // descending first field: the interval runs backwards in map order
                std::mem::swap(&mut lo, &mut hi);
                std::mem::swap(&mut lo_key, &mut hi_key);
            }

            let start = if lo.1 {
                state.ranges.upper_bound(&lo_key)
            } else {
                state.ranges.lower_bound(&lo_key)
            };
            let end = if hi.1 {
                state.ranges.upper_bound(&hi_key)
            } else {
                state.ranges.lower_bound(&hi_key)
            };

            let (start_key, _) = start.ok_or_else(|| {
                ClusterError::Consistency(format!("no range covers the interval above {}", lo.0))
            })?;
            let end_key = end.map(|(k, _)| k.clone());

            for (key, covering) in state.ranges.ranges().range(start_key.clone()..) {
                hits.insert(self.key.ordered(covering.min()), covering.clone());
                if Some(key) == end_key.as_ref() {
                    break;
                }
            }
        }
        Ok(QueryRoute::Ranges(hits.into_values().collect()))
    }

    /// The coalesced ranges a query must visit
    pub fn chunks_for_query(&self, predicate: &Predicate) -> Result<Vec<Arc<ChunkRange>>> {
        match self.route_for_query(predicate)? {
            QueryRoute::Ranges(ranges) => Ok(ranges),
            QueryRoute::All => {
                let state = self.state.read();
                Ok(state.ranges.ranges().values().cloned().collect())
            }
        }
    }

    /// The shards a query must contact
    pub fn shards_for_query(&self, predicate: &Predicate) -> Result<Vec<Shard>> {
        match self.route_for_query(predicate)? {
            QueryRoute::All => Ok(self.all_shards()),
            QueryRoute::Ranges(ranges) => {
                let set: BTreeSet<Shard> = ranges.iter().map(|r| r.shard().clone()).collect();
                Ok(set.into_iter().collect())
            }
        }
    }

    // ========================================================================
    // Versions
    // ========================================================================

    /// Highest version across all chunks
    pub fn version(&self) -> ChunkVersion {
        self.state
            .read()
            .chunks
            .values()
            .map(|c| c.lastmod())
            .max()
            .unwrap_or(0)
    }

    /// Highest version across the chunks on one shard
    pub fn shard_version(&self, shard: &Shard) -> ChunkVersion {
        self.state
            .read()
            .chunks
            .values()
            .filter(|c| c.shard() == shard)
            .map(|c| c.lastmod())
            .max()
            .unwrap_or(0)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persist every modified chunk. Each write picks up the version the
    /// store assigned and bumps the manager's sequence number. The overall
    /// collection version must never decrease across a save.
    pub fn save(&self) -> Result<()> {
        let before = self.version();
        {
            let mut state = self.state.write();
            for chunk in state.chunks.values_mut() {
                if !chunk.is_modified() {
                    continue;
                }
                chunk.save(self.env.meta.as_ref(), true)?;
                self.sequence.store(next_sequence(), AtomicOrdering::SeqCst);
            }
        }
        let after = self.version();
        if after < before {
            return Err(ClusterError::Consistency(format!(
                "collection version regressed on save: {} < {}",
                after, before
            )));
        }
        self.ensure_index()?;
        self.publish_counts();
        Ok(())
    }

    /// Make sure the shard-key index exists on every shard holding chunks
    pub fn ensure_index(&self) -> Result<()> {
        for shard in self.all_shards() {
            self.env
                .client
                .ensure_index(&shard, &self.ns, &self.key, self.unique)?;
        }
        Ok(())
    }

    fn shard_counts(&self) -> HashMap<Shard, usize> {
        let state = self.state.read();
        let mut counts = HashMap::new();
        for chunk in state.chunks.values() {
            *counts.entry(chunk.shard().clone()).or_insert(0) += 1;
        }
        counts
    }

    fn publish_counts(&self) {
        self.env.shards.record_counts(&self.ns, &self.shard_counts());
    }

    // ========================================================================
    // Split
    // ========================================================================

    /// Split the chunk owning `doc` at `middle`, or at a freshly picked
    /// split point. Returns the new right-hand chunk.
    pub fn split_chunk(&self, doc: &Document, middle: Option<Document>) -> Result<ChunkInfo> {
        let target = self.find_chunk(doc)?;
        let middle = match middle {
            Some(m) => m,
            None => self.probe(&target).pick_split_point(self.env.client.as_ref(), &self.key)?,
        };
        self.split_at(&target, middle)
    }

    fn split_at(&self, target: &ChunkInfo, middle: Document) -> Result<ChunkInfo> {
        use std::cmp::Ordering::*;

        if middle.is_empty()
            || !self.key.has_shard_key(&middle)
            || self.key.compare(&middle, &target.min) == Equal
            || self.key.compare(&middle, &target.max) == Equal
        {
            return Err(ClusterError::CannotSplit(middle.to_string()));
        }

        // no split or migrate may run for this namespace on the shard
        let _ns_lock = NamespaceGuard::acquire(self.env.locks.clone(), &target.shard, &self.ns)?;

        log::debug!("before split on {}: {}", middle, target);
        let mut detail = Document::new().with("before", short_version(&target.min, &target.max));

        let right_info;
        {
            let mut state = self.state.write();
            let max_key = self.key.ordered(&target.max);
            {
                let chunk = state.chunks.get(&max_key).ok_or_else(|| stale(target))?;
                if self.key.compare(chunk.min(), &target.min) != Equal
                    || chunk.shard() != &target.shard
                {
                    return Err(stale(target));
                }
                if !(self.key.compare(chunk.min(), &middle) == Less
                    && self.key.compare(&middle, chunk.max()) == Less)
                {
                    return Err(ClusterError::CannotSplit(middle.to_string()));
                }
            }

            let mut left = state.chunks.remove(&max_key).ok_or_else(|| stale(target))?;
            let old_max = left.max().clone();
            let mut right = Chunk::new(&self.ns, middle.clone(), old_max.clone(), target.shard.clone());
            right.mark_modified();
            left.max = middle.clone();
            left.mark_modified();
            right_info = ChunkInfo::from(&right);

            detail.push("left", short_version(left.min(), left.max()));
            detail.push("right", short_version(right.min(), right.max()));

            state.chunks.insert(self.key.ordered(&middle), left);
            state.chunks.insert(self.key.ordered(&old_max), right);
            // both halves stay on one shard, so the coalesced view is untouched
        }

        self.save()?;
        log::info!(
            "split {} at {}: left max {}, right {}",
            target,
            middle,
            middle,
            right_info
        );
        self.env.meta.log_change("split", &self.ns, detail)?;
        Ok(right_info)
    }

    // ========================================================================
    // Autosplit
    // ========================================================================

    /// Called by write paths with the bytes just written under `doc`'s
    /// key. Once enough data has accumulated, measures the chunk and, if
    /// oversized, splits it and possibly migrates one half. Returns true
    /// when a split happened.
    pub fn split_if_should(&self, doc: &Document, data_written: u64) -> Result<bool> {
        let (target, my_max) = {
            let state = self.state.read();
            let key_doc = match self.key.extract_key(doc) {
                Some(k) => k,
                None => return Ok(false),
            };
            let chunk = match chunk_at(&state.chunks, &self.key.ordered(&key_doc)) {
                Some(c) if c.contains(&self.key, &key_doc) => c,
                _ => return Ok(false),
            };

            // keep the unbounded edge chunks pre-split
            let mut my_max = self.env.settings.max_chunk_size;
            if chunk.min_is_inf(&self.key) || chunk.max_is_inf(&self.key) {
                my_max = my_max * 9 / 10;
            }

            let written = chunk.note_written(data_written);
            if written < my_max / 5 {
                return Ok(false);
            }
            (ChunkInfo::from(chunk), my_max)
        };

        let _split_lock = match SPLIT_LOCK.try_lock() {
            Some(guard) => guard,
            None => return Ok(false),
        };

        log::debug!("autosplit check: {}", target);
        {
            let state = self.state.read();
            match state.chunks.get(&self.key.ordered(&target.max)) {
                Some(chunk)
                    if self.key.compare(chunk.min(), &target.min)
                        == std::cmp::Ordering::Equal =>
                {
                    chunk.reset_data_written()
                }
                _ => return Ok(false),
            }
        }

        let probe = self.probe(&target);
        let point = probe.pick_split_point(self.env.client.as_ref(), &self.key)?;
        if point.is_empty()
            || self.key.compare(&point, &target.min) == std::cmp::Ordering::Equal
            || self.key.compare(&point, &target.max) == std::cmp::Ordering::Equal
        {
            log::warn!(
                "chunk is over the size threshold but has no usable split point: {}",
                target
            );
            return Ok(false);
        }

        let size = probe.physical_size(self.env.client.as_ref(), &self.key, my_max)?;
        if size < my_max {
            return Ok(false);
        }

        log::info!("autosplitting {} size: {} chunk: {}", self.ns, size, target);
        let right = self.split_at(&target, point)?;
        let left = ChunkInfo {
            ns: target.ns.clone(),
            min: target.min.clone(),
            max: right.min.clone(),
            shard: target.shard.clone(),
            lastmod: target.lastmod,
        };
        self.move_if_should(&left, &right)?;
        Ok(true)
    }

    // ========================================================================
    // Migrate
    // ========================================================================

    /// Move the chunk owning `doc` to another shard (two-phase commit
    /// against the source shard)
    pub fn move_chunk(&self, doc: &Document, to: &Shard) -> Result<()> {
        let target = self.find_chunk(doc)?;
        self.move_and_commit(&target, to)
    }

    fn move_and_commit(&self, target: &ChunkInfo, to: &Shard) -> Result<()> {
        if &target.shard == to {
            return Err(ClusterError::MoveToSelf(to.name().to_string()));
        }
        let from = target.shard.clone();
        let old_version = self.shard_version(&from);

        log::info!(
            "moving chunk ns: {} chunk: {} {} -> {}",
            self.ns,
            target,
            from,
            to
        );

        let filter = self.key.filter(&target.min, &target.max);
        let token = self
            .env
            .client
            .move_chunk_start(&from, to, &self.ns, &self.key, &filter)?;

        {
            let mut state = self.state.write();
            let max_key = self.key.ordered(&target.max);
            {
                let chunk = state.chunks.get_mut(&max_key).ok_or_else(|| stale(target))?;
                if self.key.compare(chunk.min(), &target.min) != std::cmp::Ordering::Equal
                    || chunk.shard() != &from
                {
                    return Err(stale(target));
                }
                chunk.shard = to.clone();
                chunk.mark_modified();
            }

            // the source shard's version must advance even if the moved
            // chunk was its last: bump a sibling so stale routers notice
            if let Some(other) = state.chunks.values_mut().find(|c| c.shard() == &from) {
                other.mark_modified();
            }

            let ChunkSet { chunks, ranges } = &mut *state;
            ranges.reload_range(&self.key, chunks, &target.min, &target.max)?;
        }

        self.save()?;

        let mut new_version = self.shard_version(&from);
        if new_version == 0 && old_version > 0 {
            // source emptied out; hand the backend a version above its last
            new_version = old_version + 1;
            self.save()?;
        } else if new_version <= old_version {
            return Err(ClusterError::Consistency(format!(
                "source shard version must increase on migrate: {} <= {}",
                new_version, old_version
            )));
        }

        self.env
            .client
            .move_chunk_finish(&from, to, &self.ns, new_version, token)?;

        let detail = Document::new()
            .with("from", from.name())
            .with("to", to.name())
            .with("chunk", short_version(&target.min, &target.max));
        self.env.meta.log_change("migrate", &self.ns, detail)?;
        Ok(())
    }

    /// After an autosplit, migrate whichever half looks like a fresh,
    /// nearly empty edge chunk. Anything else stays put.
    fn move_if_should(&self, left: &ChunkInfo, right: &ChunkInfo) -> Result<bool> {
        let client = self.env.client.as_ref();
        let to_move = if self.probe(right).count_objects(client, &self.key)? <= 1 {
            right
        } else if self.probe(left).count_objects(client, &self.key)? <= 1 {
            left
        } else {
            log::debug!(
                "no obvious migration candidate after splitting {} / {}",
                left,
                right
            );
            return Ok(false);
        };

        let dest = match self.env.shards.pick() {
            Some(shard) => shard,
            None => return Ok(false),
        };
        if dest == to_move.shard {
            log::debug!(
                "not moving chunk {}: already on the best shard {}",
                to_move,
                dest
            );
            return Ok(false);
        }

        log::info!("moving chunk (auto): {} to: {}", to_move, dest);
        self.move_and_commit(to_move, &dest)?;
        Ok(true)
    }

    // ========================================================================
    // Drop
    // ========================================================================

    /// Tear the sharded collection down: every shard is namespace-locked
    /// (deterministic order, released on failure), backend data and
    /// metadata are removed, and each shard's version is reset.
    pub fn drop_collection(&self) -> Result<()> {
        let mut state = self.state.write();

        if !self.env.locks.all_up() {
            return Err(ClusterError::LockServersDown);
        }

        let shards: Vec<Shard> = {
            let set: BTreeSet<Shard> =
                state.chunks.values().map(|c| c.shard().clone()).collect();
            set.into_iter().collect()
        };
        log::info!("dropping {} across {} shards", self.ns, shards.len());

        let mut ns_locks = Vec::with_capacity(shards.len());
        for shard in &shards {
            ns_locks.push(NamespaceGuard::acquire(
                self.env.locks.clone(),
                shard,
                &self.ns,
            )?);
        }

        state.chunks.clear();
        state.ranges.clear();

        for shard in &shards {
            self.env.client.drop_collection(shard, &self.ns)?;
        }

        if !self.env.meta.remove_sharding(&self.ns)? {
            return Err(ClusterError::NotSharded(self.ns.clone()));
        }
        self.env.meta.remove_chunks(&self.ns)?;

        for shard in &shards {
            self.env.client.set_shard_version(shard, &self.ns, 0, true)?;
        }

        self.env.shards.record_counts(&self.ns, &HashMap::new());
        log::info!("drop of {} complete", self.ns);
        Ok(())
    }

    fn probe(&self, info: &ChunkInfo) -> Chunk {
        Chunk::new(&self.ns, info.min.clone(), info.max.clone(), info.shard.clone())
    }
}

fn chunk_at<'a>(chunks: &'a ChunkMap, key: &OrderedKey) -> Option<&'a Chunk> {
    chunks
        .range((Excluded(key.clone()), Unbounded))
        .next()
        .map(|(_, c)| c)
}

fn short_version(min: &Document, max: &Document) -> Document {
    Document::new().with("min", min.clone()).with("max", max.clone())
}

fn stale(target: &ChunkInfo) -> ClusterError {
    ClusterError::Consistency(format!("chunk changed under the operation: {}", target))
}

// ============================================================================
// ShardingCatalog
// ============================================================================

/// Registry of chunk managers, keyed by namespace
///
/// A manager is born on first access to its namespace and lives until the
/// collection is dropped.
pub struct ShardingCatalog {
    env: ClusterEnv,
    managers: RwLock<HashMap<String, Arc<ChunkManager>>>,
}

impl ShardingCatalog {
    pub fn new(env: ClusterEnv) -> Self {
        Self {
            env,
            managers: RwLock::new(HashMap::new()),
        }
    }

    pub fn env(&self) -> &ClusterEnv {
        &self.env
    }

    /// Shard a collection, or pick up its persisted chunks if it already is
    pub fn shard_collection(
        &self,
        ns: &str,
        pattern: &Document,
        unique: bool,
        primary: &Shard,
    ) -> Result<Arc<ChunkManager>> {
        if let Some(mgr) = self.managers.read().get(ns) {
            return Ok(mgr.clone());
        }
        let key = ShardKeyPattern::new(pattern)?;
        let mgr = Arc::new(ChunkManager::open(
            self.env.clone(),
            ns,
            key,
            unique,
            primary,
        )?);
        Ok(self
            .managers
            .write()
            .entry(ns.to_string())
            .or_insert(mgr)
            .clone())
    }

    pub fn manager(&self, ns: &str) -> Option<Arc<ChunkManager>> {
        self.managers.read().get(ns).cloned()
    }

    /// Drop a sharded collection and forget its manager
    pub fn drop_collection(&self, ns: &str) -> Result<()> {
        let mgr = self
            .managers
            .write()
            .remove(ns)
            .ok_or_else(|| ClusterError::NotSharded(ns.to_string()))?;
        mgr.drop_collection()
    }
}

// ============================================================================
// Tests
// ============================================================================
