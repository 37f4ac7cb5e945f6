//! Coalesced range view over the chunk map
//!
//! Routing rarely cares about individual chunks: adjacent chunks on the
//! same shard can be dispatched as one unit. `ChunkRangeIndex` maintains
//! that coalesced view — a map from each run's max key to an immutable,
//! reference-counted `ChunkRange`. The index is a cache; `reload_range`
//! rebuilds only the slice around a mutated chunk and must always be
//! equivalent to a full `reload_all`.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkMap};
use crate::data::Document;
use crate::key::{ChunkFilter, OrderedKey, ShardKeyPattern};
use crate::topology::Shard;
use crate::{ClusterError, Result, ShardClient};

// ============================================================================
// ChunkRange
// ============================================================================

/// A maximal run of adjacent same-shard chunks, `[min, max)`
///
/// Immutable once built; shared between readers via `Arc`. Carries no
/// version — staleness is the chunk map's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRange {
    ns: String,
    shard: Shard,
    min: Document,
    max: Document,
}

impl ChunkRange {
    /// Build from a non-empty run of chunks that all live on one shard
    fn from_run(run: &[&Chunk]) -> Self {
        debug_assert!(!run.is_empty());
        let first = run[0];
        debug_assert!(run.iter().all(|c| c.shard == first.shard));
        Self {
            ns: first.ns.clone(),
            shard: first.shard.clone(),
            min: first.min.clone(),
            max: run[run.len() - 1].max.clone(),
        }
    }

    /// Merge two adjacent ranges on the same shard
    fn merge(low: &ChunkRange, high: &ChunkRange) -> Self {
        debug_assert_eq!(low.shard, high.shard);
        debug_assert_eq!(low.max, high.min);
        Self {
            ns: low.ns.clone(),
            shard: low.shard.clone(),
            min: low.min.clone(),
            max: high.max.clone(),
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn min(&self) -> &Document {
        &self.min
    }

    pub fn max(&self) -> &Document {
        &self.max
    }

    /// Whether the document's shard key falls inside `[min, max)`
    pub fn contains(&self, pattern: &ShardKeyPattern, doc: &Document) -> bool {
        self.filter(pattern).matches(pattern, doc)
    }

    /// Server-side predicate selecting exactly this range's documents
    pub fn filter(&self, pattern: &ShardKeyPattern) -> ChunkFilter {
        pattern.filter(&self.min, &self.max)
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
// ChunkRangeIndex
// ============================================================================

/// Ordered map `max key → range` over the coalesced runs
#[derive(Debug, Default)]
pub struct ChunkRangeIndex {
    ranges: BTreeMap<OrderedKey, Arc<ChunkRange>>,
}

impl ChunkRangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &BTreeMap<OrderedKey, Arc<ChunkRange>> {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// First entry with key strictly above `key` — the range containing it
    pub fn upper_bound(&self, key: &OrderedKey) -> Option<(&OrderedKey, &Arc<ChunkRange>)> {
        self.ranges
            .range((Excluded(key.clone()), Unbounded))
            .next()
    }

    /// First entry with key at or above `key`
    pub fn lower_bound(&self, key: &OrderedKey) -> Option<(&OrderedKey, &Arc<ChunkRange>)> {
        self.ranges.range(key.clone()..).next()
    }

    // ========================================================================
    // Rebuilds
    // ========================================================================

    /// Throw the view away and re-coalesce the whole chunk map
    pub fn reload_all(&mut self, pattern: &ShardKeyPattern, chunks: &ChunkMap) {
        self.ranges.clear();
        self.insert_run(pattern, chunks.values());
        #[cfg(debug_assertions)]
        self.assert_valid(pattern, chunks);
    }

    /// Rebuild only the slice of the view straddling `[min, max)`, then
    /// re-merge the two new boundaries with their neighbors when they
    /// share a shard
    pub fn reload_range(
        &mut self,
        pattern: &ShardKeyPattern,
        chunks: &ChunkMap,
        min: &Document,
        max: &Document,
    ) -> Result<()> {
        if self.ranges.is_empty() {
            self.reload_all(pattern, chunks);
            return Ok(());
        }

        let min_key = pattern.ordered(min);
        let max_key = pattern.ordered(max);

        let (low_key, low_min) = self
            .upper_bound(&min_key)
            .map(|(k, r)| (k.clone(), r.min.clone()))
            .ok_or_else(|| range_miss(min))?;
        let (high_key, high_max) = self
            .lower_bound(&max_key)
            .map(|(k, r)| (k.clone(), r.max.clone()))
            .ok_or_else(|| range_miss(max))?;

        // widen to the full chunk span of the straddled ranges
        let begin_key = chunks
            .range((Excluded(pattern.ordered(&low_min)), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .ok_or_else(|| range_miss(&low_min))?;
        let end_key = pattern.ordered(&high_max);

        let stale: Vec<OrderedKey> = self
            .ranges
            .range(low_key..=high_key)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.ranges.remove(&key);
        }
        self.insert_run(pattern, chunks.range(begin_key..=end_key).map(|(_, c)| c));

        #[cfg(debug_assertions)]
        self.assert_valid(pattern, chunks);

        // merge the low boundary with its predecessor
        if let Some((low_key, low)) = self.upper_bound(&min_key).map(|(k, r)| (k.clone(), r.clone()))
        {
            let prev = self
                .ranges
                .range(..low_key.clone())
                .next_back()
                .map(|(k, r)| (k.clone(), r.clone()));
            if let Some((prev_key, prev)) = prev {
                if prev.shard == low.shard {
                    let merged = ChunkRange::merge(&prev, &low);
                    self.ranges.remove(&prev_key);
                    self.ranges.remove(&low_key);
                    self.insert(pattern, merged);
                }
            }
        }

        #[cfg(debug_assertions)]
        self.assert_valid(pattern, chunks);

        // merge the high boundary with its successor
        if let Some((high_key, high)) =
            self.lower_bound(&max_key).map(|(k, r)| (k.clone(), r.clone()))
        {
            let next = self
                .ranges
                .range((Excluded(high_key.clone()), Unbounded))
                .next()
                .map(|(k, r)| (k.clone(), r.clone()));
            if let Some((next_key, next)) = next {
                if next.shard == high.shard {
                    let merged = ChunkRange::merge(&high, &next);
                    self.ranges.remove(&high_key);
                    self.ranges.remove(&next_key);
                    self.insert(pattern, merged);
                }
            }
        }

        #[cfg(debug_assertions)]
        self.assert_valid(pattern, chunks);

        Ok(())
    }

    fn insert(&mut self, pattern: &ShardKeyPattern, range: ChunkRange) {
        self.ranges
            .insert(pattern.ordered(&range.max), Arc::new(range));
    }

    /// Coalesce a slice of chunks, starting a new range at every shard change
    fn insert_run<'a>(
        &mut self,
        pattern: &ShardKeyPattern,
        chunks: impl Iterator<Item = &'a Chunk>,
    ) {
        let mut run: Vec<&Chunk> = Vec::new();
        for chunk in chunks {
            if let Some(last) = run.last() {
                if last.shard != chunk.shard {
                    self.insert(pattern, ChunkRange::from_run(&run));
                    run.clear();
                }
            }
            run.push(chunk);
        }
        if !run.is_empty() {
            self.insert(pattern, ChunkRange::from_run(&run));
        }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Check every index invariant against the chunk map. Panics on
    /// violation; a broken range view is a routing hazard, not a
    /// recoverable condition. Slow — meant for debug builds and tests.
    pub fn assert_valid(&self, pattern: &ShardKeyPattern, chunks: &ChunkMap) {
        if self.ranges.is_empty() {
            assert!(
                chunks.is_empty(),
                "range index empty but {} chunks exist",
                chunks.len()
            );
            return;
        }

        let first = self.ranges.values().next().unwrap();
        assert_eq!(
            pattern.compare(&first.min, &pattern.global_min()),
            std::cmp::Ordering::Equal,
            "first range does not start at the global min: {}",
            first.min
        );
        let last = self.ranges.values().next_back().unwrap();
        assert_eq!(
            pattern.compare(&last.max, &pattern.global_max()),
            std::cmp::Ordering::Equal,
            "last range does not end at the global max: {}",
            last.max
        );

        let mut prev: Option<&Arc<ChunkRange>> = None;
        for (key, range) in &self.ranges {
            assert_eq!(
                *key,
                pattern.ordered(&range.max),
                "range map key does not match the range max: {}",
                range.max
            );
            if let Some(prev) = prev {
                assert_eq!(
                    pattern.compare(&prev.max, &range.min),
                    std::cmp::Ordering::Equal,
                    "gap or overlap between {} and {}",
                    prev.max,
                    range.min
                );
            }
            prev = Some(range);
        }

        for chunk in chunks.values() {
            let min_entry = self.upper_bound(&pattern.ordered(&chunk.min));
            let max_entry = self.lower_bound(&pattern.ordered(&chunk.max));
            let (min_key, covering) = min_entry.expect("chunk min not covered by any range");
            let (max_key, _) = max_entry.expect("chunk max not covered by any range");
            assert_eq!(
                min_key, max_key,
                "chunk [{}, {}) spans more than one range",
                chunk.min, chunk.max
            );
            assert_eq!(
                covering.shard, chunk.shard,
                "range on {} covers chunk on {}",
                covering.shard, chunk.shard
            );
            assert!(
                pattern.compare(&covering.min, &chunk.min) != std::cmp::Ordering::Greater
                    && pattern.compare(&chunk.max, &covering.max) != std::cmp::Ordering::Greater,
                "range [{}, {}) does not cover chunk [{}, {})",
                covering.min,
                covering.max,
                chunk.min,
                chunk.max
            );
        }
    }
}

fn range_miss(key: &Document) -> ClusterError {
    ClusterError::Consistency(format!("no range entry covers {}", key))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    fn key() -> ShardKeyPattern {
        ShardKeyPattern::on("a")
    }

    fn bound(pattern: &ShardKeyPattern, v: Option<i64>, top: bool) -> Document {
        match v {
            Some(v) => Document::new().with("a", v),
            None if top => pattern.global_max(),
            None => pattern.global_min(),
        }
    }

    /// Build a chunk map from (min, max, shard) triples; None = sentinel
    fn build(specs: &[(Option<i64>, Option<i64>, &str)]) -> ChunkMap {
        let pattern = key();
        let mut chunks = ChunkMap::new();
        for (min, max, shard) in specs {
            let c = Chunk::new(
                "t.c",
                bound(&pattern, *min, false),
                bound(&pattern, *max, true),
                Shard::new(*shard),
            );
            chunks.insert(pattern.ordered(&c.max), c);
        }
        chunks
    }

    fn materialize(index: &ChunkRangeIndex) -> Vec<(Document, Document, Shard)> {
        index
            .ranges()
            .values()
            .map(|r| (r.min.clone(), r.max.clone(), r.shard.clone()))
            .collect()
    }

    #[test]
    fn test_reload_all_coalesces_same_shard_runs() {
        let chunks = build(&[
            (None, Some(10), "rs0"),
            (Some(10), Some(20), "rs0"),
            (Some(20), Some(30), "rs1"),
            (Some(30), None, "rs0"),
        ]);
        let mut index = ChunkRangeIndex::new();
        index.reload_all(&key(), &chunks);

        let ranges = materialize(&index);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].2, Shard::new("rs0"));
        assert_eq!(ranges[0].1.get("a"), Some(&Value::Int(20)));
        assert_eq!(ranges[1].2, Shard::new("rs1"));
        assert_eq!(ranges[2].0.get("a"), Some(&Value::Int(30)));
        index.assert_valid(&key(), &chunks);
    }

    #[test]
    fn test_reload_range_splits_a_run() {
        let pattern = key();
        let mut chunks = build(&[
            (None, Some(50), "rs0"),
            (Some(50), None, "rs0"),
        ]);
        let mut index = ChunkRangeIndex::new();
        index.reload_all(&pattern, &chunks);
        assert_eq!(index.len(), 1);

        // migrate [50, MaxKey) to rs1
        let high_key = pattern.ordered(&pattern.global_max());
        let moved = chunks.get_mut(&high_key).unwrap();
        moved.shard = Shard::new("rs1");
        let (min, max) = (moved.min.clone(), moved.max.clone());
        index.reload_range(&pattern, &chunks, &min, &max).unwrap();

        assert_eq!(index.len(), 2);
        index.assert_valid(&pattern, &chunks);
    }

    #[test]
    fn test_reload_range_rejoins_runs() {
        let pattern = key();
        let mut chunks = build(&[
            (None, Some(50), "rs0"),
            (Some(50), None, "rs1"),
        ]);
        let mut index = ChunkRangeIndex::new();
        index.reload_all(&pattern, &chunks);
        assert_eq!(index.len(), 2);

        // move the first chunk over to rs1; the view collapses to one range
        let low_key = pattern.ordered(&Document::new().with("a", 50));
        let moved = chunks.get_mut(&low_key).unwrap();
        moved.shard = Shard::new("rs1");
        let (min, max) = (moved.min.clone(), moved.max.clone());
        index.reload_range(&pattern, &chunks, &min, &max).unwrap();

        assert_eq!(index.len(), 1);
        let only = index.ranges().values().next().unwrap();
        assert_eq!(only.shard, Shard::new("rs1"));
        index.assert_valid(&pattern, &chunks);
    }

    #[test]
    #[should_panic(expected = "gap or overlap")]
    fn test_assert_valid_catches_gaps() {
        let pattern = key();
        let chunks = build(&[(None, None, "rs0")]);
        let mut index = ChunkRangeIndex::new();
        // two ranges fabricated with a hole between 10 and 20
        index.insert(
            &pattern,
            ChunkRange {
                ns: "t.c".into(),
                shard: Shard::new("rs0"),
                min: pattern.global_min(),
                max: Document::new().with("a", 10),
            },
        );
        index.insert(
            &pattern,
            ChunkRange {
                ns: "t.c".into(),
                shard: Shard::new("rs0"),
                min: Document::new().with("a", 20),
                max: pattern.global_max(),
            },
        );
        index.assert_valid(&pattern, &chunks);
    }

    #[test]
    fn test_reload_range_equivalent_to_reload_all_under_random_churn() {
        let pattern = key();
        let shards = ["rs0", "rs1", "rs2"];
        let mut chunks = build(&[(None, None, "rs0")]);
        let mut index = ChunkRangeIndex::new();
        index.reload_all(&pattern, &chunks);

        let mut state: u64 = 0x9e3779b97f4a7c15;
        let mut rng = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _ in 0..300 {
            let roll = rng();
            if roll % 3 == 0 {
                // split: insert a fresh boundary into the containing chunk
                let v = (rng() % 10_000) as i64;
                let probe = pattern.ordered(&Document::new().with("a", v));
                let (target_key, min, max, shard, ns) = {
                    let (k, c) = chunks
                        .range((Excluded(probe), Unbounded))
                        .next()
                        .expect("probe beyond global max");
                    (k.clone(), c.min.clone(), c.max.clone(), c.shard.clone(), c.ns.clone())
                };
                let mid = Document::new().with("a", v);
                if pattern.compare(&mid, &min) == std::cmp::Ordering::Equal {
                    continue;
                }
                let narrowed = chunks.remove(&target_key).unwrap();
                let mut narrowed = narrowed;
                narrowed.max = mid.clone();
                chunks.insert(pattern.ordered(&mid), narrowed);
                chunks.insert(
                    pattern.ordered(&max),
                    Chunk::new(&ns, mid, max.clone(), shard),
                );
                index.reload_range(&pattern, &chunks, &min, &max).unwrap();
            } else {
                // migrate: flip a random chunk to a random shard
                let pick = rng() as usize % chunks.len();
                let target_key = chunks.keys().nth(pick).unwrap().clone();
                let to = Shard::new(shards[rng() as usize % shards.len()]);
                let c = chunks.get_mut(&target_key).unwrap();
                c.shard = to;
                let (min, max) = (c.min.clone(), c.max.clone());
                index.reload_range(&pattern, &chunks, &min, &max).unwrap();
            }

            let mut fresh = ChunkRangeIndex::new();
            fresh.reload_all(&pattern, &chunks);
            assert_eq!(
                materialize(&index),
                materialize(&fresh),
                "incremental view diverged from full rebuild"
            );
        }
    }
}
