//! Shard identity and cluster topology
//!
//! A `Shard` names one storage backend (typically a replica set). The core
//! never talks to it directly; it only compares identities and hands them
//! to the backend traits. `ShardRegistry` tracks the known shards and
//! answers the balancer's "where should this chunk go" question with a
//! least-loaded pick.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ============================================================================
// Shard
// ============================================================================

/// Identity of one backend shard. Equality and hashing are by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shard(String);

impl Shard {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShardEntry {
    shard: Shard,
    address: String,
    /// Chunk count per namespace, published by the chunk managers
    chunk_counts: HashMap<String, usize>,
}

/// The set of shards this process knows about
///
/// Chunk managers publish their per-namespace chunk counts here after every
/// load and save; `pick` uses the totals to choose a migration target.
#[derive(Default)]
pub struct ShardRegistry {
    shards: RwLock<HashMap<String, ShardEntry>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shard (idempotent; the address is updated on re-register)
    pub fn register(&self, shard: Shard, address: impl Into<String>) {
        let mut shards = self.shards.write();
        let entry = shards.entry(shard.name().to_string()).or_insert(ShardEntry {
            shard,
            address: String::new(),
            chunk_counts: HashMap::new(),
        });
        entry.address = address.into();
    }

    pub fn get(&self, name: &str) -> Option<Shard> {
        self.shards.read().get(name).map(|e| e.shard.clone())
    }

    pub fn address(&self, name: &str) -> Option<String> {
        self.shards.read().get(name).map(|e| e.address.clone())
    }

    /// All registered shards
    pub fn all(&self) -> Vec<Shard> {
        let mut shards: Vec<Shard> =
            self.shards.read().values().map(|e| e.shard.clone()).collect();
        shards.sort();
        shards
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    /// Replace the recorded chunk counts of one namespace
    pub fn record_counts(&self, ns: &str, counts: &HashMap<Shard, usize>) {
        let mut shards = self.shards.write();
        for entry in shards.values_mut() {
            match counts.get(&entry.shard) {
                Some(n) => {
                    entry.chunk_counts.insert(ns.to_string(), *n);
                }
                None => {
                    entry.chunk_counts.remove(ns);
                }
            }
        }
    }

    /// Total recorded chunk count for one shard, across namespaces
    pub fn chunk_count(&self, shard: &Shard) -> usize {
        self.shards
            .read()
            .get(shard.name())
            .map(|e| e.chunk_counts.values().sum())
            .unwrap_or(0)
    }

    /// Pick the least-loaded shard for a new chunk. Ties break by name so
    /// the choice is deterministic.
    pub fn pick(&self) -> Option<Shard> {
        let shards = self.shards.read();
        shards
            .values()
            .min_by_key(|e| {
                let total: usize = e.chunk_counts.values().sum();
                (total, e.shard.name().to_string())
            })
            .map(|e| e.shard.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_identity() {
        let a = Shard::new("rs0");
        let b = Shard::new("rs0");
        let c = Shard::new("rs1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "rs0");
    }

    #[test]
    fn test_register_idempotent() {
        let reg = ShardRegistry::new();
        reg.register(Shard::new("rs0"), "localhost:27018");
        reg.register(Shard::new("rs0"), "localhost:27019");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.address("rs0").unwrap(), "localhost:27019");
    }

    #[test]
    fn test_pick_least_loaded() {
        let reg = ShardRegistry::new();
        reg.register(Shard::new("rs0"), "");
        reg.register(Shard::new("rs1"), "");

        let mut counts = HashMap::new();
        counts.insert(Shard::new("rs0"), 3usize);
        counts.insert(Shard::new("rs1"), 1usize);
        reg.record_counts("t.c", &counts);

        assert_eq!(reg.pick().unwrap(), Shard::new("rs1"));
        assert_eq!(reg.chunk_count(&Shard::new("rs0")), 3);
    }

    #[test]
    fn test_counts_aggregate_across_namespaces() {
        let reg = ShardRegistry::new();
        reg.register(Shard::new("rs0"), "");
        reg.register(Shard::new("rs1"), "");

        let mut a = HashMap::new();
        a.insert(Shard::new("rs0"), 1usize);
        reg.record_counts("db.a", &a);
        let mut b = HashMap::new();
        b.insert(Shard::new("rs0"), 2usize);
        b.insert(Shard::new("rs1"), 1usize);
        reg.record_counts("db.b", &b);

        assert_eq!(reg.chunk_count(&Shard::new("rs0")), 3);
        assert_eq!(reg.pick().unwrap(), Shard::new("rs1"));
    }

    #[test]
    fn test_pick_tie_breaks_by_name() {
        let reg = ShardRegistry::new();
        reg.register(Shard::new("rs1"), "");
        reg.register(Shard::new("rs0"), "");
        assert_eq!(reg.pick().unwrap(), Shard::new("rs0"));
    }
}
