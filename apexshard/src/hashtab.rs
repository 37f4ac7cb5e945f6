//! Fixed-capacity hash table over caller-supplied memory
//!
//! Open addressing with linear probing, laid out as a flat array of packed
//! nodes inside a byte buffer the caller owns. Because the buffer can be a
//! memory-mapped file, the table never allocates and never moves entries;
//! the storage layer uses it to index on-disk records.
//!
//! The buffer must be zero-filled before first use: a node whose hash is
//! zero is an unused slot, which is why keys must never hash to zero.

use std::marker::PhantomData;
use std::mem;

// ============================================================================
// Contracts
// ============================================================================

/// Key stored in a `FixedHashTable`
///
/// `table_hash` must be deterministic and never zero. `kill` runs as the
/// key is removed, before the slot is cleared — a mapped-file table uses
/// it to scrub name bytes out of the file.
pub trait TableKey: Copy + PartialEq {
    fn table_hash(&self) -> u64;

    fn kill(&mut self) {}
}

/// The table has no usable slot for the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

impl std::fmt::Display for TableFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("fixed hash table is full")
    }
}

impl std::error::Error for TableFull {}

// ============================================================================
// Layout
// ============================================================================

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Node<K: Copy, V: Copy> {
    hash: u64,
    key: K,
    value: V,
}

enum Probe {
    Found(usize),
    Insert(usize),
    Full,
}

// ============================================================================
// FixedHashTable
// ============================================================================

/// Open-addressed hash table over an external byte buffer
pub struct FixedHashTable<'b, K, V> {
    name: &'static str,
    buf: &'b mut [u8],
    /// Slot count, forced odd so probe sequences cycle through every slot
    n: usize,
    /// Probe limit before falling back to the first unused slot seen
    max_chain: usize,
    _types: PhantomData<(K, V)>,
}

impl<'b, K: TableKey, V: Copy> FixedHashTable<'b, K, V> {
    /// Bytes one slot occupies; derived from the key and value types
    pub const fn node_size() -> usize {
        mem::size_of::<Node<K, V>>()
    }

    /// Lay the table out over `buf` (which must be zeroed). Returns `None`
    /// when the buffer cannot hold a single node.
    pub fn new(name: &'static str, buf: &'b mut [u8]) -> Option<Self> {
        let mut n = buf.len() / Self::node_size();
        if n == 0 {
            return None;
        }
        if n & 1 == 0 {
            n -= 1;
        }
        let max_chain = n / 20;
        Some(Self {
            name,
            buf,
            n,
            max_chain,
            _types: PhantomData,
        })
    }

    pub fn capacity(&self) -> usize {
        self.n
    }

    fn read_node(&self, i: usize) -> Node<K, V> {
        debug_assert!(i < self.n);
        unsafe {
            std::ptr::read_unaligned(self.buf.as_ptr().add(i * Self::node_size()) as *const Node<K, V>)
        }
    }

    fn write_node(&mut self, i: usize, node: Node<K, V>) {
        debug_assert!(i < self.n);
        unsafe {
            std::ptr::write_unaligned(
                self.buf.as_mut_ptr().add(i * Self::node_size()) as *mut Node<K, V>,
                node,
            )
        }
    }

    /// Probe for a key: its slot, a slot to insert into, or nothing
    fn find(&self, key: &K) -> Probe {
        let hash = key.table_hash();
        debug_assert_ne!(hash, 0);
        let start = (hash % self.n as u64) as usize;
        let mut i = start;
        let mut chain = 0usize;
        let mut first_unused: Option<usize> = None;

        loop {
            let node = self.read_node(i);
            let node_hash = node.hash;
            let node_key = node.key;
            if node_hash == 0 && first_unused.is_none() {
                first_unused = Some(i);
            }
            if node_hash == hash && node_key == *key {
                if chain >= 200 {
                    log::warn!("hash table {}: long chain ({} probes)", self.name, chain);
                }
                return Probe::Found(i);
            }
            chain += 1;
            i = (i + 1) % self.n;
            if i == start {
                log::error!("hash table {} is full, n: {}", self.name, self.n);
                return Probe::Full;
            }
            if chain >= self.max_chain {
                if let Some(slot) = first_unused {
                    return Probe::Insert(slot);
                }
                log::error!("hash table {}: probe chain exhausted, n: {}", self.name, self.n);
                return Probe::Full;
            }
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub fn get(&self, key: &K) -> Option<V> {
        match self.find(key) {
            Probe::Found(i) => Some(self.read_node(i).value),
            _ => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        matches!(self.find(key), Probe::Found(_))
    }

    /// Insert or overwrite. Fails only when no slot is reachable.
    pub fn put(&mut self, key: &K, value: V) -> Result<(), TableFull> {
        match self.find(key) {
            Probe::Found(i) => {
                let mut node = self.read_node(i);
                node.value = value;
                self.write_node(i, node);
                Ok(())
            }
            Probe::Insert(i) => {
                self.write_node(
                    i,
                    Node {
                        hash: key.table_hash(),
                        key: *key,
                        value,
                    },
                );
                Ok(())
            }
            Probe::Full => Err(TableFull),
        }
    }

    /// Remove a key: run its `kill` hook against the stored copy, write
    /// the scrubbed bytes back, then clear the slot
    pub fn kill(&mut self, key: &K) {
        if let Probe::Found(i) = self.find(key) {
            let mut node = self.read_node(i);
            let mut stored = node.key;
            stored.kill();
            node.key = stored;
            node.hash = 0;
            self.write_node(i, node);
        }
    }

    /// Visit every in-use slot in array order
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for i in 0..self.n {
            let node = self.read_node(i);
            let hash = node.hash;
            if hash == 0 {
                continue;
            }
            let key = node.key;
            let value = node.value;
            f(&key, &value);
        }
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        for i in 0..self.n {
            if self.read_node(i).hash != 0 {
                count += 1;
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHasher;
    use std::hash::{Hash, Hasher};

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Id(u64);

    impl TableKey for Id {
        fn table_hash(&self) -> u64 {
            let mut hasher = AHasher::default();
            self.0.hash(&mut hasher);
            // zero marks an unused slot
            hasher.finish() | 1
        }
    }

    /// Every key probes from the same slot
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Colliding(u64);

    impl TableKey for Colliding {
        fn table_hash(&self) -> u64 {
            7
        }
    }

    fn buffer(slots: usize, node: usize) -> Vec<u8> {
        vec![0u8; slots * node]
    }

    #[test]
    fn test_put_get_kill() {
        let node = FixedHashTable::<Id, u64>::node_size();
        let mut buf = buffer(101, node);
        let mut table = FixedHashTable::<Id, u64>::new("records", &mut buf).unwrap();

        table.put(&Id(1), 100).unwrap();
        table.put(&Id(2), 200).unwrap();
        assert_eq!(table.get(&Id(1)), Some(100));
        assert_eq!(table.get(&Id(2)), Some(200));
        assert_eq!(table.get(&Id(3)), None);
        assert_eq!(table.len(), 2);

        table.kill(&Id(1));
        assert_eq!(table.get(&Id(1)), None);
        assert_eq!(table.get(&Id(2)), Some(200));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_put_overwrites_same_key() {
        let node = FixedHashTable::<Id, u64>::node_size();
        let mut buf = buffer(101, node);
        let mut table = FixedHashTable::<Id, u64>::new("records", &mut buf).unwrap();

        table.put(&Id(1), 100).unwrap();
        table.put(&Id(1), 500).unwrap();
        assert_eq!(table.get(&Id(1)), Some(500));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_capacity_forced_odd() {
        let node = FixedHashTable::<Id, u64>::node_size();
        let mut buf = buffer(10, node);
        let table = FixedHashTable::<Id, u64>::new("records", &mut buf).unwrap();
        assert_eq!(table.capacity(), 9);

        let mut tiny = vec![0u8; node - 1];
        assert!(FixedHashTable::<Id, u64>::new("records", &mut tiny).is_none());
    }

    #[test]
    fn test_node_size_derived_from_types() {
        assert_eq!(FixedHashTable::<Id, u64>::node_size(), 8 + 8 + 8);
        assert_eq!(FixedHashTable::<Id, u8>::node_size(), 8 + 8 + 1);
    }

    #[test]
    fn test_chain_limit_falls_back_to_first_unused() {
        // 41 slots → a probe chain of 2
        let node = FixedHashTable::<Colliding, u64>::node_size();
        let mut buf = buffer(41, node);
        let mut table = FixedHashTable::<Colliding, u64>::new("records", &mut buf).unwrap();
        assert_eq!(table.capacity(), 41);

        table.put(&Colliding(1), 1).unwrap();
        table.put(&Colliding(2), 2).unwrap();
        // the chain is exhausted and no slot was free along it
        assert_eq!(table.put(&Colliding(3), 3), Err(TableFull));

        // freeing a slot on the chain makes room again
        table.kill(&Colliding(1));
        table.put(&Colliding(3), 3).unwrap();
        assert_eq!(table.get(&Colliding(3)), Some(3));
        assert_eq!(table.get(&Colliding(2)), Some(2));
    }

    #[test]
    fn test_for_each_visits_in_array_order() {
        let node = FixedHashTable::<Id, u64>::node_size();
        let mut buf = buffer(101, node);
        let mut table = FixedHashTable::<Id, u64>::new("records", &mut buf).unwrap();
        for i in 1..=20u64 {
            table.put(&Id(i), i * 10).unwrap();
        }

        let mut seen = Vec::new();
        table.for_each(|k, v| {
            assert_eq!(k.0 * 10, *v);
            seen.push(k.0);
        });
        assert_eq!(seen.len(), 20);
        // array order, not insertion order: every id shows up exactly once
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 20);
    }

    #[test]
    fn test_kill_hook_scrubs_stored_key() {
        #[derive(Debug, Clone, Copy, PartialEq)]
        struct Scrubbed(u64);

        impl TableKey for Scrubbed {
            fn table_hash(&self) -> u64 {
                self.0 | 1
            }
            fn kill(&mut self) {
                self.0 = 0;
            }
        }

        let node = FixedHashTable::<Scrubbed, u64>::node_size();
        let mut buf = buffer(11, node);
        {
            let mut table = FixedHashTable::<Scrubbed, u64>::new("records", &mut buf).unwrap();
            table.put(&Scrubbed(0xdead_beef), 1).unwrap();
            table.kill(&Scrubbed(0xdead_beef));
            assert_eq!(table.get(&Scrubbed(0xdead_beef)), None);
        }
        // the key bytes were wiped out of the backing buffer itself
        assert!(!buf
            .windows(4)
            .any(|w| w == 0xdead_beefu32.to_le_bytes()));
    }
}
