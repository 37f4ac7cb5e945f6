//! Shard key patterns and key ordering
//!
//! A `ShardKeyPattern` is the ordered list of fields (with per-field
//! direction) that partitions a collection. It compares documents, extracts
//! key documents, and produces the `OrderedKey` values that the chunk map
//! and range index use as `BTreeMap` keys, so that map order always equals
//! shard-key order even for descending fields.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::data::{Document, Value};
use crate::{ClusterError, Result};

// ============================================================================
// Pattern
// ============================================================================

/// One field of a shard key pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    /// Sort direction: false for `{field: 1}`, true for `{field: -1}`
    pub descending: bool,
}

/// The ordered list of fields that partitions a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<KeyField>,
}

impl ShardKeyPattern {
    /// Build a pattern from a `{field: ±1, ...}` document
    pub fn new(pattern: &Document) -> Result<Self> {
        let mut fields = Vec::with_capacity(pattern.len());
        for (name, dir) in pattern.iter() {
            let descending = match dir {
                Value::Int(1) => false,
                Value::Int(-1) => true,
                other => {
                    return Err(ClusterError::InvalidRecord(format!(
                        "shard key direction for '{}' must be 1 or -1, got {}",
                        name, other
                    )))
                }
            };
            fields.push(KeyField {
                name: name.to_string(),
                descending,
            });
        }
        if fields.is_empty() {
            return Err(ClusterError::InvalidRecord(
                "shard key pattern has no fields".into(),
            ));
        }
        Ok(Self { fields })
    }

    /// Single ascending field, the common case
    pub fn on(field: &str) -> Self {
        Self {
            fields: vec![KeyField {
                name: field.to_string(),
                descending: false,
            }],
        }
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    /// Name of the first pattern field (query planning reduces to it)
    pub fn first_field(&self) -> &str {
        &self.fields[0].name
    }

    /// The `{field: ±1}` document sent to backend commands
    pub fn pattern_doc(&self) -> Document {
        let mut d = Document::new();
        for f in &self.fields {
            d.push(&f.name, if f.descending { -1 } else { 1 });
        }
        d
    }

    // ========================================================================
    // Sentinels
    // ========================================================================

    /// Key document sorting below every real key under this pattern
    pub fn global_min(&self) -> Document {
        let mut d = Document::new();
        for f in &self.fields {
            d.push(
                &f.name,
                if f.descending { Value::MaxKey } else { Value::MinKey },
            );
        }
        d
    }

    /// Key document sorting above every real key under this pattern
    pub fn global_max(&self) -> Document {
        let mut d = Document::new();
        for f in &self.fields {
            d.push(
                &f.name,
                if f.descending { Value::MinKey } else { Value::MaxKey },
            );
        }
        d
    }

    // ========================================================================
    // Extraction / comparison
    // ========================================================================

    /// Whether every pattern field is present in the document
    pub fn has_shard_key(&self, doc: &Document) -> bool {
        self.fields.iter().all(|f| doc.get(&f.name).is_some())
    }

    /// Pull the shard key out of a document, fields in pattern order.
    /// Returns `None` if any pattern field is missing.
    pub fn extract_key(&self, doc: &Document) -> Option<Document> {
        let mut key = Document::new();
        for f in &self.fields {
            key.push(&f.name, doc.get(&f.name)?.clone());
        }
        Some(key)
    }

    /// Compare two documents under the pattern. Missing fields compare as
    /// `Null`; direction is applied per field.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for f in &self.fields {
            let av = a.get(&f.name).unwrap_or(&Value::Null);
            let bv = b.get(&f.name).unwrap_or(&Value::Null);
            let mut ord = av.cmp(bv);
            if f.descending {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Build the map key for a (possibly partial) key document. Values are
    /// taken in pattern order up to the first missing field, so a
    /// first-field-only bound compares as a proper prefix.
    pub fn ordered(&self, doc: &Document) -> OrderedKey {
        let mut values = Vec::with_capacity(self.fields.len());
        for f in &self.fields {
            match doc.get(&f.name) {
                Some(v) => values.push(OrderedValue {
                    value: v.clone(),
                    descending: f.descending,
                }),
                None => break,
            }
        }
        OrderedKey(values)
    }

    /// Map key for a bare first-field value
    pub fn ordered_first(&self, value: Value) -> OrderedKey {
        OrderedKey(vec![OrderedValue {
            value,
            descending: self.fields[0].descending,
        }])
    }

    /// The `min ≤ key < max` predicate for a chunk
    pub fn filter(&self, min: &Document, max: &Document) -> ChunkFilter {
        ChunkFilter {
            min: min.clone(),
            max: max.clone(),
        }
    }
}

// ============================================================================
// Ordered keys
// ============================================================================

/// One key value with the pattern direction baked in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderedValue {
    value: Value,
    descending: bool,
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let ord = self.value.cmp(&other.value);
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrderedValue {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for OrderedValue {}

/// A shard key in map order: `BTreeMap<OrderedKey, _>` iterates in
/// shard-key order regardless of field directions. Shorter keys sort
/// before longer keys sharing the same prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderedKey(Vec<OrderedValue>);

// ============================================================================
// Chunk filter
// ============================================================================

/// The half-open predicate `min ≤ shard_key < max`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFilter {
    pub min: Document,
    pub max: Document,
}

impl ChunkFilter {
    /// Whether a document's shard key falls inside the range
    pub fn matches(&self, pattern: &ShardKeyPattern, doc: &Document) -> bool {
        pattern.compare(&self.min, doc) != Ordering::Greater
            && pattern.compare(doc, &self.max) == Ordering::Less
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, i64)]) -> Document {
        let mut d = Document::new();
        for (n, v) in pairs {
            d.push(*n, *v);
        }
        d
    }

    #[test]
    fn test_global_bounds_are_extremes() {
        let key = ShardKeyPattern::on("a");
        let d = doc(&[("a", i64::MIN)]);
        assert_eq!(key.compare(&key.global_min(), &d), Ordering::Less);
        assert_eq!(key.compare(&d, &key.global_max()), Ordering::Less);
    }

    #[test]
    fn test_global_bounds_descending() {
        let key = ShardKeyPattern::new(&Document::new().with("a", -1)).unwrap();
        let d = doc(&[("a", 0)]);
        // under {a: -1}, larger values sort first
        assert_eq!(key.compare(&key.global_min(), &d), Ordering::Less);
        assert_eq!(key.compare(&d, &key.global_max()), Ordering::Less);
        assert_eq!(
            key.compare(&doc(&[("a", 10)]), &doc(&[("a", 5)])),
            Ordering::Less
        );
    }

    #[test]
    fn test_extract_key() {
        let key = ShardKeyPattern::new(&Document::new().with("a", 1).with("b", 1)).unwrap();
        let d = Document::new().with("b", 2).with("x", 9).with("a", 1);
        let extracted = key.extract_key(&d).unwrap();
        assert_eq!(extracted, Document::new().with("a", 1).with("b", 2));
        assert!(key.extract_key(&Document::new().with("a", 1)).is_none());
        assert!(key.has_shard_key(&d));
    }

    #[test]
    fn test_compound_compare() {
        let key = ShardKeyPattern::new(&Document::new().with("a", 1).with("b", 1)).unwrap();
        assert_eq!(
            key.compare(&doc(&[("a", 1), ("b", 5)]), &doc(&[("a", 2), ("b", 0)])),
            Ordering::Less
        );
        assert_eq!(
            key.compare(&doc(&[("a", 1), ("b", 5)]), &doc(&[("a", 1), ("b", 5)])),
            Ordering::Equal
        );
    }

    #[test]
    fn test_ordered_key_prefix_sorts_first() {
        let key = ShardKeyPattern::new(&Document::new().with("a", 1).with("b", 1)).unwrap();
        let partial = key.ordered(&doc(&[("a", 5)]));
        let full = key.ordered(&doc(&[("a", 5), ("b", 0)]));
        assert!(partial < full);
    }

    #[test]
    fn test_ordered_key_respects_direction() {
        let key = ShardKeyPattern::new(&Document::new().with("a", -1)).unwrap();
        let ten = key.ordered(&doc(&[("a", 10)]));
        let five = key.ordered(&doc(&[("a", 5)]));
        assert!(ten < five);
    }

    #[test]
    fn test_chunk_filter() {
        let key = ShardKeyPattern::on("a");
        let f = key.filter(&doc(&[("a", 10)]), &doc(&[("a", 20)]));
        assert!(f.matches(&key, &Document::new().with("a", 10).with("z", 1)));
        assert!(f.matches(&key, &Document::new().with("a", 19)));
        assert!(!f.matches(&key, &Document::new().with("a", 20)));
        assert!(!f.matches(&key, &Document::new().with("a", 9)));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        assert!(ShardKeyPattern::new(&Document::new()).is_err());
        assert!(ShardKeyPattern::new(&Document::new().with("a", 2)).is_err());
    }
}
