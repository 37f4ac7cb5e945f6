//! Predicate model and field-range extraction
//!
//! The router does not execute queries; it only needs to know, for the
//! first field of the shard key, which intervals of the key space a
//! predicate can touch. `FieldRange::for_field` compiles a `Predicate`
//! down to a normalized interval list that `ChunkManager` maps onto the
//! coalesced range index.

use std::cmp::Ordering;

use crate::data::{Document, Value};

// ============================================================================
// Predicates
// ============================================================================

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
}

/// A routing predicate over document fields
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Matches everything
    All,
    /// Compare one field to a value
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// Field is one of the listed values
    In { field: String, values: Vec<Value> },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Operators the router cannot reason about (`$near`, text search, ...)
    Special { field: String, kind: String },
}

impl Predicate {
    /// Whether a document matches; used by the in-process backend
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Compare { field, op, value } => match doc.get(field) {
                Some(v) => {
                    let ord = v.cmp(value);
                    match op {
                        CompareOp::Equal => ord == Ordering::Equal,
                        CompareOp::NotEqual => ord != Ordering::Equal,
                        CompareOp::LessThan => ord == Ordering::Less,
                        CompareOp::LessEqual => ord != Ordering::Greater,
                        CompareOp::GreaterThan => ord == Ordering::Greater,
                        CompareOp::GreaterEqual => ord != Ordering::Less,
                    }
                }
                None => false,
            },
            Predicate::In { field, values } => doc
                .get(field)
                .map(|v| values.iter().any(|x| x == v))
                .unwrap_or(false),
            Predicate::And(children) => children.iter().all(|p| p.matches(doc)),
            Predicate::Or(children) => children.iter().any(|p| p.matches(doc)),
            Predicate::Special { .. } => false,
        }
    }
}

// ============================================================================
// Field ranges
// ============================================================================

/// One endpoint of an interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBound {
    pub value: Value,
    pub inclusive: bool,
}

/// A closed/open interval over one field's values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInterval {
    pub lower: FieldBound,
    pub upper: FieldBound,
}

impl FieldInterval {
    fn point(value: Value) -> Self {
        Self {
            lower: FieldBound {
                value: value.clone(),
                inclusive: true,
            },
            upper: FieldBound {
                value,
                inclusive: true,
            },
        }
    }

    fn universe() -> Self {
        Self {
            lower: FieldBound {
                value: Value::MinKey,
                inclusive: true,
            },
            upper: FieldBound {
                value: Value::MaxKey,
                inclusive: true,
            },
        }
    }

    fn valid(&self) -> bool {
        match self.lower.value.cmp(&self.upper.value) {
            Ordering::Less => true,
            Ordering::Equal => self.lower.inclusive && self.upper.inclusive,
            Ordering::Greater => false,
        }
    }

    fn is_point(&self) -> bool {
        self.lower.value == self.upper.value
    }

    /// Intersection of two intervals, if nonempty
    fn intersect(&self, other: &Self) -> Option<Self> {
        let lower = match self.lower.value.cmp(&other.lower.value) {
            Ordering::Greater => self.lower.clone(),
            Ordering::Less => other.lower.clone(),
            Ordering::Equal => FieldBound {
                value: self.lower.value.clone(),
                inclusive: self.lower.inclusive && other.lower.inclusive,
            },
        };
        let upper = match self.upper.value.cmp(&other.upper.value) {
            Ordering::Less => self.upper.clone(),
            Ordering::Greater => other.upper.clone(),
            Ordering::Equal => FieldBound {
                value: self.upper.value.clone(),
                inclusive: self.upper.inclusive && other.upper.inclusive,
            },
        };
        let merged = Self { lower, upper };
        merged.valid().then_some(merged)
    }

    /// Whether `other` starts inside or adjacent to this interval
    fn touches(&self, other: &Self) -> bool {
        match self.upper.value.cmp(&other.lower.value) {
            Ordering::Greater => true,
            Ordering::Equal => self.upper.inclusive || other.lower.inclusive,
            Ordering::Less => false,
        }
    }
}

/// The set of intervals one field's values are restricted to
#[derive(Debug, Clone)]
pub struct FieldRange {
    intervals: Vec<FieldInterval>,
    special: Option<String>,
}

impl FieldRange {
    /// Compile a predicate down to the range it allows for `field`
    pub fn for_field(predicate: &Predicate, field: &str) -> Self {
        match predicate {
            Predicate::All => Self::universe(),
            Predicate::Compare {
                field: f,
                op,
                value,
            } => {
                if f != field {
                    return Self::universe();
                }
                let interval = match op {
                    CompareOp::Equal => FieldInterval::point(value.clone()),
                    // exclusion cannot narrow a contiguous key range
                    CompareOp::NotEqual => FieldInterval::universe(),
                    CompareOp::LessThan | CompareOp::LessEqual => FieldInterval {
                        lower: FieldBound {
                            value: Value::MinKey,
                            inclusive: true,
                        },
                        upper: FieldBound {
                            value: value.clone(),
                            inclusive: *op == CompareOp::LessEqual,
                        },
                    },
                    CompareOp::GreaterThan | CompareOp::GreaterEqual => FieldInterval {
                        lower: FieldBound {
                            value: value.clone(),
                            inclusive: *op == CompareOp::GreaterEqual,
                        },
                        upper: FieldBound {
                            value: Value::MaxKey,
                            inclusive: true,
                        },
                    },
                };
                Self {
                    intervals: vec![interval],
                    special: None,
                }
            }
            Predicate::In { field: f, values } => {
                if f != field {
                    return Self::universe();
                }
                let mut points: Vec<Value> = values.clone();
                points.sort();
                points.dedup();
                Self {
                    intervals: points.into_iter().map(FieldInterval::point).collect(),
                    special: None,
                }
            }
            Predicate::And(children) => {
                let mut range = Self::universe();
                for child in children {
                    range = range.intersect(Self::for_field(child, field));
                }
                range
            }
            Predicate::Or(children) => {
                if children.is_empty() {
                    return Self::empty();
                }
                let mut range = Self::empty();
                for child in children {
                    range = range.union(Self::for_field(child, field));
                }
                range
            }
            Predicate::Special { field: f, kind } => {
                let mut range = Self::universe();
                if f == field {
                    range.special = Some(kind.clone());
                }
                range
            }
        }
    }

    fn universe() -> Self {
        Self {
            intervals: vec![FieldInterval::universe()],
            special: None,
        }
    }

    fn empty() -> Self {
        Self {
            intervals: Vec::new(),
            special: None,
        }
    }

    /// Operator kind the router has no support for, if any
    pub fn special(&self) -> Option<&str> {
        self.special.as_deref()
    }

    /// No value can match
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Exactly one value can match
    pub fn equality(&self) -> Option<&Value> {
        match self.intervals.as_slice() {
            [only] if only.is_point() => Some(&only.lower.value),
            _ => None,
        }
    }

    /// Whether the range actually restricts anything
    pub fn nontrivial(&self) -> bool {
        !self.is_empty() && self.intervals != vec![FieldInterval::universe()]
    }

    pub fn intervals(&self) -> &[FieldInterval] {
        &self.intervals
    }

    fn intersect(self, other: Self) -> Self {
        let special = self.special.or(other.special);
        let mut intervals = Vec::new();
        for a in &self.intervals {
            for b in &other.intervals {
                if let Some(i) = a.intersect(b) {
                    intervals.push(i);
                }
            }
        }
        Self { intervals, special }.normalized()
    }

    fn union(self, other: Self) -> Self {
        let special = self.special.or(other.special);
        let mut intervals = self.intervals;
        intervals.extend(other.intervals);
        Self { intervals, special }.normalized()
    }

    /// Sort by lower bound and merge overlapping/adjacent intervals
    fn normalized(mut self) -> Self {
        self.intervals.sort_by(|a, b| {
            a.lower.value.cmp(&b.lower.value).then_with(|| {
                // inclusive lower bound starts first
                b.lower.inclusive.cmp(&a.lower.inclusive)
            })
        });
        let mut merged: Vec<FieldInterval> = Vec::with_capacity(self.intervals.len());
        for interval in self.intervals.drain(..) {
            match merged.last_mut() {
                Some(last) if last.touches(&interval) => {
                    match last.upper.value.cmp(&interval.upper.value) {
                        Ordering::Less => last.upper = interval.upper,
                        Ordering::Equal => last.upper.inclusive |= interval.upper.inclusive,
                        Ordering::Greater => {}
                    }
                }
                _ => merged.push(interval),
            }
        }
        self.intervals = merged;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
