//! Store Data Types
//!
//! Defines the structured value type used for both keys and values of a
//! replicated store.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Structured key/value representation
///
/// Every variant is totally ordered and hashable so that `Data` can be used
/// as a map key. Reals are ordered with [`f64::total_cmp`], which makes two
/// reals equal exactly when their bit patterns are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Data {
    None,
    Bool(bool),
    Count(u64),
    Integer(i64),
    Real(f64),
    String(String),
    Bytes(Vec<u8>),
    Vector(Vec<Data>),
    Set(BTreeSet<Data>),
    Table(BTreeMap<Data, Data>),
}

impl Data {
    /// Variant rank used for cross-variant ordering
    fn rank(&self) -> u8 {
        match self {
            Data::None => 0,
            Data::Bool(_) => 1,
            Data::Count(_) => 2,
            Data::Integer(_) => 3,
            Data::Real(_) => 4,
            Data::String(_) => 5,
            Data::Bytes(_) => 6,
            Data::Vector(_) => 7,
            Data::Set(_) => 8,
            Data::Table(_) => 9,
        }
    }
}

impl Ord for Data {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Data::None, Data::None) => Ordering::Equal,
            (Data::Bool(a), Data::Bool(b)) => a.cmp(b),
            (Data::Count(a), Data::Count(b)) => a.cmp(b),
            (Data::Integer(a), Data::Integer(b)) => a.cmp(b),
            (Data::Real(a), Data::Real(b)) => a.total_cmp(b),
            (Data::String(a), Data::String(b)) => a.cmp(b),
            (Data::Bytes(a), Data::Bytes(b)) => a.cmp(b),
            (Data::Vector(a), Data::Vector(b)) => a.cmp(b),
            (Data::Set(a), Data::Set(b)) => a.cmp(b),
            (Data::Table(a), Data::Table(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Data {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Data {}

impl std::hash::Hash for Data {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Data::None => {}
            Data::Bool(b) => b.hash(state),
            Data::Count(c) => c.hash(state),
            Data::Integer(i) => i.hash(state),
            Data::Real(r) => r.to_bits().hash(state),
            Data::String(s) => s.hash(state),
            Data::Bytes(b) => b.hash(state),
            Data::Vector(v) => v.hash(state),
            Data::Set(s) => s.hash(state),
            Data::Table(t) => t.hash(state),
        }
    }
}

impl std::fmt::Display for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Data::None => write!(f, "nil"),
            Data::Bool(b) => write!(f, "{}", if *b { "T" } else { "F" }),
            Data::Count(c) => write!(f, "{}", c),
            Data::Integer(i) => write!(f, "{:+}", i),
            Data::Real(r) => write!(f, "{}", r),
            Data::String(s) => write!(f, "{:?}", s),
            Data::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Data::Vector(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Data::Set(s) => {
                let parts: Vec<String> = s.iter().map(|x| x.to_string()).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Data::Table(t) => {
                let parts: Vec<String> = t
                    .iter()
                    .map(|(k, v)| format!("{} -> {}", k, v))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::String(value.to_string())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::String(value)
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Bool(value)
    }
}

impl From<u64> for Data {
    fn from(value: u64) -> Self {
        Data::Count(value)
    }
}

impl From<i64> for Data {
    fn from(value: i64) -> Self {
        Data::Integer(value)
    }
}

impl From<f64> for Data {
    fn from(value: f64) -> Self {
        Data::Real(value)
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Data::Bytes(value)
    }
}
