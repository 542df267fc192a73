//! Store Operations
//!
//! Mutation and full-state types exchanged between a master and its
//! replicas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data::Data;

/// Sequence number assigned by the master to every applied operation
pub type Sequence = u64;

/// A single store mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Upsert a key
    Insert { key: Data, value: Data },
    /// Remove a key if present
    Erase { key: Data },
    /// Remove every key
    Clear,
}

impl Operation {
    /// Get the operation name (for logging)
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Erase { .. } => "erase",
            Operation::Clear => "clear",
        }
    }
}

/// Full store contents as of a sequence number
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Sequence of the last operation reflected in `entries`
    pub sequence: Sequence,
    /// Every key/value pair
    pub entries: BTreeMap<Data, Data>,
}
