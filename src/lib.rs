//! wolfstore - Replicated Key-Value Store over a Message Bus
//!
//! One endpoint holds the authoritative copy of a named store (the master);
//! other endpoints reach it through a remote proxy (a frontend) or keep a
//! locally cached, eventually consistent replica (a clone).
//!
//! # Architecture
//!
//! The master applies every mutation through a single serialized path and
//! broadcasts it as a sequenced update. Clones apply updates strictly in
//! sequence order, buffer anything early, and replace their mirror from a
//! snapshot on a fixed interval or as soon as they see a gap. Frontend and
//! clone queries are correlated with their replies by request id and give
//! up after a timeout.
//!
//! # Consistency
//!
//! - Writes through a frontend or clone are fire-and-forget; there is no
//!   acknowledgment and no retry.
//! - A clone does not see its own write until the master echoes it back.
//! - A clone's staleness is bounded by its resync interval.

pub mod config;
pub mod error;
pub mod data;
pub mod store;
pub mod bus;
pub mod replication;
pub mod endpoint;

pub use config::WolfStoreConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfStoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::data::Data;
    pub use crate::store::{MemoryStore, Operation, Snapshot, StoreHandle};
    pub use crate::bus::{Bus, LocalBus};
    pub use crate::replication::{Frontend, Master, StoreClone, CloneState};
    pub use crate::endpoint::Endpoint;
}
