//! Replication Module
//!
//! The three kinds of store handle (master, frontend, clone), the wire
//! protocol between them, and request/reply correlation.

pub mod protocol;
pub(crate) mod master;
mod frontend;
mod clone;
mod response_queue;

pub use protocol::{Answer, ErrorCode, FrameHeader, Message, Query, RemoteError, RequestId};
pub use master::Master;
pub use frontend::Frontend;
pub use clone::{CloneState, Replica, StoreClone, UpdateOutcome};
pub use response_queue::{Reply, ResponseQueue, Waiter};
