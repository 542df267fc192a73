//! Replication Protocol
//!
//! Defines the messages exchanged over the bus between masters, frontends
//! and clones, the topic layout, and the framed binary encoding.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::data::Data;
use crate::error::{Error, Result};
use crate::store::{Operation, Sequence, Snapshot};

/// Correlation token for a request awaiting a reply
pub type RequestId = Uuid;

/// Topic prefix for update broadcasts
pub const UPDATE_PREFIX: &str = "wolfstore.update.";
/// Topic prefix for requests addressed to masters
pub const REQUEST_PREFIX: &str = "wolfstore.request.";
/// Topic prefix for per-endpoint reply inboxes
pub const REPLY_PREFIX: &str = "wolfstore.reply.";

/// Topic carrying the update stream of a store
pub fn update_topic(store: &str) -> String {
    format!("{}{}", UPDATE_PREFIX, store)
}

/// Topic carrying requests for a store
pub fn request_topic(store: &str) -> String {
    format!("{}{}", REQUEST_PREFIX, store)
}

/// Topic carrying replies for an endpoint inbox
pub fn reply_topic(inbox: &Uuid) -> String {
    format!("{}{}", REPLY_PREFIX, inbox)
}

/// Read-only query against a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    Lookup(Data),
    Exists(Data),
    Keys,
    Size,
}

impl Query {
    /// Get the query name (for logging)
    pub fn kind(&self) -> &'static str {
        match self {
            Query::Lookup(_) => "lookup",
            Query::Exists(_) => "exists",
            Query::Keys => "keys",
            Query::Size => "size",
        }
    }
}

/// Successful answer to a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Answer {
    Value(Option<Data>),
    Exists(bool),
    Keys(BTreeSet<Data>),
    Size(u64),
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No master hosts the named store
    StoreNotFound,
}

/// Error carried back to a requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

/// Protocol messages carried on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // ========== Requests ==========
    /// Mutation forwarded to the master (never acknowledged)
    Mutation {
        store: String,
        operation: Operation,
    },

    /// Query forwarded to the master
    Query {
        store: String,
        request_id: RequestId,
        reply_to: String,
        query: Query,
    },

    /// Full state request from a clone
    SnapshotRequest {
        store: String,
        request_id: RequestId,
        reply_to: String,
    },

    // ========== Broadcast ==========
    /// Sequenced mutation applied by the master
    Update {
        store: String,
        sequence: Sequence,
        operation: Operation,
    },

    // ========== Replies ==========
    /// Query response
    Response {
        request_id: RequestId,
        result: std::result::Result<Answer, RemoteError>,
    },

    /// Snapshot response
    Snapshot {
        request_id: RequestId,
        snapshot: Snapshot,
    },
}

impl Message {
    /// Encode message into a framed buffer
    pub fn encode(&self) -> Result<Bytes> {
        let body = bincode::serialize(self)?;
        let header = FrameHeader::new(&body);

        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + body.len());
        buf.put_slice(&header.to_bytes());
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode message from a framed buffer
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < FrameHeader::SIZE {
            return Err(Error::Codec(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }

        let (head, body) = frame.split_at(FrameHeader::SIZE);
        let mut header_bytes = [0u8; FrameHeader::SIZE];
        header_bytes.copy_from_slice(head);
        let header = FrameHeader::from_bytes(&header_bytes);

        if header.length as usize != body.len() {
            return Err(Error::Codec(format!(
                "length mismatch: header says {}, body has {}",
                header.length,
                body.len()
            )));
        }

        if crc32fast::hash(body) != header.checksum {
            return Err(Error::Codec("Message checksum mismatch".into()));
        }

        Ok(bincode::deserialize(body)?)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Mutation { .. } => "Mutation",
            Message::Query { .. } => "Query",
            Message::SnapshotRequest { .. } => "SnapshotRequest",
            Message::Update { .. } => "Update",
            Message::Response { .. } => "Response",
            Message::Snapshot { .. } => "Snapshot",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);
        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}
