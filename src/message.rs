//! The logical exchange unit (spec §3): what callers build to send and get
//! back from `receive`/`receive_many`. The wire encoding lives in
//! [`crate::frame`] and [`crate::header`]; this module is the
//! caller-facing shape, created by the sender and mutated only during its
//! single exchange (spec §3 "Lifecycle").

use std::net::TcpStream;

use crate::endpoint::Endpoint;
use crate::error;
use crate::forward::Forward;

/// Sentinel `message_type` used for a [`ReturnEntry`] that represents an
/// unreachable forwarding-tree child rather than a decoded reply (spec
/// §3's Return-data Entry).
pub const FORWARD_FAILED: u16 = 0xFFFF;

/// One node's outcome in an aggregated (fan-out) response (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnEntry {
    pub node_name: String,
    pub message_type: u16,
    pub error_code: u32,
    pub payload: Vec<u8>,
}

impl ReturnEntry {
    /// Builds a [`FORWARD_FAILED`] entry for a node that didn't answer in
    /// time, carrying `err`'s wire error code (spec §4.7, §7: "never a
    /// silent drop").
    pub fn forward_failed(node_name: impl Into<String>, err: &error::Error) -> Self {
        Self {
            node_name: node_name.into(),
            message_type: FORWARD_FAILED,
            error_code: err.code(),
            payload: Vec::new(),
        }
    }

    pub fn is_forward_failed(&self) -> bool {
        self.message_type == FORWARD_FAILED
    }
}

/// The logical message exchanged between core components (spec §3).
///
/// `conn` corresponds to spec's `conn_fd`: the socket the message arrived
/// on, kept so a server-side handler can send its response back without a
/// separate lookup.
#[derive(Debug)]
pub struct Message {
    pub protocol_version: u16,
    pub message_type: u16,
    pub flags: u16,
    pub address: Option<Endpoint>,
    pub orig_address: Option<Endpoint>,
    pub forward: Forward,
    pub ret_list: Vec<ReturnEntry>,
    /// Packed credential bytes: produced by [`crate::auth::Authenticator::pack`]
    /// on send, or the as-received bytes after a successful `receive`.
    pub auth_credential: Vec<u8>,
    /// Opaque, codec-specific payload bytes (spec §1: "the core treats the
    /// payload as an opaque body plus a message-type tag").
    pub payload: Vec<u8>,
    pub conn: Option<TcpStream>,
}

impl Message {
    /// Builds a fresh outgoing message. `forward` starts unset (spec §3's
    /// "sentinel meaning 'no forwarding'"); the Message Engine fills in a
    /// configuration-derived default the first time it's sent.
    pub fn new(protocol_version: u16, message_type: u16, flags: u16, payload: Vec<u8>) -> Self {
        Self {
            protocol_version,
            message_type,
            flags,
            address: None,
            orig_address: None,
            forward: Forward::none(),
            ret_list: Vec::new(),
            auth_credential: Vec::new(),
            payload,
            conn: None,
        }
    }

    /// Derives the message a forwarding-tree hop sends to one child bucket:
    /// same protocol/type/flags/payload, a reduced `forward` descriptor,
    /// and a clean per-exchange state (spec §4.7: "re-frame the original
    /// message with a reduced forwarding descriptor").
    pub fn clone_for_forward(&self, forward: Forward) -> Self {
        Self {
            protocol_version: self.protocol_version,
            message_type: self.message_type,
            flags: self.flags,
            address: self.address,
            orig_address: self.orig_address,
            forward,
            ret_list: Vec::new(),
            auth_credential: Vec::new(),
            payload: self.payload.clone(),
            conn: None,
        }
    }
}
