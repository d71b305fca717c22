use std::ops::RangeInclusive;

use thiserror::Error;

/// Error types returned by this crate.
///
/// Variant names mirror the communications error codes in spec §6
/// (`COMMUNICATIONS_*`, `PROTOCOL_*`) rather than generic I/O terms, so that
/// callers matching on them read the same way the wire-level taxonomy in §7
/// does.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// `PROTOCOL_INCOMPLETE_PACKET`: the header's `body_length` claims more
    /// bytes than remain in the buffer, or fewer bytes were read than the
    /// header promised.
    #[error("incomplete packet (got {buffer_len} bytes, expected {expected})")]
    IncompletePacket { buffer_len: usize, expected: usize },

    /// The buffer is too small to contain even the fixed-size header.
    #[error("incomplete header")]
    IncompleteHeader,

    /// `PROTOCOL_VERSION_ERROR`: the peer's protocol version falls outside
    /// the range this build supports.
    #[error("unsupported protocol version {got} (supported {supported:?})")]
    VersionError {
        got: u16,
        supported: RangeInclusive<u16>,
        /// The sender's uid, when it could be extracted from the
        /// credential before giving up on the connection (spec §4.2).
        peer_uid: Option<u32>,
    },

    /// `PROTOCOL_AUTHENTICATION_ERROR`: the auth credential failed to
    /// unpack or failed verification.
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// A message violated one of the request/response shape invariants in
    /// spec §3 (e.g. `return_count > 0` on the single-reply receive path).
    /// Per §7 item 5 this is surfaced to callers as [`Error::IncompletePacket`];
    /// the variant exists so internal code can log the precise cause first.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A variable-length field's declared length would read past the end
    /// of the buffer, or past a hard cap (e.g. the address-array count
    /// exceeding `NO_VAL`).
    #[error("invalid length in message")]
    InvalidLength,

    /// `COMMUNICATIONS_CONNECTION_ERROR`: could not establish a TCP
    /// connection to any resolved endpoint within the retry budget.
    #[error("connection error: {0}")]
    ConnectionError(#[source] std::io::Error),

    /// `COMMUNICATIONS_SEND_ERROR`.
    #[error("send error: {0}")]
    SendError(#[source] std::io::Error),

    /// `COMMUNICATIONS_RECEIVE_ERROR`.
    #[error("receive error: {0}")]
    ReceiveError(#[source] std::io::Error),

    /// `COMMUNICATIONS_SHUTDOWN_ERROR`.
    #[error("shutdown error: {0}")]
    ShutdownError(#[source] std::io::Error),

    /// The peer closed the connection mid-exchange (`ENOTCONN` and
    /// friends); logged as "peer disappeared" per spec §4.6 step 5.
    #[error("peer disappeared")]
    PeerDisappeared,

    /// Every candidate port in a `listen_range` scan refused to bind.
    #[error("no free port in range {0}..={1}")]
    PortRangeExhausted(u16, u16),

    /// The controller retry budget was exhausted without a response.
    #[error("controller unreachable after {attempts} attempt(s)")]
    ControllerUnreachable { attempts: usize },

    /// Generic I/O failure not covered by a more specific variant above.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A thin wrapper that maps a generic [`Error`] onto the `CONTROLLER_*`
/// variants of the communications error codes (spec §6 /§7's "explicit
/// remap helper" invoked by controller-path callers after each call).
#[derive(Debug, Error)]
#[error("controller rpc failed: {0}")]
pub struct ControllerError(#[source] pub Error);

impl Error {
    /// Remaps a generic communications error onto its controller-layer
    /// equivalent. Framing/auth/version errors are controller errors too
    /// once they occur on the controller socket, so everything is wrapped
    /// uniformly rather than re-matched variant by variant.
    pub fn into_controller_error(self) -> ControllerError {
        ControllerError(self)
    }
}

/// `COMMUNICATIONS_CONNECTION_ERROR` (spec §6).
pub const COMMUNICATIONS_CONNECTION_ERROR: u32 = 1;
/// `COMMUNICATIONS_SEND_ERROR` (spec §6).
pub const COMMUNICATIONS_SEND_ERROR: u32 = 2;
/// `COMMUNICATIONS_RECEIVE_ERROR` (spec §6).
pub const COMMUNICATIONS_RECEIVE_ERROR: u32 = 3;
/// `COMMUNICATIONS_SHUTDOWN_ERROR` (spec §6).
pub const COMMUNICATIONS_SHUTDOWN_ERROR: u32 = 4;
/// `PROTOCOL_VERSION_ERROR` (spec §6).
pub const PROTOCOL_VERSION_ERROR: u32 = 5;
/// `PROTOCOL_AUTHENTICATION_ERROR` (spec §6).
pub const PROTOCOL_AUTHENTICATION_ERROR: u32 = 6;
/// `PROTOCOL_INCOMPLETE_PACKET` (spec §6).
pub const PROTOCOL_INCOMPLETE_PACKET: u32 = 7;
/// `CONTROLLER_CONNECTION_ERROR` (spec §6).
pub const CONTROLLER_CONNECTION_ERROR: u32 = 8;

impl Error {
    /// Maps this error onto the numeric wire-level error code from spec §6,
    /// as carried in a [`crate::message::ReturnEntry::error_code`] when a
    /// forwarding-tree child fails.
    pub fn code(&self) -> u32 {
        match self {
            Error::ConnectionError(_) => COMMUNICATIONS_CONNECTION_ERROR,
            Error::SendError(_) => COMMUNICATIONS_SEND_ERROR,
            Error::ReceiveError(_) => COMMUNICATIONS_RECEIVE_ERROR,
            Error::ShutdownError(_) => COMMUNICATIONS_SHUTDOWN_ERROR,
            Error::VersionError { .. } => PROTOCOL_VERSION_ERROR,
            Error::AuthError(_) => PROTOCOL_AUTHENTICATION_ERROR,
            Error::IncompletePacket { .. }
            | Error::IncompleteHeader
            | Error::InvalidLength
            | Error::ProtocolViolation(_) => PROTOCOL_INCOMPLETE_PACKET,
            Error::PeerDisappeared => COMMUNICATIONS_RECEIVE_ERROR,
            Error::PortRangeExhausted(..) => COMMUNICATIONS_CONNECTION_ERROR,
            Error::ControllerUnreachable { .. } => CONTROLLER_CONNECTION_ERROR,
            Error::Io(_) => COMMUNICATIONS_CONNECTION_ERROR,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::ConnectionError(e)
            | Error::SendError(e)
            | Error::ReceiveError(e)
            | Error::ShutdownError(e) => e,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
