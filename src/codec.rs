//! The payload boundary (spec §1, §9 "Polymorphism over payloads"): the
//! core never interprets a message's payload bytes itself. This module is
//! the seam external callers hang their own codecs off of — a registry
//! keyed by `message_type`, so a server loop can dispatch "decode these
//! bytes for this tag" without the engine or forwarding tree needing to
//! know what's inside.
//!
//! Nothing in `src/engine.rs` or `src/tree.rs` depends on this module; it
//! exists for applications built on top of this crate, the same way
//! concrete message-type payloads are an external collaborator per spec
//! §1.

use std::any::Any;
use std::collections::HashMap;

use crate::error::Error;

/// A codec for one payload shape, registered against a `message_type` tag.
///
/// Implementations are typically a thin wrapper around an existing
/// serialization format (bincode, a hand-rolled XDR-style encoder, ...);
/// this trait only fixes the boundary, not the wire format.
pub trait PayloadCodec: Send + Sync {
    /// Decodes `bytes` into the concrete payload type this codec knows
    /// about, boxed so the registry can hold codecs for many different
    /// payload types behind one interface.
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>, Error>;

    /// Encodes a previously-decoded (or freshly constructed) payload back
    /// into wire bytes.
    fn encode(&self, payload: &(dyn Any + Send)) -> Result<Vec<u8>, Error>;
}

/// Dispatch table from `message_type` to the codec that knows how to
/// (de)serialize that type's payload.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<u16, Box<dyn PayloadCodec>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("registered_types", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `codec` for `message_type`, replacing any previous
    /// registration.
    pub fn register(&mut self, message_type: u16, codec: impl PayloadCodec + 'static) {
        self.codecs.insert(message_type, Box::new(codec));
    }

    /// Decodes `bytes` as a `message_type` payload via the registered
    /// codec, or [`Error::ProtocolViolation`] if none is registered.
    pub fn decode(&self, message_type: u16, bytes: &[u8]) -> Result<Box<dyn Any + Send>, Error> {
        self.codecs
            .get(&message_type)
            .ok_or(Error::ProtocolViolation("no codec registered for message_type"))?
            .decode(bytes)
    }

    /// Encodes `payload` as a `message_type` payload via the registered
    /// codec, or [`Error::ProtocolViolation`] if none is registered.
    pub fn encode(&self, message_type: u16, payload: &(dyn Any + Send)) -> Result<Vec<u8>, Error> {
        self.codecs
            .get(&message_type)
            .ok_or(Error::ProtocolViolation("no codec registered for message_type"))?
            .encode(payload)
    }
}
