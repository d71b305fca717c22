#![doc = include_str!("../README.md")]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::todo,
    clippy::unimplemented,
    clippy::use_self,
    missing_debug_implementations,
    unreachable_pub
)]

//! The cluster-RPC transport core: framing, authentication, routing, and
//! tree fan-out between a controller, node agents, and client tools.
//!
//! See `SPEC_FULL.md` for the full component breakdown; each `src/`
//! module below corresponds to one spec §4 component.

pub mod auth;
pub mod codec;
pub mod config;
pub mod conn;
pub mod controller;
mod endpoint;
mod error;
mod forward;
pub mod frame;
mod header;
mod message;

pub use endpoint::{ClusterRecord, ControllerSet, Endpoint, EndpointResolver};
pub use error::{
    ControllerError, Error, COMMUNICATIONS_CONNECTION_ERROR, COMMUNICATIONS_RECEIVE_ERROR, COMMUNICATIONS_SEND_ERROR,
    COMMUNICATIONS_SHUTDOWN_ERROR, CONTROLLER_CONNECTION_ERROR, PROTOCOL_AUTHENTICATION_ERROR,
    PROTOCOL_INCOMPLETE_PACKET, PROTOCOL_VERSION_ERROR,
};
pub use forward::{partition, span, Forward};
pub use header::{Header, GLOBAL_AUTH_KEY, KEEP_BUFFER, SUPPORTED_VERSIONS};
pub use message::{Message, ReturnEntry, FORWARD_FAILED};

pub mod engine;
pub mod tree;
