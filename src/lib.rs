//! Resilient Rust client for Constellation, a WebSocket RPC and live-event
//! subscription service.
//!
//! The crate is organized by layer:
//! - `client`: thin facade exposing open/close/subscribe/execute.
//! - `socket`: connection state machine, call correlation, keep-alive
//!   watchdog, compression transforms, and the transport seam.
//! - `backoff`: reconnect delay policies.
//! - `errors`: the protocol error taxonomy and client error types.

/// Reconnect delay policies.
pub mod backoff;
/// High-level client facade.
pub mod client;
/// Error taxonomy and client error types.
pub mod errors;
/// Low-level socket: lifecycle, correlation, transforms, transport.
pub mod socket;

mod subscription;

pub use client::Client;
pub use errors::{ClientError, ServerError};
pub use socket::{Alert, LiveEvents, Socket, SocketDefaults, SocketOptions, State};
