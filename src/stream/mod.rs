//! Stream gateway modules.
//!
//! - `client`: reconnect supervisor and handler registration surface.
//! - `negotiate`: connection-open request yielding an endpoint and ticket.
//! - `transport`: websocket session with a serialized writer.
//! - `proto`: inbound envelopes and outbound acknowledgments.
//! - `dispatch`: per-frame routing and fault isolation.
//! - `handler`: handler capability, built-in handlers, and the registry.

/// Stream client and reconnect supervisor.
pub mod client;
/// Per-frame routing into handlers.
pub mod dispatch;
/// Handler trait and topic registry.
pub mod handler;
/// Connection negotiation.
pub mod negotiate;
/// Stream frame types.
pub mod proto;
/// Websocket transport session.
pub mod transport;
