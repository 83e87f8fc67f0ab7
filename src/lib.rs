//! Rust SDK for streaming gateway connections.
//!
//! The crate is organized by concern:
//! - `stream`: negotiation, websocket transport, routing, and the reconnect
//!   supervisor.
//! - `open_api`: access-token cache and media upload used by handlers.
//! - `credential`: application credentials.
//! - `retry`: shared retry, backoff, and timeout utilities.
//!
//! ```no_run
//! use stream_gateway_sdk::credential::Credential;
//! use stream_gateway_sdk::stream::client::StreamClient;
//! use stream_gateway_sdk::stream::handler::{handler_fn, HandlerResult};
//! use stream_gateway_sdk::stream::proto::{AckMessage, Envelope};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = StreamClient::new(Credential::new("client-id", "client-secret"))?;
//! client.register_callback_handler(
//!     "chat",
//!     handler_fn(|envelope: Envelope| async move {
//!         let message_id = envelope.message_id().to_string();
//!         HandlerResult::Ok(Some(AckMessage::ok(message_id, envelope.data)))
//!     }),
//! );
//! client.start_forever().await;
//! # Ok(())
//! # }
//! ```

/// Application credentials.
pub mod credential;
/// Access-token cache and media upload helpers.
pub mod open_api;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Stream negotiation, transport, routing, and supervision.
pub mod stream;
