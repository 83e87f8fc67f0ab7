//! One websocket connection to the gateway.
//!
//! The socket is split: a writer task owns the sink and drains a queue fed by
//! any number of [`FrameSender`] clones, while [`TransportSession`] reads
//! inbound frames. Queueing through one task serializes concurrent acks, and
//! a close request is ordered behind acks that were already queued.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::retry::with_timeout;
use crate::stream::proto::AckMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors produced by the socket layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("websocket handshake timed out")]
    HandshakeTimeout,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The session was closed; the frame was not written.
    #[error("transport is closed")]
    Closed,
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Message),
    Close,
}

/// Cloneable, thread-safe handle for writing frames to the active socket.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<watch::Sender<bool>>,
}

impl FrameSender {
    /// Creates a sender whose frames land in the returned queue instead of a
    /// socket.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        (
            Self {
                tx,
                closed: Arc::new(closed),
            },
            rx,
        )
    }

    /// Queues one text frame.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Outbound::Frame(Message::Text(text.into())))
            .map_err(|_| TransportError::Closed)
    }

    /// Serializes and queues an acknowledgment.
    pub fn send_ack(&self, ack: &AckMessage) -> Result<(), TransportError> {
        self.send_text(ack.to_text()?)
    }

    /// Requests a close. Only the first call has an effect.
    pub fn close(&self) {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if first {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }

    fn pong(&self, frame: Message) {
        let _ = self.tx.send(Outbound::Frame(frame));
    }

    fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Builds the socket URI: the negotiated endpoint plus a form-encoded ticket.
pub fn socket_uri(endpoint: &str, ticket: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(endpoint.trim()).map_err(|err| TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    url.query_pairs_mut().append_pair("ticket", ticket);
    Ok(url)
}

/// A live websocket session.
pub struct TransportSession {
    inbound: SplitStream<WsStream>,
    sender: FrameSender,
    closed: watch::Receiver<bool>,
    writer: JoinHandle<()>,
}

impl TransportSession {
    /// Opens the socket, authenticating with the ticket in the query string.
    pub async fn connect(
        endpoint: &str,
        ticket: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let uri = socket_uri(endpoint, ticket)?;
        let (socket, _) = with_timeout(handshake_timeout, connect_async(uri.as_str()))
            .await
            .map_err(|_| TransportError::HandshakeTimeout)??;
        info!(event = "socket_connected", endpoint);
        Ok(Self::from_socket(socket))
    }

    fn from_socket(socket: WsStream) -> Self {
        let (sink, inbound) = socket.split();
        let (sender, outbound_rx) = FrameSender::channel();
        let closed = sender.subscribe_closed();
        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        Self {
            inbound,
            sender,
            closed,
            writer,
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Receives the next inbound text frame.
    ///
    /// Returns `None` once the remote closes the socket or [`Self::close`]
    /// was called, and `Some(Err(_))` on an abrupt transport fault.
    pub async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.closed.wait_for(|closed| *closed) => return None,
                next = self.inbound.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_string())),
                Some(Ok(Message::Ping(payload))) => self.sender.pong(Message::Pong(payload)),
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    info!(event = "socket_closed_by_remote", frame = ?frame);
                    return None;
                }
                Some(Ok(other)) => {
                    debug!(event = "non_text_frame_ignored", len = other.len());
                }
                Some(Err(err)) => return Some(Err(TransportError::WebSocket(err))),
                None => return None,
            }
        }
    }

    /// Closes the session. Safe to call repeatedly.
    pub fn close(&self) {
        self.sender.close();
    }

    /// Closes the session and waits for queued frames to be flushed.
    pub async fn shutdown(mut self, flush_timeout: Duration) {
        self.close();
        if with_timeout(flush_timeout, &mut self.writer).await.is_err() {
            warn!(event = "socket_flush_timed_out");
            self.writer.abort();
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.sender.close();
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = outbound_rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if let Err(err) = sink.send(frame).await {
                    warn!(event = "socket_write_failed", error = %err);
                    break;
                }
            }
            Outbound::Close => {
                if let Err(err) = sink.close().await {
                    debug!(event = "socket_close_failed", error = %err);
                }
                break;
            }
        }
    }
    outbound_rx.close();
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message;

    use super::{socket_uri, FrameSender, Outbound, TransportError};
    use crate::stream::proto::AckMessage;

    #[test]
    fn socket_uri_form_encodes_ticket() {
        let url = socket_uri("wss://gw.example/connect", "a b+c/=").expect("uri");
        assert_eq!(url.as_str(), "wss://gw.example/connect?ticket=a+b%2Bc%2F%3D");
    }

    #[test]
    fn socket_uri_keeps_existing_query() {
        let url = socket_uri("ws://127.0.0.1:9/ws?region=cn", "t").expect("uri");
        assert_eq!(url.as_str(), "ws://127.0.0.1:9/ws?region=cn&ticket=t");
    }

    #[test]
    fn socket_uri_rejects_non_websocket_endpoints() {
        assert!(matches!(
            socket_uri("not a url", "t"),
            Err(TransportError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            socket_uri("https://gw.example/connect", "t"),
            Err(TransportError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn close_is_idempotent_and_blocks_later_sends() {
        let (sender, mut rx) = FrameSender::channel();
        sender
            .send_ack(&AckMessage::new("m1").with_field("result", json!("ok")))
            .expect("queue ack");

        sender.close();
        sender.close();
        assert!(sender.is_closed());
        assert!(matches!(
            sender.send_text("late".to_string()),
            Err(TransportError::Closed)
        ));

        match rx.try_recv().expect("ack queued") {
            Outbound::Frame(Message::Text(text)) => {
                assert_eq!(text.as_str(), r#"{"headers":{"messageId":"m1"},"result":"ok"}"#)
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clones_share_closed_state() {
        let (sender, _rx) = FrameSender::channel();
        let clone = sender.clone();
        clone.close();
        assert!(sender.is_closed());
    }
}
