//! Handler capability and the topic registry.
//!
//! Every handler role (system, event, callback) implements the same
//! [`Handler`] trait; the role is decided only by how it is registered.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::stream::negotiate::Subscription;
use crate::stream::proto::{AckMessage, Envelope, SYSTEM_TOPIC_DISCONNECT, SYSTEM_TOPIC_PING};

/// Error type handlers report. Logged by the dispatcher, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of processing one envelope: an optional acknowledgment.
pub type HandlerResult = Result<Option<AckMessage>, HandlerError>;

/// Processes one envelope and optionally produces an acknowledgment.
///
/// Handlers run concurrently, one task per inbound frame, so long-running
/// work (HTTP uploads and the like) only delays that frame's own ack.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process(&self, envelope: Envelope) -> HandlerResult;

    /// Called once before the first connection attempt.
    fn pre_start(&self) {}
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` so it can be registered as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn process(&self, envelope: Envelope) -> HandlerResult {
        (self.f)(envelope).await
    }
}

/// Default system handler.
///
/// Answers `ping` by echoing its payload and acknowledges `disconnect`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHandler;

#[async_trait]
impl Handler for SystemHandler {
    async fn process(&self, envelope: Envelope) -> HandlerResult {
        let Envelope { headers, data, .. } = envelope;
        let ack = match headers.topic.as_str() {
            SYSTEM_TOPIC_PING => AckMessage::ok(headers.message_id, data),
            SYSTEM_TOPIC_DISCONNECT => AckMessage::ok(headers.message_id, Value::Null),
            _ => return Ok(None),
        };
        Ok(Some(ack))
    }
}

/// Event handler used when none was registered. Never acknowledges.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventHandler;

#[async_trait]
impl Handler for NoopEventHandler {
    async fn process(&self, _envelope: Envelope) -> HandlerResult {
        Ok(None)
    }
}

/// Handlers known to a client, keyed by role and topic.
///
/// Filled before the client starts; the supervisor works from a frozen
/// snapshot, so registrations never change under a live session.
#[derive(Clone)]
pub struct HandlerRegistry {
    system: Arc<dyn Handler>,
    event: Option<Arc<dyn Handler>>,
    callbacks: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            system: Arc::new(SystemHandler),
            event: None,
            callbacks: HashMap::new(),
        }
    }

    /// Replaces the built-in [`SystemHandler`].
    pub fn set_system_handler<H: Handler + 'static>(&mut self, handler: H) {
        self.system = Arc::new(handler);
    }

    /// Registers the handler for every EVENT frame.
    pub fn set_event_handler<H: Handler + 'static>(&mut self, handler: H) {
        self.event = Some(Arc::new(handler));
    }

    /// Registers a callback handler. A later registration for the same topic
    /// replaces the earlier one.
    pub fn register_callback<H: Handler + 'static>(&mut self, topic: impl Into<String>, handler: H) {
        let topic = topic.into();
        if self
            .callbacks
            .insert(topic.clone(), Arc::new(handler))
            .is_some()
        {
            debug!(event = "callback_handler_replaced", topic = %topic);
        }
    }

    pub fn system(&self) -> &Arc<dyn Handler> {
        &self.system
    }

    pub fn event(&self) -> Option<&Arc<dyn Handler>> {
        self.event.as_ref()
    }

    pub fn callback(&self, topic: &str) -> Option<&Arc<dyn Handler>> {
        self.callbacks.get(topic)
    }

    pub fn callback_topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.callbacks.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    /// Subscriptions to request during negotiation.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions = Vec::with_capacity(self.callbacks.len() + 1);
        if self.event.is_some() {
            subscriptions.push(Subscription::all_events());
        }
        subscriptions.extend(self.callback_topics().into_iter().map(Subscription::callback));
        subscriptions
    }

    pub(crate) fn pre_start_all(&self) {
        self.system.pre_start();
        if let Some(event) = &self.event {
            event.pre_start();
        }
        for handler in self.callbacks.values() {
            handler.pre_start();
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event", &self.event.is_some())
            .field("callbacks", &self.callback_topics())
            .finish()
    }
}
