//! Per-frame routing: decode, pick a handler, run it, write back its ack.
//!
//! A dispatch unit never fails. Decode errors, handler errors, handler
//! panics, and unroutable frames are logged and end the unit quietly; the
//! only signal that leaves it is [`DispatchOutcome::Disconnect`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::stream::handler::{Handler, HandlerRegistry, NoopEventHandler};
use crate::stream::proto::{
    AckMessage, Envelope, MessageKind, SYSTEM_TOPIC_DISCONNECT, SYSTEM_TOPIC_PING,
};
use crate::stream::transport::FrameSender;

const FRAME_LOG_SNIPPET_LEN: usize = 256;

/// What the receive loop should do after a dispatch unit finishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    Continue,
    /// The gateway announced a disconnect; close the transport.
    Disconnect,
}

/// Result of routing one envelope.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Routed {
    /// Ack to write back, already addressed to the frame's message id.
    pub ack: Option<AckMessage>,
    pub disconnect: bool,
}

/// Runs one inbound frame through decode, routing, and ack write-back.
pub async fn dispatch_frame(
    registry: &HandlerRegistry,
    sender: &FrameSender,
    frame: &str,
) -> DispatchOutcome {
    let envelope = match Envelope::from_text(frame) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                event = "frame_decode_failed",
                error = %err,
                frame = %snippet(frame)
            );
            return DispatchOutcome::Continue;
        }
    };

    let routed = route(registry, envelope).await;
    if let Some(ack) = &routed.ack {
        if let Err(err) = sender.send_ack(ack) {
            warn!(
                event = "ack_send_failed",
                message_id = %ack.message_id(),
                error = %err
            );
        }
    }

    if routed.disconnect {
        DispatchOutcome::Disconnect
    } else {
        DispatchOutcome::Continue
    }
}

/// Picks the handler for `envelope`, invokes it, and addresses its ack.
pub async fn route(registry: &HandlerRegistry, envelope: Envelope) -> Routed {
    let message_id = envelope.message_id().to_string();
    let topic = envelope.topic().to_string();
    let kind = envelope.kind.clone();

    let (ack, disconnect) = match kind {
        MessageKind::System => match topic.as_str() {
            SYSTEM_TOPIC_DISCONNECT => {
                info!(event = "disconnect_requested", message_id = %message_id);
                (invoke(registry.system(), envelope).await, true)
            }
            SYSTEM_TOPIC_PING => (invoke(registry.system(), envelope).await, false),
            _ => {
                warn!(
                    event = "unknown_system_topic",
                    topic = %topic,
                    message_id = %message_id
                );
                (None, false)
            }
        },
        MessageKind::Event => match registry.event() {
            Some(handler) => (invoke(handler, envelope).await, false),
            None => (NoopEventHandler.process(envelope).await.ok().flatten(), false),
        },
        MessageKind::Callback => match registry.callback(&topic) {
            Some(handler) => (invoke(handler, envelope).await, false),
            None => {
                warn!(
                    event = "unknown_callback_topic",
                    topic = %topic,
                    message_id = %message_id
                );
                (None, false)
            }
        },
        MessageKind::Unrecognized(kind) => {
            warn!(
                event = "unknown_message_type",
                kind = %kind,
                topic = %topic,
                message_id = %message_id
            );
            (None, false)
        }
    };

    Routed {
        ack: ack.map(|mut ack| {
            ack.headers.message_id = message_id;
            ack
        }),
        disconnect,
    }
}

async fn invoke(handler: &Arc<dyn Handler>, envelope: Envelope) -> Option<AckMessage> {
    let kind = envelope.kind.clone();
    let message_id = envelope.message_id().to_string();

    match AssertUnwindSafe(handler.process(envelope))
        .catch_unwind()
        .await
    {
        Ok(Ok(ack)) => {
            debug!(
                event = "handler_completed",
                kind = kind.as_str(),
                message_id = %message_id,
                acked = ack.is_some()
            );
            ack
        }
        Ok(Err(err)) => {
            warn!(
                event = "handler_failed",
                kind = kind.as_str(),
                message_id = %message_id,
                error = %err
            );
            None
        }
        Err(panic) => {
            error!(
                event = "handler_panicked",
                kind = kind.as_str(),
                message_id = %message_id,
                panic = %panic_message(panic.as_ref())
            );
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn snippet(frame: &str) -> String {
    frame.chars().take(FRAME_LOG_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::task::JoinSet;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::stream::handler::{handler_fn, HandlerError, HandlerResult};
    use crate::stream::transport::Outbound;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            match outbound {
                Outbound::Frame(Message::Text(text)) => {
                    frames.push(serde_json::from_str(text.as_str()).expect("ack is json"))
                }
                other => panic!("unexpected outbound: {other:?}"),
            }
        }
        frames
    }

    fn chat_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_callback(
            "chat",
            handler_fn(|envelope: Envelope| async move {
                HandlerResult::Ok(Some(
                    AckMessage::new(envelope.message_id()).with_field("result", json!("ok")),
                ))
            }),
        );
        registry
    }

    #[tokio::test]
    async fn callback_ack_is_written_verbatim() {
        let registry = chat_registry();
        let (sender, mut rx) = FrameSender::channel();

        let outcome = dispatch_frame(
            &registry,
            &sender,
            r#"{"type":"CALLBACK","headers":{"topic":"chat","messageId":"m1"},"data":{"text":"hi"}}"#,
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::Continue);
        assert_eq!(
            drain(&mut rx),
            vec![json!({"headers": {"messageId": "m1"}, "result": "ok"})]
        );
    }

    #[tokio::test]
    async fn event_without_handler_writes_nothing() {
        let registry = HandlerRegistry::new();
        let (sender, mut rx) = FrameSender::channel();

        let outcome = dispatch_frame(
            &registry,
            &sender,
            r#"{"type":"EVENT","headers":{"topic":"org_change","messageId":"e1"},"data":{}}"#,
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::Continue);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn registered_event_handler_receives_every_event() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.set_event_handler(handler_fn({
            let seen = Arc::clone(&seen);
            move |envelope: Envelope| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    HandlerResult::Ok(Some(AckMessage::ok(envelope.message_id(), Value::Null)))
                }
            }
        }));
        let (sender, mut rx) = FrameSender::channel();

        for topic in ["a", "b"] {
            let frame = json!({"type": "EVENT", "headers": {"topic": topic, "messageId": topic}});
            dispatch_frame(&registry, &sender, &frame.to_string()).await;
        }

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn unknown_callback_topic_is_dropped() {
        let registry = chat_registry();
        let (sender, mut rx) = FrameSender::channel();

        let outcome = dispatch_frame(
            &registry,
            &sender,
            r#"{"type":"CALLBACK","headers":{"topic":"nobody","messageId":"m2"},"data":{}}"#,
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::Continue);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_and_malformed_frames_are_dropped() {
        let registry = chat_registry();
        let (sender, mut rx) = FrameSender::channel();

        for frame in [
            r#"{"type":"NOTICE","headers":{"topic":"chat","messageId":"m3"}}"#,
            r#"{"type":"CALLBACK","headers":"#,
            "",
        ] {
            assert_eq!(
                dispatch_frame(&registry, &sender, frame).await,
                DispatchOutcome::Continue
            );
        }
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_contained() {
        let mut registry = chat_registry();
        registry.register_callback(
            "broken",
            handler_fn(|_envelope: Envelope| async move {
                HandlerResult::Err(HandlerError::from("upstream unavailable"))
            }),
        );
        registry.register_callback(
            "panics",
            handler_fn(|_envelope: Envelope| async move {
                if true {
                    panic!("handler bug");
                }
                HandlerResult::Ok(None)
            }),
        );
        let (sender, mut rx) = FrameSender::channel();

        for topic in ["broken", "panics", "chat"] {
            let frame = json!({"type": "CALLBACK", "headers": {"topic": topic, "messageId": topic}});
            assert_eq!(
                dispatch_frame(&registry, &sender, &frame.to_string()).await,
                DispatchOutcome::Continue
            );
        }

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["headers"]["messageId"], json!("chat"));
    }

    #[tokio::test]
    async fn disconnect_acks_before_reporting() {
        let registry = HandlerRegistry::new();
        let (sender, mut rx) = FrameSender::channel();

        let outcome = dispatch_frame(
            &registry,
            &sender,
            r#"{"type":"SYSTEM","headers":{"topic":"disconnect","messageId":"d1"},"data":{"reason":"upgrade"}}"#,
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::Disconnect);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["headers"]["messageId"], json!("d1"));
        assert_eq!(frames[0]["code"], json!(200));
    }

    #[tokio::test]
    async fn disconnect_survives_a_failing_system_handler() {
        let mut registry = HandlerRegistry::new();
        registry.set_system_handler(handler_fn(|_envelope: Envelope| async move {
            HandlerResult::Err(HandlerError::from("nope"))
        }));
        let (sender, mut rx) = FrameSender::channel();

        let outcome = dispatch_frame(
            &registry,
            &sender,
            r#"{"type":"SYSTEM","headers":{"topic":"disconnect","messageId":"d2"}}"#,
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::Disconnect);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn ping_is_echoed_and_unknown_system_topics_skip_the_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.set_system_handler(handler_fn({
            let calls = Arc::clone(&calls);
            move |envelope: Envelope| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let Envelope { headers, data, .. } = envelope;
                    HandlerResult::Ok(Some(AckMessage::ok(headers.message_id, data)))
                }
            }
        }));
        let (sender, mut rx) = FrameSender::channel();

        dispatch_frame(
            &registry,
            &sender,
            r#"{"type":"SYSTEM","headers":{"topic":"ping","messageId":"p1"},"data":{"opaque":"x"}}"#,
        )
        .await;
        dispatch_frame(
            &registry,
            &sender,
            r#"{"type":"SYSTEM","headers":{"topic":"KEEPALIVE","messageId":"k1"}}"#,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"], json!({"opaque": "x"}));
    }

    #[tokio::test]
    async fn ack_is_readdressed_to_the_triggering_frame() {
        let mut registry = HandlerRegistry::new();
        registry.register_callback(
            "chat",
            handler_fn(|_envelope: Envelope| async move {
                HandlerResult::Ok(Some(AckMessage::new("wrong-id")))
            }),
        );

        let envelope = Envelope::from_text(
            r#"{"type":"CALLBACK","headers":{"topic":"chat","messageId":"right-id"}}"#,
        )
        .expect("decode");
        let routed = route(&registry, envelope).await;

        assert!(!routed.disconnect);
        assert_eq!(
            routed.ack.expect("acked").message_id(),
            "right-id"
        );
    }

    #[tokio::test]
    async fn concurrent_units_ack_each_frame_exactly_once() {
        let mut registry = HandlerRegistry::new();
        registry.register_callback(
            "slow",
            handler_fn(|envelope: Envelope| async move {
                let delay = envelope.data["delay_ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                HandlerResult::Ok(Some(AckMessage::ok(envelope.message_id(), Value::Null)))
            }),
        );
        let registry = Arc::new(registry);
        let (sender, mut rx) = FrameSender::channel();

        let mut units = JoinSet::new();
        for index in 0..20u64 {
            let frame = json!({
                "type": "CALLBACK",
                "headers": {"topic": "slow", "messageId": format!("m{index}")},
                "data": {"delay_ms": (20 - index) % 7}
            })
            .to_string();
            let registry = Arc::clone(&registry);
            let sender = sender.clone();
            units.spawn(async move { dispatch_frame(&registry, &sender, &frame).await });
        }
        while let Some(outcome) = units.join_next().await {
            assert_eq!(outcome.expect("unit joined"), DispatchOutcome::Continue);
        }

        let mut ids: Vec<String> = drain(&mut rx)
            .into_iter()
            .map(|ack| ack["headers"]["messageId"].as_str().expect("id").to_string())
            .collect();
        ids.sort();
        let mut expected: Vec<String> = (0..20).map(|index| format!("m{index}")).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }
}
