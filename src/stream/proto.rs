//! Frame types exchanged with the stream gateway.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// System topic used by the gateway for keepalive probes.
pub const SYSTEM_TOPIC_PING: &str = "ping";
/// System topic announcing that the gateway is about to drop the connection.
pub const SYSTEM_TOPIC_DISCONNECT: &str = "disconnect";

/// Envelope kind carried in the `type` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    System,
    Event,
    Callback,
    /// Any discriminator this client does not know. Routed, logged, dropped.
    Unrecognized(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "SYSTEM",
            Self::Event => "EVENT",
            Self::Callback => "CALLBACK",
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Unrecognized(String::new())
    }
}

impl From<String> for MessageKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "SYSTEM" => Self::System,
            "EVENT" => Self::Event,
            "CALLBACK" => Self::Callback,
            _ => Self::Unrecognized(raw),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Unrecognized(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// Common headers present on every inbound frame.
///
/// Header fields this client does not model are kept in `extra` so they
/// survive a decode/encode cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeaders {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub headers: MessageHeaders,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<String>,
}

impl Envelope {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn topic(&self) -> &str {
        &self.headers.topic
    }

    pub fn message_id(&self) -> &str {
        &self.headers.message_id
    }

    /// Decodes the payload into `T`.
    ///
    /// The gateway delivers `data` either as a JSON object or as a string that
    /// itself contains JSON; both forms are accepted.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            Value::String(raw) => serde_json::from_str(raw),
            other => T::deserialize(other),
        }
    }
}

/// Headers of an outbound acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckHeaders {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Acknowledgment written back for a single inbound frame.
///
/// Besides `headers`, an ack carries an open set of body fields. The helpers
/// build the conventional `{code, message, data}` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub headers: AckHeaders,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl AckMessage {
    pub const STATUS_OK: u16 = 200;
    pub const STATUS_BAD_REQUEST: u16 = 400;
    pub const STATUS_NOT_IMPLEMENT: u16 = 404;
    pub const STATUS_SYSTEM_EXCEPTION: u16 = 500;

    /// Creates an ack with headers only.
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            headers: AckHeaders {
                message_id: message_id.into(),
                content_type: None,
                extra: Map::new(),
            },
            body: Map::new(),
        }
    }

    /// Creates a `{code, message, data}` ack with a JSON content type.
    pub fn reply(
        message_id: impl Into<String>,
        code: u16,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        let mut ack = Self::new(message_id)
            .with_field("code", Value::from(code))
            .with_field("message", Value::String(message.into()))
            .with_field("data", data);
        ack.headers.content_type = Some("application/json".to_string());
        ack
    }

    /// Shorthand for a `200 OK` reply.
    pub fn ok(message_id: impl Into<String>, data: Value) -> Self {
        Self::reply(message_id, Self::STATUS_OK, "OK", data)
    }

    /// Sets a body field, replacing any previous value.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn message_id(&self) -> &str {
        &self.headers.message_id
    }

    pub fn code(&self) -> Option<u64> {
        self.body.get("code").and_then(Value::as_u64)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
