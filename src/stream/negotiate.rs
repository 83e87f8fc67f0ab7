//! Connection-open request that trades credentials for a socket ticket.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::credential::Credential;
use crate::open_api::summarize_error_body;
use crate::stream::proto::MessageKind;

/// Path of the connection-open endpoint on the gateway.
pub const OPEN_CONNECTION_PATH: &str = "/v1.0/gateway/connections/open";
pub const SDK_NAME: &str = env!("CARGO_PKG_NAME");
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Address probed (never contacted) to learn the outbound interface.
const LOCAL_IP_PROBE: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    80,
);

/// One `(type, topic)` pair requested from the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub topic: String,
}

impl Subscription {
    /// Subscribes to every event topic.
    pub fn all_events() -> Self {
        Self {
            kind: MessageKind::Event,
            topic: "*".to_string(),
        }
    }

    pub fn callback(topic: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Callback,
            topic: topic.into(),
        }
    }
}

/// Endpoint and short-lived ticket returned by a successful negotiation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ConnectionTicket {
    pub endpoint: String,
    pub ticket: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenConnectionRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    subscriptions: &'a [Subscription],
    ua: String,
    local_ip: &'a str,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("connection-open request failed: {0}")]
    Transport(reqwest::Error),

    #[error("connection-open http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("malformed connection-open response: {0}")]
    Parse(String),
}

/// `ua` field of the connection-open body.
pub fn sdk_ua() -> String {
    format!("{SDK_NAME}/v{SDK_VERSION}")
}

/// `User-Agent` header sent with the connection-open request.
pub fn user_agent() -> String {
    format!("GatewayStream/1.0 SDK/{SDK_VERSION} Rust")
}

/// Performs one connection-open exchange. Retrying is left to the caller.
pub async fn open_connection(
    http: &Client,
    url: &str,
    credential: &Credential,
    subscriptions: &[Subscription],
    local_ip: &str,
    timeout: Duration,
) -> Result<ConnectionTicket, NegotiationError> {
    info!(event = "open_connection", url);
    let body = OpenConnectionRequest {
        client_id: &credential.client_id,
        client_secret: credential.client_secret.expose_secret(),
        subscriptions,
        ua: sdk_ua(),
        local_ip,
    };

    let response = http
        .post(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .header(reqwest::header::USER_AGENT, user_agent())
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(NegotiationError::Transport)?;
    let status = response.status();
    let text = response.text().await.map_err(NegotiationError::Transport)?;

    if !status.is_success() {
        return Err(NegotiationError::HttpStatus {
            status,
            body: summarize_error_body(&text),
        });
    }

    parse_ticket(&text)
}

fn parse_ticket(body: &str) -> Result<ConnectionTicket, NegotiationError> {
    let ticket: ConnectionTicket =
        serde_json::from_str(body).map_err(|err| NegotiationError::Parse(err.to_string()))?;
    if ticket.endpoint.trim().is_empty() {
        return Err(NegotiationError::Parse("empty endpoint".to_string()));
    }
    Ok(ticket)
}

/// Best-effort local address on the interface that routes to the internet.
///
/// Connecting a UDP socket only selects a route; no packet is sent. Returns
/// an empty string when no route is available.
pub async fn local_ip() -> String {
    match probe_local_addr().await {
        Ok(addr) => addr.ip().to_string(),
        Err(err) => {
            debug!(event = "local_ip_unavailable", error = %err);
            String::new()
        }
    }
}

async fn probe_local_addr() -> std::io::Result<SocketAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(LOCAL_IP_PROBE).await?;
    socket.local_addr()
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use serde_json::json;

    use super::*;

    #[test]
    fn request_body_uses_gateway_field_names() {
        let credential = Credential::new("id-1", "secret-1");
        let subscriptions = vec![Subscription::all_events(), Subscription::callback("chat")];
        let body = OpenConnectionRequest {
            client_id: &credential.client_id,
            client_secret: credential.client_secret.expose_secret(),
            subscriptions: &subscriptions,
            ua: sdk_ua(),
            local_ip: "10.0.0.2",
        };

        assert_eq!(
            serde_json::to_value(&body).expect("encode"),
            json!({
                "clientId": "id-1",
                "clientSecret": "secret-1",
                "subscriptions": [
                    {"type": "EVENT", "topic": "*"},
                    {"type": "CALLBACK", "topic": "chat"}
                ],
                "ua": format!("stream-gateway-sdk/v{SDK_VERSION}"),
                "localIp": "10.0.0.2"
            })
        );
    }

    #[test]
    fn ticket_parses_and_ignores_extra_fields() {
        let ticket = parse_ticket(r#"{"endpoint":"wss://gw/connect","ticket":"t+1","ttl":90}"#)
            .expect("ticket");
        assert_eq!(ticket.endpoint, "wss://gw/connect");
        assert_eq!(ticket.ticket, "t+1");
    }

    #[test]
    fn malformed_ticket_is_a_parse_failure() {
        assert!(matches!(
            parse_ticket("<html>oops</html>"),
            Err(NegotiationError::Parse(_))
        ));
        assert!(matches!(
            parse_ticket(r#"{"ticket":"t"}"#),
            Err(NegotiationError::Parse(_))
        ));
        assert!(matches!(
            parse_ticket(r#"{"endpoint":" ","ticket":"t"}"#),
            Err(NegotiationError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn local_ip_is_an_address_or_empty() {
        let ip = local_ip().await;
        assert!(ip.is_empty() || ip.parse::<IpAddr>().is_ok(), "got {ip:?}");
    }
}
