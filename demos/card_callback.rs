use std::error::Error;

use serde::Deserialize;
use serde_json::json;
use stream_gateway_sdk::credential::Credential;
use stream_gateway_sdk::stream::client::StreamClient;
use stream_gateway_sdk::stream::handler::{handler_fn, HandlerResult};
use stream_gateway_sdk::stream::proto::{AckMessage, Envelope};
use tracing_subscriber::EnvFilter;

const CARD_CALLBACK_TOPIC: &str = "/v1.0/card/instances/callback";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardCallback {
    #[serde(default)]
    out_track_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    content: String,
}

async fn on_card_callback(envelope: Envelope) -> HandlerResult {
    let callback: CardCallback = envelope.decode_data()?;
    println!(
        "card={} user={} content={}",
        callback.out_track_id, callback.user_id, callback.content
    );

    let card_data = json!({
        "cardParamMap": {"clicked": "true", "clickedBy": callback.user_id},
    });
    Ok(Some(AckMessage::ok(
        envelope.message_id(),
        json!({"cardUpdateOptions": {"updateCardDataByKey": true}, "cardData": card_data}),
    )))
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client_id = std::env::var("STREAM_CLIENT_ID")
        .unwrap_or_else(|_| "REPLACE_WITH_CLIENT_ID".to_string());
    let client_secret = std::env::var("STREAM_CLIENT_SECRET")
        .unwrap_or_else(|_| "REPLACE_WITH_CLIENT_SECRET".to_string());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut client = StreamClient::new(Credential::new(client_id, client_secret))?;
        client.register_callback_handler(CARD_CALLBACK_TOPIC, handler_fn(on_card_callback));

        client.start_forever().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
