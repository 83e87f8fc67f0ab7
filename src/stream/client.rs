//! Stream client and reconnect supervisor.
//!
//! [`StreamClient`] owns the credential, the handler registry, and the
//! shared HTTP client. Starting it runs the supervisor loop: negotiate a
//! ticket, open the socket, fan inbound frames out to dispatch units, and
//! reconnect when the session ends. The loop only returns when the caller's
//! shutdown signal fires.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::credential::Credential;
use crate::open_api::{
    normalize_base_url, OpenApiClient, OpenApiClientOptions, GATEWAY_BASE_URL,
};
use crate::retry::{FailureClass, ReconnectPolicy};
use crate::stream::dispatch::{dispatch_frame, DispatchOutcome};
use crate::stream::handler::{Handler, HandlerRegistry};
use crate::stream::negotiate::{local_ip, open_connection, Subscription, OPEN_CONNECTION_PATH};
use crate::stream::transport::TransportSession;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
}

/// Tunables for [`StreamClient`].
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    /// Timeout of the connection-open request.
    pub negotiation_timeout: Duration,
    /// Timeout of the websocket handshake.
    pub handshake_timeout: Duration,
    /// How long a finished session may spend flushing queued acks.
    pub flush_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub open_api: OpenApiClientOptions,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            negotiation_timeout: StreamDefaults::NEGOTIATION_TIMEOUT,
            handshake_timeout: StreamDefaults::HANDSHAKE_TIMEOUT,
            flush_timeout: StreamDefaults::FLUSH_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            open_api: OpenApiClientOptions::default(),
        }
    }
}

/// Supervisor lifecycle, published through [`StreamClient::state`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SupervisorState {
    Idle,
    Negotiating,
    Connected,
    /// The session ended cleanly; reconnecting without delay.
    Closing,
    /// The session failed; a backoff follows.
    Faulted,
    Backoff,
    Stopped,
}

#[derive(Debug, Error)]
pub enum StreamClientError {
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

enum SessionEnd {
    Graceful,
    Failed(FailureClass),
}

/// Gateway stream client.
pub struct StreamClient {
    credential: Credential,
    http: reqwest::Client,
    gateway_url: String,
    registry: HandlerRegistry,
    options: StreamClientOptions,
    open_api: OpenApiClient,
    pre_started: AtomicBool,
    state: watch::Sender<SupervisorState>,
}

impl StreamClient {
    pub fn new(credential: Credential) -> Result<Self, StreamClientError> {
        Self::with_options(credential, StreamClientOptions::default())
    }

    pub fn with_options(
        credential: Credential,
        options: StreamClientOptions,
    ) -> Result<Self, StreamClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.open_api.connect_timeout)
            .build()?;
        let open_api =
            OpenApiClient::from_http(http.clone(), credential.clone(), options.open_api.clone());
        let (state, _) = watch::channel(SupervisorState::Idle);

        Ok(Self {
            credential,
            http,
            gateway_url: GATEWAY_BASE_URL.to_string(),
            registry: HandlerRegistry::new(),
            options,
            open_api,
            pre_started: AtomicBool::new(false),
            state,
        })
    }

    /// Overrides the gateway base URL for negotiation and token requests.
    pub fn with_gateway_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.gateway_url = normalize_base_url(base_url.into());
        self.open_api = self.open_api.with_gateway_endpoint(self.gateway_url.clone());
        self
    }

    /// Overrides the media upload base URL of [`Self::open_api`].
    pub fn with_oapi_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.open_api = self.open_api.with_oapi_endpoint(base_url);
        self
    }

    /// Open API client sharing this client's credential and token cache.
    ///
    /// Handlers that upload media hold a clone of it.
    pub fn open_api(&self) -> OpenApiClient {
        self.open_api.clone()
    }

    /// Registers the handler for every EVENT frame and subscribes to all
    /// event topics.
    pub fn register_all_event_handler<H: Handler + 'static>(&mut self, handler: H) -> &mut Self {
        self.registry.set_event_handler(handler);
        self
    }

    /// Registers a CALLBACK handler for `topic`. The last registration for a
    /// topic wins.
    pub fn register_callback_handler<H: Handler + 'static>(
        &mut self,
        topic: impl Into<String>,
        handler: H,
    ) -> &mut Self {
        self.registry.register_callback(topic, handler);
        self
    }

    /// Replaces the built-in SYSTEM handler.
    pub fn register_system_handler<H: Handler + 'static>(&mut self, handler: H) -> &mut Self {
        self.registry.set_system_handler(handler);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.registry.subscriptions()
    }

    /// Watches supervisor state transitions.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Runs every handler's `pre_start` hook. Only the first call does work.
    pub fn pre_start(&self) {
        if self.pre_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.pre_start_all();
    }

    /// Runs the supervisor until Ctrl-C.
    pub async fn start_forever(&self) {
        self.start_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(event = "ctrl_c_unavailable", error = %err);
                std::future::pending::<()>().await;
            }
        })
        .await;
    }

    /// Runs the supervisor until `shutdown` resolves.
    ///
    /// Negotiation failures, transport faults, and clean disconnects all lead
    /// back to a new connection attempt; only `shutdown` ends the loop.
    pub async fn start_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.pre_start();
        let registry = Arc::new(self.registry.clone());
        let subscriptions = registry.subscriptions();
        tokio::pin!(shutdown);

        loop {
            let end = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                end = self.run_session(&registry, &subscriptions) => end,
            };

            let class = match end {
                SessionEnd::Graceful => {
                    self.set_state(SupervisorState::Closing);
                    FailureClass::Graceful
                }
                SessionEnd::Failed(class) => {
                    self.set_state(SupervisorState::Faulted);
                    class
                }
            };

            let delay = self.options.reconnect.delay_for(class);
            if delay.is_zero() {
                continue;
            }
            self.set_state(SupervisorState::Backoff);
            info!(
                event = "reconnect_backoff",
                reason = ?class,
                delay_ms = delay.as_millis() as u64
            );
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SupervisorState::Stopped);
        info!(event = "stream_client_stopped");
    }

    async fn run_session(
        &self,
        registry: &Arc<HandlerRegistry>,
        subscriptions: &[Subscription],
    ) -> SessionEnd {
        self.set_state(SupervisorState::Negotiating);
        let url = format!("{}{}", self.gateway_url, OPEN_CONNECTION_PATH);
        let local_ip = local_ip().await;
        let ticket = match open_connection(
            &self.http,
            &url,
            &self.credential,
            subscriptions,
            &local_ip,
            self.options.negotiation_timeout,
        )
        .await
        {
            Ok(ticket) => ticket,
            Err(err) => {
                error!(event = "open_connection_failed", error = %err);
                return SessionEnd::Failed(FailureClass::Negotiation);
            }
        };
        info!(event = "connection_negotiated", endpoint = %ticket.endpoint);

        let mut transport = match TransportSession::connect(
            &ticket.endpoint,
            &ticket.ticket,
            self.options.handshake_timeout,
        )
        .await
        {
            Ok(transport) => transport,
            Err(err) => {
                error!(event = "socket_connect_failed", error = %err);
                return SessionEnd::Failed(FailureClass::Unexpected);
            }
        };
        self.set_state(SupervisorState::Connected);

        let end = receive_loop(&mut transport, registry).await;
        transport.shutdown(self.options.flush_timeout).await;
        end
    }

    fn set_state(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(event = "supervisor_state", from = ?previous, to = ?next);
        }
    }
}

/// Reads frames until the session ends, spawning one dispatch unit per frame.
///
/// Units still running when the session ends are detached, not cancelled;
/// their late acks fail against the closed sender and are logged.
async fn receive_loop(
    transport: &mut TransportSession,
    registry: &Arc<HandlerRegistry>,
) -> SessionEnd {
    let sender = transport.sender();
    let mut units = JoinSet::new();

    let end = loop {
        tokio::select! {
            frame = transport.next_frame() => match frame {
                Some(Ok(text)) => {
                    let registry = Arc::clone(registry);
                    let sender = sender.clone();
                    units.spawn(async move { dispatch_frame(&registry, &sender, &text).await });
                }
                Some(Err(err)) => {
                    warn!(event = "socket_fault", error = %err);
                    break SessionEnd::Failed(FailureClass::Transport);
                }
                None => break SessionEnd::Graceful,
            },
            Some(joined) = units.join_next() => match joined {
                Ok(DispatchOutcome::Disconnect) => transport.close(),
                Ok(DispatchOutcome::Continue) => {}
                Err(err) => warn!(event = "dispatch_unit_aborted", error = %err),
            },
        }
    };

    units.detach_all();
    end
}
