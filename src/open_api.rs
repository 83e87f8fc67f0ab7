//! Open API helpers used by handlers: access-token cache and media upload.
//!
//! These calls are not part of the streaming path. A handler that needs them
//! keeps a clone of [`OpenApiClient`]; clones share one token cache.

use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::credential::Credential;
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const ACCESS_TOKEN_PATH: &str = "/v1.0/oauth2/accessToken";
const MEDIA_UPLOAD_PATH: &str = "/media/upload";
/// Tokens are treated as expired this long before the server says so.
pub const ACCESS_TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(5 * 60);
/// Production gateway base URL (connection-open and token endpoints).
pub const GATEWAY_BASE_URL: &str = "https://api.dingtalk.com";
/// Production legacy open API base URL (media upload).
pub const OAPI_BASE_URL: &str = "https://oapi.dingtalk.com";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpenApiDefaults;

impl OpenApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(200);
    pub const JITTER: Duration = Duration::from_millis(100);
}

#[derive(Clone, Debug)]
pub struct OpenApiClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Applied to access-token fetches only. Uploads are attempted once.
    pub retry_policy: RetryPolicy,
}

impl Default for OpenApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: OpenApiDefaults::CONNECT_TIMEOUT,
            request_timeout: OpenApiDefaults::REQUEST_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: OpenApiDefaults::MAX_ATTEMPTS,
                initial_backoff: OpenApiDefaults::BACKOFF,
                max_backoff: OpenApiDefaults::BACKOFF,
                jitter: OpenApiDefaults::JITTER,
            },
        }
    }
}

#[derive(Clone, Debug)]
struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

impl CachedToken {
    fn from_response(response: AccessTokenResponse, now: Instant) -> Self {
        let lifetime =
            Duration::from_secs(response.expire_in).saturating_sub(ACCESS_TOKEN_EXPIRY_MARGIN);
        Self {
            token: SecretString::new(response.access_token),
            expires_at: now + lifetime,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Client for token-authenticated open API calls.
#[derive(Clone)]
pub struct OpenApiClient {
    http: Client,
    credential: Credential,
    gateway_url: String,
    oapi_url: String,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl OpenApiClient {
    pub fn new(credential: Credential) -> Result<Self, OpenApiError> {
        Self::with_options(credential, OpenApiClientOptions::default())
    }

    pub fn with_options(
        credential: Credential,
        options: OpenApiClientOptions,
    ) -> Result<Self, OpenApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(OpenApiError::Transport)?;
        Ok(Self::from_http(http, credential, options))
    }

    pub(crate) fn from_http(
        http: Client,
        credential: Credential,
        options: OpenApiClientOptions,
    ) -> Self {
        Self {
            http,
            credential,
            gateway_url: GATEWAY_BASE_URL.to_string(),
            oapi_url: OAPI_BASE_URL.to_string(),
            request_timeout: options.request_timeout,
            retry_policy: options.retry_policy,
            token: Arc::new(Mutex::new(None)),
        }
    }

    /// Overrides the gateway base URL used for token requests.
    pub fn with_gateway_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.gateway_url = normalize_base_url(base_url.into());
        self
    }

    /// Overrides the base URL used for media uploads.
    pub fn with_oapi_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.oapi_url = normalize_base_url(base_url.into());
        self
    }

    /// Returns a valid access token, fetching a new one when the cached token
    /// is missing or inside the expiry margin.
    pub async fn access_token(&self) -> Result<SecretString, OpenApiError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh(Instant::now())) {
            return Ok(token.token.clone());
        }

        let endpoint = format!("{}{}", self.gateway_url, ACCESS_TOKEN_PATH);
        let response = retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move { self.fetch_token_attempt(&endpoint).await }
            },
            OpenApiError::is_retryable,
        )
        .await
        .inspect_err(|err| warn!(event = "access_token_fetch_failed", error = %err))?;

        let fresh = CachedToken::from_response(response, Instant::now());
        let token = fresh.token.clone();
        *cached = Some(fresh);
        debug!(event = "access_token_refreshed");
        Ok(token)
    }

    /// Drops the cached token so the next call fetches a new one.
    pub async fn reset_access_token(&self) {
        self.token.lock().await.take();
    }

    /// Uploads a media file and returns the gateway-assigned media id.
    ///
    /// A 401 response invalidates the cached token before the error is
    /// returned, so a retry by the caller starts from a fresh token.
    pub async fn upload_media(
        &self,
        content: Vec<u8>,
        media: &MediaUpload,
    ) -> Result<String, OpenApiError> {
        let token = self.access_token().await?;

        let part = Part::bytes(content)
            .file_name(media.filename.clone())
            .mime_str(&media.mime_type)
            .map_err(OpenApiError::Transport)?;
        let form = Form::new()
            .text("type", media.media_type.clone())
            .part("media", part);

        let endpoint = format!("{}{}", self.oapi_url, MEDIA_UPLOAD_PATH);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("access_token", token.expose_secret().as_str())])
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(OpenApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(OpenApiError::Transport)?;

        if status == StatusCode::UNAUTHORIZED {
            self.reset_access_token().await;
        }
        if !status.is_success() {
            warn!(event = "media_upload_failed", status = status.as_u16());
            return Err(OpenApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_upload_response(&body)
    }

    async fn fetch_token_attempt(
        &self,
        endpoint: &str,
    ) -> Result<AccessTokenResponse, OpenApiError> {
        let request = AccessTokenRequest {
            app_key: &self.credential.client_id,
            app_secret: self.credential.client_secret.expose_secret(),
        };
        let response = self
            .http
            .post(endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(OpenApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(OpenApiError::Transport)?;

        if !status.is_success() {
            return Err(OpenApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        serde_json::from_str(&body)
            .map_err(|err| OpenApiError::Parse(format!("access token response: {err}")))
    }
}

/// Describes one multipart media upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaUpload {
    /// Media category expected by the gateway, e.g. `image`, `file`.
    pub media_type: String,
    pub filename: String,
    pub mime_type: String,
}

impl MediaUpload {
    /// A PNG image upload.
    pub fn png(filename: impl Into<String>) -> Self {
        Self {
            media_type: "image".to_string(),
            filename: filename.into(),
            mime_type: "image/png".to_string(),
        }
    }
}

impl Default for MediaUpload {
    fn default() -> Self {
        Self::png("image.png")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenRequest<'a> {
    app_key: &'a str,
    app_secret: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
    access_token: String,
    expire_in: u64,
}

#[derive(Debug, Error)]
pub enum OpenApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl OpenApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }
}

fn parse_upload_response(body: &str) -> Result<String, OpenApiError> {
    #[derive(Debug, Deserialize)]
    struct UploadResponse {
        #[serde(default)]
        media_id: Option<String>,
    }

    match serde_json::from_str::<UploadResponse>(body) {
        Ok(UploadResponse {
            media_id: Some(media_id),
        }) => Ok(media_id),
        Ok(_) => Err(OpenApiError::Parse(format!(
            "upload response missing media_id: {}",
            summarize_error_body(body)
        ))),
        Err(err) => Err(OpenApiError::Parse(format!("upload response: {err}"))),
    }
}

pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        errmsg: Option<String>,
        #[serde(default)]
        code: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.errmsg).or(parsed.code) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

pub(crate) fn normalize_base_url(url: String) -> String {
    url.trim_end().trim_end_matches('/').to_string()
}
