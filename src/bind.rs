//! Bind handshake client.
//!
//! After the push server announces a `client_id`, the client posts that id
//! together with the configured secret to the bind endpoint. The server only
//! treats the websocket as authorized once the bind is accepted.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// `status` value signalling an accepted bind.
pub const BIND_ACCEPTED: i64 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BindDefaults;

impl BindDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
}

#[derive(Clone, Debug)]
pub struct BindClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for BindClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: BindDefaults::CONNECT_TIMEOUT,
            request_timeout: BindDefaults::REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct BindClient {
    http: Client,
    bind_url: String,
    secret_id: SecretString,
    request_timeout: Duration,
}

impl std::fmt::Debug for BindClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindClient")
            .field("bind_url", &self.bind_url)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl BindClient {
    pub fn new(bind_url: impl Into<String>, secret_id: SecretString) -> Result<Self, BindError> {
        Self::with_options(bind_url, secret_id, BindClientOptions::default())
    }

    pub fn with_options(
        bind_url: impl Into<String>,
        secret_id: SecretString,
        options: BindClientOptions,
    ) -> Result<Self, BindError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(BindError::Transport)?;

        Ok(Self {
            http,
            bind_url: bind_url.into(),
            secret_id,
            request_timeout: options.request_timeout,
        })
    }

    pub fn bind_url(&self) -> &str {
        &self.bind_url
    }

    /// Posts `client_id` and the configured secret as a form body.
    ///
    /// A rejected bind is still `Ok`; inspect [`BindResponse::accepted`].
    pub async fn bind(&self, client_id: &str) -> Result<BindResponse, BindError> {
        let form = [
            ("client_id", client_id),
            ("secret_id", self.secret_id.expose_secret().as_str()),
        ];

        let response = self
            .http
            .post(&self.bind_url)
            .timeout(self.request_timeout)
            .form(&form)
            .send()
            .await
            .map_err(BindError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(BindError::Transport)?;

        if !status.is_success() {
            return Err(BindError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_bind_response(&body)
    }
}

/// Parsed bind endpoint reply.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BindResponse {
    /// Human-readable outcome, always shown to the operator.
    pub message: String,
    /// `1` when accepted, anything else when rejected.
    pub status: i64,
}

impl BindResponse {
    pub fn accepted(&self) -> bool {
        self.status == BIND_ACCEPTED
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

fn parse_bind_response(body: &str) -> Result<BindResponse, BindError> {
    #[derive(Debug, Deserialize)]
    struct LooseBindResponse {
        #[serde(default)]
        message: Option<serde_json::Value>,
        status: serde_json::Value,
    }

    let loose: LooseBindResponse =
        serde_json::from_str(body).map_err(|err| BindError::Parse(err.to_string()))?;

    // Some deployments send the status as a numeric string.
    let status = match &loose.status {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| BindError::Parse(format!("status is not an integer: {}", loose.status)))?;

    let message = match loose.message {
        Some(serde_json::Value::String(text)) => text,
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    Ok(BindResponse { message, status })
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
