use async_trait::async_trait;
use parley_config::{BackendProfile, Config};
use parley_core::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::openai::OpenAiTransport;
use crate::sydney::{SydneySettings, SydneyTransport};
use crate::StreamResult;

/// The two transport families. Numbered on the wire as the `type` field of
/// an ask: 0 for Sydney, 1 for OpenAI-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BackendKind {
    Sydney,
    OpenAiCompatible,
}

impl TryFrom<u8> for BackendKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BackendKind::Sydney),
            1 => Ok(BackendKind::OpenAiCompatible),
            other => Err(format!("unknown backend type {other}")),
        }
    }
}

impl From<BackendKind> for u8 {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Sydney => 0,
            BackendKind::OpenAiCompatible => 1,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Sydney => write!(f, "sydney"),
            BackendKind::OpenAiCompatible => write!(f, "openai"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiRequest {
    pub ask_id: String,
    pub profile: BackendProfile,
    /// Model already chosen by the tier selector.
    pub model: String,
    pub context: String,
    pub prompt: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SydneyRequest {
    pub ask_id: String,
    pub prompt: String,
    /// Sent as the web-page context of the conversation.
    pub context: String,
    pub image_url: Option<String>,
    pub locale: String,
    pub conversation_style: String,
    pub no_search: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportRequest {
    OpenAi(OpenAiRequest),
    Sydney(SydneyRequest),
}

impl TransportRequest {
    pub fn kind(&self) -> BackendKind {
        match self {
            TransportRequest::OpenAi(_) => BackendKind::OpenAiCompatible,
            TransportRequest::Sydney(_) => BackendKind::Sydney,
        }
    }

    pub fn ask_id(&self) -> &str {
        match self {
            TransportRequest::OpenAi(r) => &r.ask_id,
            TransportRequest::Sydney(r) => &r.ask_id,
        }
    }
}

/// A backend connection for a single ask.
///
/// `send` opens the backend and returns the event stream; errors before the
/// first event (unreachable endpoint, rejected key) come back from `send`
/// itself. `cancel` stops the stream and returns once the connection is torn
/// down.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn send(&self, request: TransportRequest) -> Result<StreamResult, ProviderError>;

    async fn cancel(&self);
}

/// Builds a fresh transport per ask so cancellation never crosses asks.
pub trait TransportFactory: Send + Sync {
    fn create(&self, kind: BackendKind) -> Arc<dyn Transport>;
}

/// Production factory over a shared HTTP client.
pub struct HttpTransportFactory {
    client: reqwest::Client,
    sydney: SydneySettings,
}

impl HttpTransportFactory {
    pub fn new(config: &Config, cookies: HashMap<String, String>) -> Result<Self, ProviderError> {
        let client = crate::http::build_client(config.proxy(), None)?;
        let sydney = SydneySettings::from_config(config, cookies);
        Ok(Self { client, sydney })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self, kind: BackendKind) -> Arc<dyn Transport> {
        match kind {
            BackendKind::OpenAiCompatible => Arc::new(OpenAiTransport::new(self.client.clone())),
            BackendKind::Sydney => {
                Arc::new(SydneyTransport::new(self.client.clone(), self.sydney.clone()))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error (status {status_code}): {message}")]
    ApiErrorWithStatus { message: String, status_code: u16 },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Content filtered: {0}")]
    ContentFiltered(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProviderError {
    pub fn api_error_with_status(message: impl Into<String>, status_code: u16) -> Self {
        ProviderError::ApiErrorWithStatus {
            message: message.into(),
            status_code,
        }
    }

    /// Classifies a non-success HTTP response.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status_code {
            401 | 403 => ProviderError::AuthError(body),
            429 => ProviderError::RateLimit(body),
            400 if is_content_filter_message(&body) => ProviderError::ContentFiltered(body),
            _ => ProviderError::api_error_with_status(body, status_code),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::ApiErrorWithStatus { status_code, .. } => match status_code {
                401 | 403 => ErrorKind::AuthRejected,
                429 => ErrorKind::RateLimited,
                500..=599 => ErrorKind::NetworkFailure,
                _ => ErrorKind::BackendError,
            },
            ProviderError::NetworkError(_)
            | ProviderError::StreamError(_)
            | ProviderError::Timeout => ErrorKind::NetworkFailure,
            ProviderError::AuthError(_) => ErrorKind::AuthRejected,
            ProviderError::RateLimit(_) => ErrorKind::RateLimited,
            ProviderError::ContentFiltered(_) => ErrorKind::ContentFiltered,
            ProviderError::BackendNotFound(_) => ErrorKind::BackendNotFound,
            ProviderError::ApiError(_)
            | ProviderError::InvalidRequest(_)
            | ProviderError::ConfigError(_) => ErrorKind::BackendError,
        }
    }
}

pub(crate) fn is_content_filter_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("content_filter") || lower.contains("content_policy")
}

impl crate::retry::IsRetryable for ProviderError {
    fn is_retryable(&self) -> Option<String> {
        self.kind().is_retryable().then(|| self.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), err.to_string())
        } else {
            ProviderError::NetworkError(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProviderError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => {
                let status = response.status().as_u16();
                ProviderError::from_status(status, format!("websocket upgrade rejected ({status})"))
            }
            other => ProviderError::NetworkError(other.to_string()),
        }
    }
}
