//! Sydney: the Bing chat backend, reached over a SignalR-style websocket.

mod conversation;
mod kblob;
pub mod protocol;

pub use conversation::{create_conversation, Conversation};
pub use kblob::{KblobImageStore, RemoteImageStore, DEFAULT_KBLOB_URL};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parley_config::Config;
use rand::Rng;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use self::protocol::{InvocationIds, UpdateParser};
use crate::task::{EventSender, StreamTask, DEFAULT_CAPACITY};
use crate::{BackendKind, ProviderError, StreamResult, SydneyRequest, Transport, TransportRequest};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(6);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read deadline and keep-alive cadence of a live answer.
#[derive(Debug, Clone, Copy)]
struct PumpTimings {
    read_timeout: Duration,
    ping_interval: Duration,
}

impl Default for PumpTimings {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            ping_interval: PING_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SydneySettings {
    pub wss_domain: String,
    pub create_conversation_url: String,
    pub cookies: HashMap<String, String>,
}

impl SydneySettings {
    pub fn from_config(config: &Config, cookies: HashMap<String, String>) -> Self {
        Self {
            wss_domain: config.wss_domain.trim().to_string(),
            create_conversation_url: config.create_conversation_url.trim().to_string(),
            cookies,
        }
    }

    /// `name=value; ` pairs, values percent-encoded, sorted by name.
    pub fn cookie_header(&self) -> String {
        let mut names: Vec<&String> = self.cookies.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| format!("{}={}; ", name, urlencoding::encode(&self.cookies[name])))
            .collect()
    }

    pub fn chat_hub_url(&self, sec_access_token: Option<&str>) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&format!("wss://{}/sydney/ChatHub", self.wss_domain))
            .map_err(|e| ProviderError::ConfigError(format!("invalid wss domain: {e}")))?;
        if let Some(token) = sec_access_token {
            url.query_pairs_mut().append_pair("sec_access_token", token);
        }
        Ok(url)
    }
}

pub struct SydneyTransport {
    client: Client,
    settings: SydneySettings,
    task: StreamTask,
}

impl SydneyTransport {
    pub fn new(client: Client, settings: SydneySettings) -> Self {
        Self {
            client,
            settings,
            task: StreamTask::new(),
        }
    }

    async fn connect(&self, conversation: &Conversation) -> Result<WsStream, ProviderError> {
        let url = self
            .settings
            .chat_hub_url(conversation.sec_access_token.as_deref())?;
        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Origin", HeaderValue::from_static("https://www.bing.com"));
        headers.insert("User-Agent", HeaderValue::from_static(crate::http::USER_AGENT));
        let cookie = self.settings.cookie_header();
        if !cookie.is_empty() {
            let value = HeaderValue::from_str(&cookie)
                .map_err(|e| ProviderError::ConfigError(format!("invalid cookie value: {e}")))?;
            headers.insert("Cookie", value);
        }

        let (mut ws, _) = tokio::time::timeout(DIAL_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ProviderError::Timeout)??;

        write_frame(&mut ws, protocol::handshake()).await?;
        read_text(&mut ws).await?;
        write_frame(&mut ws, protocol::ping()).await?;
        Ok(ws)
    }

    fn invocation(request: &SydneyRequest, conversation: &Conversation) -> String {
        let mut rng = rand::thread_rng();
        let trace_id = hex::encode(rng.gen::<[u8; 16]>());
        let message_id = uuid::Uuid::new_v4().to_string();
        let message_type = if rng.gen_bool(0.5) { "Chat" } else { "SearchQuery" };
        protocol::frame(&protocol::chat_invocation(
            request,
            conversation,
            InvocationIds {
                message_id: &message_id,
                trace_id: &trace_id,
                message_type,
            },
        ))
    }

    /// Reads frames until the turn ends. Pings keep the socket alive but do
    /// not extend the read deadline; only an incoming frame does.
    async fn pump(mut ws: WsStream, tx: EventSender, timings: PumpTimings) {
        let mut parser = UpdateParser::new();
        let start = Instant::now();
        let mut ping = tokio::time::interval_at(start + timings.ping_interval, timings.ping_interval);
        let mut deadline = start + timings.read_timeout;

        loop {
            let next = tokio::select! {
                _ = ping.tick() => {
                    if let Err(err) = write_frame(&mut ws, protocol::ping()).await {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => None,
                next = ws.next() => Some(next),
            };
            if matches!(next, Some(Some(Ok(_)))) {
                deadline = Instant::now() + timings.read_timeout;
            }

            let text = match next {
                None => Err(ProviderError::Timeout),
                Some(None) | Some(Some(Ok(Message::Close(_)))) => Err(ProviderError::NetworkError(
                    "connection closed before the answer finished".to_string(),
                )),
                Some(Some(Err(err))) => Err(err.into()),
                Some(Some(Ok(Message::Text(text)))) => Ok(text),
                Some(Some(Ok(_))) => continue,
            };
            let text = match text {
                Ok(text) => text,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };

            for raw in protocol::split_frames(text.as_str()) {
                let outcome = parser.handle_frame(raw);
                for event in outcome.events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                if outcome.finished {
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }
    }
}

async fn write_frame(ws: &mut WsStream, frame: String) -> Result<(), ProviderError> {
    tokio::time::timeout(WRITE_TIMEOUT, ws.send(Message::text(frame)))
        .await
        .map_err(|_| ProviderError::Timeout)??;
    Ok(())
}

async fn read_text(ws: &mut WsStream) -> Result<String, ProviderError> {
    loop {
        match tokio::time::timeout(READ_TIMEOUT, ws.next()).await {
            Err(_) => return Err(ProviderError::Timeout),
            Ok(None) => {
                return Err(ProviderError::NetworkError(
                    "connection closed during handshake".to_string(),
                ))
            }
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(Some(Ok(Message::Text(text)))) => return Ok(text.as_str().to_string()),
            Ok(Some(Ok(_))) => continue,
        }
    }
}

#[async_trait]
impl Transport for SydneyTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Sydney
    }

    async fn send(&self, request: TransportRequest) -> Result<StreamResult, ProviderError> {
        let TransportRequest::Sydney(request) = request else {
            return Err(ProviderError::InvalidRequest(
                "Sydney transport received an OpenAI request".to_string(),
            ));
        };

        // Throttling surfaces to the caller as is; retrying is its decision.
        let conversation = create_conversation(&self.client, &self.settings).await?;
        tracing::debug!(
            ask_id = %request.ask_id,
            conversation_id = %conversation.conversation_id,
            "sydney conversation created"
        );

        let mut ws = self.connect(&conversation).await?;
        write_frame(&mut ws, Self::invocation(&request, &conversation)).await?;

        Ok(self
            .task
            .spawn(DEFAULT_CAPACITY, move |tx| Self::pump(ws, tx, PumpTimings::default())))
    }

    async fn cancel(&self) {
        self.task.cancel().await;
    }
}
