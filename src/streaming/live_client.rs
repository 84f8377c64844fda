//! Gemini Live API WebSocket client
//!
//! Implements [`SessionTransport`] over the `BidiGenerateContent` socket.
//!
//! # Connection Flow
//!
//! 1. `open()` - Establish WebSocket, send `setup`, wait for `setupComplete`
//! 2. `FrameSender::send()` - Stream audio frames
//! 3. Background reader task turns server messages into `TransportEvent`s
//! 4. `FrameSender::close()` - Close handshake
//!
//! # Retry Strategy
//!
//! Initial connection retries with exponential backoff (1s, 2s, 4s, ...).
//! Mid-session disconnects do NOT reconnect - the session fails instead.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{ClientMessage, ServerMessage};
use super::transport::{EncodedFrame, FrameSender, SessionTransport, TransportEvent, TransportLink};
use super::TransportError;
use crate::session_config::{ConfigError, SessionConfig};

/// Gemini Live API endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for setupComplete
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Inbound events buffered between the reader task and the session
const EVENT_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens live sessions against the Gemini Live API
#[derive(Clone)]
pub struct LiveTransport {
    api_key: String,
    endpoint: String,
    max_attempts: u32,
}

impl std::fmt::Debug for LiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTransport")
            .field("endpoint", &self.endpoint)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl LiveTransport {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        max_attempts: u32,
    ) -> Result<Self, ConfigError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        Ok(Self {
            api_key,
            endpoint: endpoint.into(),
            max_attempts: max_attempts.max(1),
        })
    }

    /// Build a transport using the key from `GEMINI_API_KEY`
    pub fn from_env(endpoint: impl Into<String>, max_attempts: u32) -> Result<Self, ConfigError> {
        let api_key = get_api_key().ok_or(ConfigError::MissingApiKey)?;
        Self::new(api_key, endpoint, max_attempts)
    }

    /// Single connection attempt (no retries)
    async fn try_open(&self, config: &SessionConfig) -> Result<TransportLink, TransportError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("LiveTransport: connecting to {}", self.endpoint);

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, true, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("LiveTransport: WebSocket connected, sending setup...");

        let (mut write, mut read) = ws_stream.split();

        let setup = serde_json::to_string(&ClientMessage::setup(config))
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        timeout(SETUP_TIMEOUT, wait_for_setup(&mut read))
            .await
            .map_err(|_| TransportError::ConnectionFailed("Session setup timeout".to_string()))??;

        log::info!("LiveTransport: setup complete (model {})", config.model());

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(read_loop(read, events_tx));

        Ok(TransportLink {
            sender: Box::new(LiveFrameSender {
                write,
                reader_task,
                closed: false,
            }),
            events: events_rx,
            label: config.model().to_string(),
        })
    }
}

#[async_trait]
impl SessionTransport for LiveTransport {
    async fn open(&self, config: &SessionConfig) -> Result<TransportLink, TransportError> {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::info!(
                    "Retrying WebSocket connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    self.max_attempts
                );
                tokio::time::sleep(delay).await;
            }

            match self.try_open(config).await {
                Ok(link) => return Ok(link),
                // The server answered and said no; retrying won't change that
                Err(e @ TransportError::SetupRejected(_)) => return Err(e),
                Err(e) => {
                    log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::ConnectionFailed("Max retries exceeded".to_string())
        }))
    }
}

/// Parse a text or binary frame as a server message
fn parse_server_message(msg: &Message) -> Option<Result<ServerMessage, serde_json::Error>> {
    match msg {
        Message::Text(text) => Some(serde_json::from_str(text)),
        Message::Binary(bytes) => Some(serde_json::from_slice(bytes)),
        _ => None,
    }
}

/// Consume messages until the server acknowledges the setup
async fn wait_for_setup(read: &mut SplitStream<WsStream>) -> Result<(), TransportError> {
    while let Some(msg_result) = read.next().await {
        let msg = msg_result.map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        if let Message::Close(frame) = &msg {
            let reason = frame
                .as_ref()
                .map(|f| f.reason.to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "Connection closed before setup completed".to_string());
            return Err(TransportError::SetupRejected(reason));
        }

        match parse_server_message(&msg) {
            Some(Ok(server_msg)) if server_msg.is_setup_complete() => return Ok(()),
            Some(Ok(_)) => {
                log::debug!("Ignoring message while waiting for setupComplete");
            }
            Some(Err(e)) => {
                log::warn!("Failed to parse message: {}", e);
            }
            None => {} // Ignore ping/pong
        }
    }
    Err(TransportError::Disconnected("Stream ended".to_string()))
}

/// Forward server messages as transport events until the socket ends
async fn read_loop(mut read: SplitStream<WsStream>, events: mpsc::Sender<TransportEvent>) {
    let terminal = loop {
        let Some(msg_result) = read.next().await else {
            break TransportEvent::Error(TransportError::Disconnected("Stream ended".to_string()));
        };

        let msg = match msg_result {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("LiveTransport: WebSocket error: {}", e);
                break TransportEvent::Error(TransportError::Disconnected(e.to_string()));
            }
        };

        if let Message::Close(frame) = &msg {
            let reason = frame
                .as_ref()
                .map(|f| f.reason.to_string())
                .filter(|r| !r.is_empty());
            log::info!("LiveTransport: WebSocket closed by server ({:?})", reason);
            break TransportEvent::Closed { reason };
        }

        match parse_server_message(&msg) {
            Some(Ok(server_msg)) => {
                for event in server_msg.into_events() {
                    if events.send(event).await.is_err() {
                        log::debug!("LiveTransport: event receiver closed");
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                log::warn!("LiveTransport: failed to parse message: {}", e);
            }
            None => {}
        }
    };

    let _ = events.send(terminal).await;
    log::debug!("LiveTransport: reader task exiting");
}

/// Write half of a live session
struct LiveFrameSender {
    write: SplitSink<WsStream, Message>,
    reader_task: tokio::task::JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl FrameSender for LiveFrameSender {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::SendFailed("Session already closed".to_string()));
        }
        let json = serde_json::to_string(&ClientMessage::audio(frame))
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        log::info!("LiveTransport: closing session...");
        self.write
            .close()
            .await
            .map_err(|e| TransportError::Disconnected(e.to_string()))
    }
}

impl Drop for LiveFrameSender {
    fn drop(&mut self) {
        // Ensure reader task is aborted if the sender is dropped without a close handshake
        self.reader_task.abort();
    }
}

/// Get the Gemini API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty())
}
