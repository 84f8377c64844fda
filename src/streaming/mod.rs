//! Streaming transport to the remote conversational model
//!
//! The session only sees the [`SessionTransport`] contract: open a session
//! with a [`SessionConfig`](crate::session_config::SessionConfig), push encoded
//! frames through a [`FrameSender`], and receive [`TransportEvent`]s in arrival
//! order. [`LiveTransport`] implements it over a WebSocket to the Gemini Live
//! API.
//!
//! # Architecture
//!
//! ```text
//! outbound pump ──▶ FrameSender ──▶ WebSocket write half
//!                                          │
//!                                     remote model
//!                                          │
//! driver loop ◀── TransportEvent ◀── reader task (read half)
//! ```
//!
//! # Failure Strategy
//!
//! - Initial connection retries with exponential backoff
//! - Mid-session disconnects are fatal for the session (no reconnection)
//! - A Close frame from the server is a normal close; anything else is an error

mod live_client;
mod protocol;
mod transport;

pub use live_client::{get_api_key, LiveTransport, API_KEY_ENV, DEFAULT_ENDPOINT};
pub use protocol::{ClientMessage, ServerMessage};
pub use transport::{
    pcm_mime_type, EncodedFrame, FrameSender, SessionTransport, TransportEvent, TransportLink,
};

/// Errors that can occur on the session transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the WebSocket connection
    #[error("Failed to connect to the live API: {0}")]
    ConnectionFailed(String),
    /// The server refused the session setup
    #[error("Session setup rejected: {0}")]
    SetupRejected(String),
    /// Malformed or unexpected traffic
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),
    /// Connection was lost without a close handshake
    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),
    /// Failed to send a frame
    #[error("Failed to send audio: {0}")]
    SendFailed(String),
}
