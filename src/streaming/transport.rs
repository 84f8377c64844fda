//! Transport contract between the session and the remote model

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::TransportError;
use crate::session_config::SessionConfig;

/// One transport-ready unit of outbound audio (one capture block)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// e.g. `audio/pcm;rate=24000`
    pub mime_type: String,
    /// Base64 PCM16LE
    pub data: String,
    /// Number of samples carried by `data`
    pub samples: usize,
}

impl EncodedFrame {
    pub fn pcm16(data: String, sample_rate: u32, samples: usize) -> Self {
        Self {
            mime_type: pcm_mime_type(sample_rate),
            data,
            samples,
        }
    }
}

/// MIME type for raw PCM16 at `sample_rate`
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Inbound events, delivered in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Base64 PCM16LE audio from the model
    Frame { data: String },
    /// The model finished its turn
    TurnComplete,
    /// The model stopped speaking because the user talked over it
    Interrupted,
    /// The server will close the connection soon
    GoAway { time_left: Option<String> },
    /// The session ended with a close handshake
    Closed { reason: Option<String> },
    /// The connection failed
    Error(TransportError),
}

/// Outbound half of an open session
#[async_trait]
pub trait FrameSender: Send {
    /// Queue a frame for transmission
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportError>;

    /// Request a graceful shutdown. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An open session: the outbound half plus the inbound event stream
pub struct TransportLink {
    pub sender: Box<dyn FrameSender>,
    pub events: mpsc::Receiver<TransportEvent>,
    /// Human-readable identifier for logs
    pub label: String,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Opens duplex sessions with the remote model.
///
/// `open` resolves once the remote endpoint has acknowledged the session;
/// that resolution is the session's `onOpen`. Dropping the future cancels a
/// pending open.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn open(&self, config: &SessionConfig) -> Result<TransportLink, TransportError>;
}
