//! Live voice interview coach
//!
//! A duplex audio session between the local microphone/speaker and a remote
//! conversational model acting as a hiring manager. Capture blocks are encoded
//! as PCM16 and streamed out; the model's audio comes back as frames that are
//! decoded and played strictly in order.
//!
//! ```no_run
//! # async fn demo() -> Result<(), interview_coach::SessionError> {
//! use std::sync::Arc;
//! use interview_coach::{AppSettings, CpalBackend, InterviewSession, LiveTransport};
//!
//! let settings = AppSettings::default();
//! let transport = LiveTransport::from_env(settings.endpoint.clone(), settings.connect_retries)?;
//! let session = InterviewSession::new(settings, Arc::new(CpalBackend), Arc::new(transport));
//!
//! session.start("Senior backend engineer interview")?;
//! // ... later
//! session.stop();
//! session.wait_finished().await;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod effects;
pub mod event_log;
pub mod metrics;
pub mod session;
pub mod session_config;
pub mod settings;
pub mod state_machine;
pub mod streaming;

pub use audio::{AudioBackend, CodecError, CpalBackend, DeviceError};
pub use event_log::{LogEvent, LogLevel, SessionLog};
pub use metrics::MetricsSnapshot;
pub use session::{InterviewSession, SessionError};
pub use session_config::{ConfigError, SessionConfig};
pub use settings::{default_settings_path, load_settings, save_settings, AppSettings};
pub use state_machine::SessionState;
pub use streaming::{LiveTransport, SessionTransport, TransportError};
