//! User-facing session log
//!
//! An append-only sequence of timestamped lines describing what the session
//! did ("Connecting...", "Connected. Start speaking.", errors). This is what a
//! UI shows next to the interview; diagnostics go through the `log` facade.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::broadcast;

/// Buffered entries per live subscriber before it starts lagging
const SUBSCRIBER_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of the session log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub at: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.at.format("%H:%M:%S"), self.message)
    }
}

/// Shared handle to a session's log. Cloning shares the same log.
#[derive(Clone)]
pub struct SessionLog {
    entries: Arc<Mutex<Vec<LogEvent>>>,
    tx: broadcast::Sender<LogEvent>,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLog")
            .field("entries", &self.len())
            .finish()
    }
}

impl SessionLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEvent>> {
        // A panic while pushing cannot leave the Vec half-written
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a line stamped with the current local time
    pub fn push(&self, level: LogLevel, message: impl Into<String>) -> LogEvent {
        let event = LogEvent {
            at: Local::now(),
            level,
            message: message.into(),
        };

        match level {
            LogLevel::Info => log::info!("Session: {}", event.message),
            LogLevel::Warn => log::warn!("Session: {}", event.message),
            LogLevel::Error => log::error!("Session: {}", event.message),
        }

        self.lock().push(event.clone());
        // No subscribers is fine
        let _ = self.tx.send(event.clone());
        event
    }

    /// Every entry so far, oldest first
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.lock().clone()
    }

    /// Entries rendered as display lines
    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().map(ToString::to_string).collect()
    }

    /// Receive entries appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any entry's message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|e| e.message.contains(needle))
    }
}
