//! State machine for an interview session
//!
//! This module implements the core state machine using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute. Resources (devices, the open
//! transport) travel inside events and effects, so the reducer hands them to the
//! effect runner instead of sharing them.

use serde::Serialize;

use crate::audio::{DeviceError, SessionDevices};
use crate::event_log::LogLevel;
use crate::session_config::SessionConfig;
use crate::streaming::{TransportError, TransportLink};

/// Internal state of the session lifecycle.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    /// Devices are held; waiting for the remote end to acknowledge the session
    Connecting,
    /// Duplex audio is flowing
    Active,
    /// Capture is stopped; waiting for the transport to close and playback to drain
    Closing {
        transport_closed: bool,
        playback_drained: bool,
    },
    Closed,
    Failed {
        reason: String,
    },
}

impl State {
    pub fn public(&self) -> SessionState {
        match self {
            State::Idle => SessionState::Idle,
            State::Connecting => SessionState::Connecting,
            State::Active => SessionState::Active,
            State::Closing { .. } => SessionState::Closing,
            State::Closed => SessionState::Closed,
            State::Failed { .. } => SessionState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Closed | State::Failed { .. })
    }
}

/// Externally visible session state.
/// Serialized as `"idle"`, `"connecting"`, ... for UI consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// The session is over (`Closed` or `Failed`)
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Events that can trigger state transitions.
/// Sent by the session handle (start/stop), the transport forwarder, the
/// playback drain task, the capture callback and the inactivity timer.
#[derive(Debug)]
pub enum Event {
    /// User started the interview with validated config and opened devices
    Start {
        config: SessionConfig,
        devices: SessionDevices,
    },
    /// User asked to end the session
    Stop,

    // Transport events
    /// `open` resolved: the remote end acknowledged the session
    TransportOpened {
        link: TransportLink,
    },
    /// Inbound audio (base64 PCM16LE)
    TransportFrame {
        data: String,
    },
    TurnComplete,
    Interrupted,
    GoAway {
        time_left: Option<String>,
    },
    /// The transport closed cleanly (remote Close frame or local close finished)
    TransportClosed {
        reason: Option<String>,
    },
    TransportFailed {
        err: TransportError,
    },

    // Audio events
    DeviceFailed {
        err: DeviceError,
    },
    /// The playback drain task has stopped
    PlaybackDrained,
    /// Running total of capture blocks that could not be handed off
    CaptureBlocksDropped {
        total: u64,
    },
    /// An inbound frame failed to decode and was dropped
    FrameRejected {
        reason: String,
    },

    /// No inbound transport activity for the configured idle period
    InactivityTimeout,
}

impl Event {
    /// Whether this event came from the remote side (resets the idle timer)
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            Event::TransportFrame { .. }
                | Event::TurnComplete
                | Event::Interrupted
                | Event::GoAway { .. }
        )
    }
}

/// Effects to be executed after a state transition.
/// The effect runner executes these in order.
#[derive(Debug)]
pub enum Effect {
    /// Append a line to the user-facing session log
    Log {
        level: LogLevel,
        message: String,
    },
    /// Take ownership of the session's devices
    InstallDevices {
        devices: SessionDevices,
    },
    /// Begin opening the transport in the background
    OpenTransport {
        config: SessionConfig,
    },
    /// Cancel a pending open
    AbortConnect,
    /// Start the outbound pump and inbound forwarder for an open transport
    AttachTransport {
        link: TransportLink,
    },
    /// Close a transport that opened after the session was already over
    DiscardTransport {
        link: TransportLink,
    },
    StartPlayback,
    StartCapture,
    /// Decode and enqueue inbound audio
    PlayFrame {
        data: String,
    },
    /// Drop queued audio after the current chunk (barge-in)
    FlushPlayback,
    RecordTurn,
    StopCapture,
    CloseTransport,
    /// Let queued audio play out, then report `PlaybackDrained`
    FinishPlayback,
    /// Release every resource still held
    ReleaseAll,
    /// Publish the new public state to observers
    PublishState,
}

fn log(level: LogLevel, message: impl Into<String>) -> Effect {
    Effect::Log {
        level,
        message: message.into(),
    }
}

/// Enter `Failed`, releasing everything
fn fail(reason: String, abort_connect: bool) -> (State, Vec<Effect>) {
    let mut effects = vec![log(LogLevel::Error, format!("Error: {}", reason))];
    if abort_connect {
        effects.push(Effect::AbortConnect);
    }
    effects.push(Effect::ReleaseAll);
    effects.push(Effect::PublishState);
    (State::Failed { reason }, effects)
}

/// Leave `Active` for `Closing`
fn begin_closing(transport_closed: bool, message: String) -> (State, Vec<Effect>) {
    (
        State::Closing {
            transport_closed,
            playback_drained: false,
        },
        vec![
            log(LogLevel::Info, message),
            Effect::StopCapture,
            Effect::CloseTransport,
            Effect::FinishPlayback,
            Effect::PublishState,
        ],
    )
}

/// Stay in `Closing` or finish once both halves are done
fn closing_progress(transport_closed: bool, playback_drained: bool) -> (State, Vec<Effect>) {
    if transport_closed && playback_drained {
        (
            State::Closed,
            vec![
                log(LogLevel::Info, "Session closed"),
                Effect::ReleaseAll,
                Effect::PublishState,
            ],
        )
    } else {
        (
            State::Closing {
                transport_closed,
                playback_drained,
            },
            vec![],
        )
    }
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Terminal states ignore everything (resources arriving late are discarded)
/// - Always emit PublishState after a state change
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (State::Idle, Start { config, devices }) => (
            State::Connecting,
            vec![
                log(
                    LogLevel::Info,
                    format!("Connecting to {}...", config.model()),
                ),
                InstallDevices { devices },
                OpenTransport { config },
                PublishState,
            ],
        ),
        // Nothing acquired yet; the instance is spent
        (State::Idle, Stop) => (
            State::Closed,
            vec![log(LogLevel::Info, "Session closed"), PublishState],
        ),
        (State::Idle, DeviceFailed { err }) => fail(err.to_string(), false),

        // A second start never restarts a session; its devices are dropped here
        (_, Start { devices, .. }) => {
            drop(devices);
            (
                state.clone(),
                vec![log(LogLevel::Warn, "Session already started; ignoring start")],
            )
        }

        // -----------------
        // Connecting
        // -----------------
        (State::Connecting, TransportOpened { link }) => (
            State::Active,
            vec![
                log(LogLevel::Info, "Session connected"),
                AttachTransport { link },
                StartPlayback,
                StartCapture,
                PublishState,
            ],
        ),
        (State::Connecting, TransportFailed { err }) => fail(err.to_string(), true),
        (State::Connecting, DeviceFailed { err }) => fail(err.to_string(), true),
        // Cancels the pending open; nothing has been queued for playback yet
        (State::Connecting, Stop) => (
            State::Closed,
            vec![
                log(LogLevel::Info, "Session closed before it connected"),
                AbortConnect,
                ReleaseAll,
                PublishState,
            ],
        ),

        // -----------------
        // Active
        // -----------------
        (State::Active, TransportFrame { data }) => (State::Active, vec![PlayFrame { data }]),
        (State::Active, TurnComplete) => (
            State::Active,
            vec![log(LogLevel::Info, "AI finished speaking"), RecordTurn],
        ),
        (State::Active, Interrupted) => (
            State::Active,
            vec![
                log(LogLevel::Info, "AI interrupted; dropping queued audio"),
                FlushPlayback,
            ],
        ),
        (State::Active, Stop) => begin_closing(false, "Ending session...".to_string()),
        (State::Active, TransportClosed { reason }) => begin_closing(
            true,
            match reason {
                Some(reason) => format!("Session closed by server: {}", reason),
                None => "Session closed by server".to_string(),
            },
        ),
        (State::Active, InactivityTimeout) => begin_closing(
            false,
            "No activity from the interviewer; ending session".to_string(),
        ),

        // -----------------
        // Closing
        // -----------------
        (
            State::Closing {
                playback_drained, ..
            },
            TransportClosed { .. },
        ) => closing_progress(true, *playback_drained),
        (
            State::Closing {
                transport_closed, ..
            },
            PlaybackDrained,
        ) => closing_progress(*transport_closed, true),
        (State::Closing { .. }, TransportFrame { .. }) => {
            log::debug!("Dropping inbound frame received while closing");
            (state.clone(), vec![])
        }

        // -----------------
        // Shared by Active and Closing
        // -----------------
        (State::Active | State::Closing { .. }, GoAway { time_left }) => (
            state.clone(),
            vec![log(
                LogLevel::Warn,
                match time_left {
                    Some(t) => format!("Server is ending the session (time left: {})", t),
                    None => "Server is ending the session".to_string(),
                },
            )],
        ),
        (State::Active | State::Closing { .. }, FrameRejected { reason }) => (
            state.clone(),
            vec![log(
                LogLevel::Warn,
                format!("Dropped malformed audio frame: {}", reason),
            )],
        ),
        (State::Active | State::Closing { .. }, TransportFailed { err }) => {
            fail(err.to_string(), false)
        }
        (State::Active | State::Closing { .. }, DeviceFailed { err }) => {
            fail(err.to_string(), false)
        }
        (
            State::Connecting | State::Active | State::Closing { .. },
            CaptureBlocksDropped { total },
        ) => (
            state.clone(),
            vec![log(
                LogLevel::Warn,
                format!(
                    "Dropped {} microphone block(s): transport not ready",
                    total
                ),
            )],
        ),

        // -----------------
        // Resources arriving after the session is over
        // -----------------
        (_, TransportOpened { link }) => {
            log::debug!("Transport opened in {:?}; closing it", state);
            (state.clone(), vec![DiscardTransport { link }])
        }

        // -----------------
        // Unhandled: no transition
        // (Stop in Closing/Closed/Failed, late transport events, ...)
        // -----------------
        (_, event) => {
            log::trace!("Ignoring {:?} in {:?}", event, state);
            (state.clone(), vec![])
        }
    }
}
