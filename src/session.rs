//! Public handle for one live interview
//!
//! `InterviewSession` is what callers hold. It validates input, opens the
//! audio devices and hands everything to a driver task that runs the reducer.
//! Every state change happens on that task; callers only observe it through a
//! `watch` channel.
//!
//! A session runs once: after `Closed` or `Failed`, create a new one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::audio::{AudioBackend, CodecError, DeviceError};
use crate::effects::{EffectRunner, RuntimeOptions, SessionRuntime};
use crate::event_log::SessionLog;
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::session_config::{ConfigError, SessionConfig};
use crate::settings::AppSettings;
use crate::state_machine::{reduce, Effect, Event, SessionState, State};
use crate::streaming::{SessionTransport, TransportError};

/// Errors surfaced to callers of the session API
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One live voice interview
pub struct InterviewSession {
    id: Uuid,
    settings: AppSettings,
    backend: Arc<dyn AudioBackend>,
    inbox: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<SessionState>,
    log: SessionLog,
    metrics: Arc<SessionMetrics>,
}

impl std::fmt::Debug for InterviewSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterviewSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl InterviewSession {
    /// Create an idle session and spawn its driver on the current tokio runtime.
    pub fn new(
        settings: AppSettings,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn SessionTransport>,
    ) -> Self {
        let id = Uuid::new_v4();
        let log = SessionLog::new();
        let metrics = Arc::new(SessionMetrics::new());
        let (inbox, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let runtime = SessionRuntime::new(
            RuntimeOptions::from(&settings),
            transport,
            inbox.clone(),
            log.clone(),
            metrics.clone(),
        );

        tokio::spawn(run_session_loop(
            id,
            rx,
            runtime,
            state_tx,
            settings.inactivity_timeout(),
        ));

        log::info!("Session {} created", id);

        Self {
            id,
            settings,
            backend,
            inbox,
            state_rx,
            log,
            metrics,
        }
    }

    /// Start the interview with the candidate's free-text context.
    ///
    /// Returns `ConfigError` (session stays `Idle`) for unusable input and
    /// `DeviceError` (session goes to `Failed`) when the microphone or speaker
    /// cannot be opened. Calling `start` on a session that already left `Idle`
    /// is a logged no-op.
    pub fn start(&self, context: &str) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Idle {
            log::warn!("Session {}: start ignored in state {:?}", self.id, state);
            return Ok(());
        }

        self.settings.validate()?;
        let config = SessionConfig::new(&self.settings.model, context, self.settings.sample_rate)?;

        let devices = match self.backend.open_devices(self.settings.audio_format()) {
            Ok(devices) => devices,
            Err(err) => {
                log::error!("Session {}: failed to open audio devices: {}", self.id, err);
                self.dispatch(Event::DeviceFailed { err: err.clone() });
                return Err(err.into());
            }
        };

        self.dispatch(Event::Start { config, devices });
        Ok(())
    }

    /// End the interview. Safe to call any number of times from any state.
    pub fn stop(&self) {
        self.dispatch(Event::Stop);
    }

    fn dispatch(&self, event: Event) {
        if self.inbox.send(event).is_err() {
            log::debug!("Session {}: driver has exited", self.id);
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch state changes as they are published
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Resolve once the session is `Closed` or `Failed`
    pub async fn wait_finished(&self) -> SessionState {
        let mut rx = self.state_rx.clone();
        let result = rx.wait_for(|state| state.is_finished()).await.map(|s| *s);
        match result {
            Ok(state) => state,
            // Driver gone: report the last published state
            Err(_) => *rx.borrow(),
        }
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for InterviewSession {
    fn drop(&mut self) {
        // Wind the driver down; it would otherwise hold devices until the runtime exits
        let _ = self.inbox.send(Event::Stop);
    }
}

/// Run the session's state loop.
///
/// Single writer: this task is the only place `reduce` is called. Events
/// returned by the runner are reduced before anything else in the inbox.
pub async fn run_session_loop<R: EffectRunner>(
    id: Uuid,
    mut rx: mpsc::UnboundedReceiver<Event>,
    mut runner: R,
    state_tx: watch::Sender<SessionState>,
    inactivity_timeout: Option<Duration>,
) {
    let mut state = State::default();
    let mut pending: VecDeque<Event> = VecDeque::new();
    let mut idle_deadline: Option<Instant> = None;

    log::info!("Session {}: state loop started", id);

    loop {
        let event = if let Some(event) = pending.pop_front() {
            event
        } else {
            let deadline = idle_deadline;
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    idle_deadline = None;
                    Event::InactivityTimeout
                }
            }
        };

        log::debug!("Session {}: received event: {:?}", id, event);

        if event.is_inbound() {
            if let (Some(timeout), Some(_)) = (inactivity_timeout, idle_deadline) {
                idle_deadline = Some(Instant::now() + timeout);
            }
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        if old_discriminant != new_discriminant {
            log::info!("Session {}: state transition: {:?} -> {:?}", id, state, next);
        }
        state = next;

        // The idle timer only runs while the conversation is live
        match (&state, inactivity_timeout) {
            (State::Active, Some(timeout)) if idle_deadline.is_none() => {
                idle_deadline = Some(Instant::now() + timeout);
            }
            (State::Active, _) => {}
            _ => idle_deadline = None,
        }

        for effect in effects {
            match effect {
                Effect::PublishState => {
                    state_tx.send_replace(state.public());
                }
                other => {
                    if let Some(follow_up) = runner.run(other) {
                        pending.push_back(follow_up);
                    }
                }
            }
        }

        if state.is_terminal() && pending.is_empty() {
            // Late resources (a transport that opened as we stopped) still get discarded
            while let Ok(event) = rx.try_recv() {
                let (_, effects) = reduce(&state, event);
                for effect in effects {
                    runner.run(effect);
                }
            }
            break;
        }
    }

    log::info!("Session {}: state loop ended in {:?}", id, state);
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
