//! Effect runner for the interview session
//!
//! This module executes the effects produced by the state machine. The
//! [`SessionRuntime`] owns every resource a session holds (devices, capture
//! bridge, playback queue, transport tasks) so nothing else shares them.
//! Background activities report back by sending [`Event`]s to the driver.
//!
//! ```text
//! capture callback ──try_send──▶ outbound channel ──▶ pump task ──▶ FrameSender
//! transport events ──▶ forwarder task ──▶ driver inbox ──▶ reduce() ──▶ runner
//! playback drain task ──(PlaybackDrained)──▶ driver inbox
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{
    codec, AudioFormat, CaptureBridge, CaptureDevice, DeviceError, PlaybackDevice, PlaybackQueue,
    SessionDevices,
};
use crate::event_log::{LogLevel, SessionLog};
use crate::metrics::SessionMetrics;
use crate::session_config::SessionConfig;
use crate::settings::AppSettings;
use crate::state_machine::{Effect, Event};
use crate::streaming::{
    EncodedFrame, FrameSender, SessionTransport, TransportEvent, TransportLink,
};

/// How long a graceful transport close may take before the session stops waiting
pub const CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Trait for running effects.
/// Long-running work is spawned; completion events go back to the driver.
/// A returned event is reduced before anything else in the inbox.
pub trait EffectRunner: Send + 'static {
    fn run(&mut self, effect: Effect) -> Option<Event>;
}

/// Tuning taken from settings when the session is created
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    pub format: AudioFormat,
    pub outbound_queue_frames: usize,
    pub playback_soft_capacity: usize,
}

impl From<&AppSettings> for RuntimeOptions {
    fn from(settings: &AppSettings) -> Self {
        Self {
            format: settings.audio_format(),
            outbound_queue_frames: settings.outbound_queue_frames.max(1),
            playback_soft_capacity: settings.playback_soft_capacity,
        }
    }
}

/// Real effect runner: owns the session's devices and transport tasks.
pub struct SessionRuntime {
    options: RuntimeOptions,
    transport: Arc<dyn SessionTransport>,
    events: mpsc::UnboundedSender<Event>,
    log: SessionLog,
    metrics: Arc<SessionMetrics>,

    capture_device: Option<Box<dyn CaptureDevice>>,
    playback_device: Option<Box<dyn PlaybackDevice>>,

    connect_task: Option<JoinHandle<()>>,
    outbound_tx: Option<mpsc::Sender<EncodedFrame>>,
    close_requested: CancellationToken,
    pump_task: Option<JoinHandle<()>>,
    forwarder_task: Option<JoinHandle<()>>,

    capture: Option<CaptureBridge>,
    playback: Option<PlaybackQueue>,
    released: bool,
}

impl SessionRuntime {
    pub fn new(
        options: RuntimeOptions,
        transport: Arc<dyn SessionTransport>,
        events: mpsc::UnboundedSender<Event>,
        log: SessionLog,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            options,
            transport,
            events,
            log,
            metrics,
            capture_device: None,
            playback_device: None,
            connect_task: None,
            outbound_tx: None,
            close_requested: CancellationToken::new(),
            pump_task: None,
            forwarder_task: None,
            capture: None,
            playback: None,
            released: false,
        }
    }

    fn install_devices(&mut self, devices: SessionDevices) {
        self.capture_device = Some(devices.capture);
        self.playback_device = Some(devices.playback);
    }

    fn open_transport(&mut self, config: SessionConfig) {
        let transport = self.transport.clone();
        let tx = self.events.clone();

        self.connect_task = Some(tokio::spawn(async move {
            let event = match transport.open(&config).await {
                Ok(link) => Event::TransportOpened { link },
                Err(err) => Event::TransportFailed { err },
            };
            let _ = tx.send(event);
        }));
    }

    fn abort_connect(&mut self) {
        if let Some(task) = self.connect_task.take() {
            if !task.is_finished() {
                log::info!("SessionRuntime: cancelling pending connect");
            }
            task.abort();
        }
    }

    fn attach_transport(&mut self, link: TransportLink) {
        // The connect task has delivered its result
        self.connect_task = None;

        let TransportLink {
            sender,
            events,
            label,
        } = link;
        log::info!("SessionRuntime: transport {} attached", label);

        let (outbound_tx, outbound_rx) = mpsc::channel(self.options.outbound_queue_frames);
        self.outbound_tx = Some(outbound_tx);

        self.pump_task = Some(tokio::spawn(outbound_pump(
            sender,
            outbound_rx,
            self.close_requested.clone(),
            self.metrics.clone(),
            self.events.clone(),
        )));
        self.forwarder_task = Some(tokio::spawn(forward_inbound(events, self.events.clone())));
    }

    fn start_playback(&mut self) -> Option<Event> {
        let Some(device) = self.playback_device.take() else {
            log::error!("SessionRuntime: no playback device installed");
            return Some(Event::DeviceFailed {
                err: DeviceError::NoOutputDevice,
            });
        };

        let tx = self.events.clone();
        self.playback = Some(PlaybackQueue::start(
            device,
            self.options.format.sample_rate,
            self.options.playback_soft_capacity,
            self.metrics.clone(),
            async move {
                let _ = tx.send(Event::PlaybackDrained);
            },
        ));
        None
    }

    fn start_capture(&mut self) -> Option<Event> {
        let Some(device) = self.capture_device.take() else {
            log::error!("SessionRuntime: no capture device installed");
            return Some(Event::DeviceFailed {
                err: DeviceError::NoInputDevice,
            });
        };
        let Some(frames) = self.outbound_tx.clone() else {
            log::error!("SessionRuntime: capture started without a transport");
            return None;
        };

        let mut bridge = CaptureBridge::new(
            device,
            self.options.format.sample_rate,
            self.metrics.clone(),
        );

        let dropped_tx = self.events.clone();
        let error_tx = self.events.clone();
        let result = bridge.start(
            frames,
            Box::new(move |total| {
                let _ = dropped_tx.send(Event::CaptureBlocksDropped { total });
            }),
            Box::new(move |err| {
                let _ = error_tx.send(Event::DeviceFailed { err });
            }),
        );

        // Keep the bridge even on failure so release stops whatever did start
        self.capture = Some(bridge);
        match result {
            Ok(()) => None,
            Err(err) => Some(Event::DeviceFailed { err }),
        }
    }

    fn play_frame(&mut self, data: &str) -> Option<Event> {
        let Some(queue) = self.playback.as_mut() else {
            log::debug!("SessionRuntime: no playback queue, dropping frame");
            return None;
        };

        match codec::decode(data) {
            Ok(samples) if samples.is_empty() => None,
            Ok(samples) => {
                queue.enqueue(samples);
                None
            }
            Err(e) => {
                self.metrics.codec_error();
                Some(Event::FrameRejected {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn stop_capture(&mut self) {
        if let Some(mut bridge) = self.capture.take() {
            bridge.stop();
        }
        self.capture_device = None;
        // No new frames; anything still queued is dropped once close is requested
        self.outbound_tx = None;
    }

    fn close_transport(&mut self) {
        if self.pump_task.is_some() {
            self.close_requested.cancel();
        } else {
            // Never attached: there is nothing to close
            let _ = self.events.send(Event::TransportClosed { reason: None });
        }
    }

    fn finish_playback(&mut self) -> Option<Event> {
        match self.playback.as_mut() {
            Some(queue) => {
                queue.finish();
                None
            }
            None => Some(Event::PlaybackDrained),
        }
    }

    /// Release every resource. Safe to call more than once.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.abort_connect();
        self.stop_capture();
        self.playback_device = None;

        if let Some(mut queue) = self.playback.take() {
            queue.discard();
        }

        self.close_requested.cancel();
        if let Some(task) = self.pump_task.take() {
            // Aborting drops the sender, which tears the socket down
            task.abort();
        }
        if let Some(task) = self.forwarder_task.take() {
            task.abort();
        }

        log::info!("SessionRuntime: all resources released");
    }
}

impl EffectRunner for SessionRuntime {
    fn run(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Log { level, message } => {
                self.log.push(level, message);
                None
            }
            Effect::InstallDevices { devices } => {
                self.install_devices(devices);
                None
            }
            Effect::OpenTransport { config } => {
                self.open_transport(config);
                None
            }
            Effect::AbortConnect => {
                self.abort_connect();
                None
            }
            Effect::AttachTransport { link } => {
                self.attach_transport(link);
                None
            }
            Effect::DiscardTransport { link } => {
                let mut sender = link.sender;
                tokio::spawn(async move {
                    let _ = tokio::time::timeout(CLOSE_GRACE, sender.close()).await;
                });
                None
            }
            Effect::StartPlayback => self.start_playback(),
            Effect::StartCapture => self.start_capture(),
            Effect::PlayFrame { data } => self.play_frame(&data),
            Effect::FlushPlayback => {
                if let Some(queue) = self.playback.as_ref() {
                    queue.flush();
                }
                None
            }
            Effect::RecordTurn => {
                self.metrics.turn_completed();
                None
            }
            Effect::StopCapture => {
                self.stop_capture();
                None
            }
            Effect::CloseTransport => {
                self.close_transport();
                None
            }
            Effect::FinishPlayback => self.finish_playback(),
            Effect::ReleaseAll => {
                self.release();
                self.log
                    .push(LogLevel::Info, self.metrics.snapshot().summary());
                None
            }
            Effect::PublishState => {
                // Handled by the driver, which owns the state watch
                None
            }
        }
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns the transport's outbound half: sends queued frames in order, then
/// closes the transport when asked (or when the frame channel closes).
async fn outbound_pump(
    mut sender: Box<dyn FrameSender>,
    mut frames: mpsc::Receiver<EncodedFrame>,
    close_requested: CancellationToken,
    metrics: Arc<SessionMetrics>,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        tokio::select! {
            biased;
            _ = close_requested.cancelled() => break,
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                // A stalled socket must not keep the session from closing
                let result = tokio::select! {
                    biased;
                    _ = close_requested.cancelled() => break,
                    result = sender.send(frame) => result,
                };
                if let Err(err) = result {
                    log::error!("OutboundPump: send failed: {}", err);
                    let _ = events.send(Event::TransportFailed { err });
                    return;
                }
                let sent = metrics.frame_sent();
                if sent == 1 || sent % 100 == 0 {
                    log::debug!("OutboundPump: {} frames sent", sent);
                }
            }
        }
    }

    match tokio::time::timeout(CLOSE_GRACE, sender.close()).await {
        Ok(Ok(())) => log::info!("OutboundPump: transport closed"),
        Ok(Err(e)) => log::warn!("OutboundPump: close failed: {}", e),
        Err(_) => log::warn!("OutboundPump: close did not finish within {:?}", CLOSE_GRACE),
    }
    let _ = events.send(Event::TransportClosed { reason: None });
}

/// Turns transport events into driver events, preserving arrival order.
async fn forward_inbound(
    mut inbound: mpsc::Receiver<TransportEvent>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(event) = inbound.recv().await {
        let event = match event {
            TransportEvent::Frame { data } => Event::TransportFrame { data },
            TransportEvent::TurnComplete => Event::TurnComplete,
            TransportEvent::Interrupted => Event::Interrupted,
            TransportEvent::GoAway { time_left } => Event::GoAway { time_left },
            TransportEvent::Closed { reason } => Event::TransportClosed { reason },
            TransportEvent::Error(err) => Event::TransportFailed { err },
        };
        if events.send(event).is_err() {
            return;
        }
    }
    // Event stream ended without a terminal event
    let _ = events.send(Event::TransportClosed { reason: None });
}
