//! Integration tests for the interview session
//!
//! These drive `InterviewSession` end to end with scripted collaborators: a
//! microphone the test pushes blocks into, a speaker that records when each
//! chunk started and finished, and an in-memory transport.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test session_integration
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;

use interview_coach::audio::{
    codec, AudioBackend, AudioChunk, AudioFormat, BlockCallback, CaptureDevice, DeviceError,
    DeviceErrorCallback, PlaybackDevice, PlaybackDone,
};
use interview_coach::streaming::{
    EncodedFrame, FrameSender, SessionTransport, TransportError, TransportEvent, TransportLink,
};
use interview_coach::{
    AppSettings, ConfigError, InterviewSession, SessionConfig, SessionError, SessionState,
};

const WAIT: Duration = Duration::from_secs(5);
const CONTEXT: &str = "Senior backend engineer interview";

// ============================================================================
// Scripted microphone
// ============================================================================

#[derive(Default)]
struct MicState {
    on_block: Option<BlockCallback>,
    on_error: Option<DeviceErrorCallback>,
    starts: u32,
    stops: u32,
    dropped: bool,
}

#[derive(Clone, Default)]
struct Mic(Arc<Mutex<MicState>>);

impl Mic {
    /// Deliver one block as the device's audio thread would
    fn push_block(&self, block: &[f32]) {
        let mut state = self.0.lock().unwrap();
        if let Some(on_block) = state.on_block.as_mut() {
            on_block(block);
        }
    }

    fn fail(&self, err: DeviceError) {
        let mut state = self.0.lock().unwrap();
        if let Some(on_error) = state.on_error.as_mut() {
            on_error(err);
        }
    }

    fn starts(&self) -> u32 {
        self.0.lock().unwrap().starts
    }

    fn stops(&self) -> u32 {
        self.0.lock().unwrap().stops
    }

    fn is_subscribed(&self) -> bool {
        self.0.lock().unwrap().on_block.is_some()
    }

    fn is_dropped(&self) -> bool {
        self.0.lock().unwrap().dropped
    }
}

struct MicDevice(Mic);

impl CaptureDevice for MicDevice {
    fn start(
        &mut self,
        on_block: BlockCallback,
        on_error: DeviceErrorCallback,
    ) -> Result<(), DeviceError> {
        let mut state = (self.0).0.lock().unwrap();
        state.on_block = Some(on_block);
        state.on_error = Some(on_error);
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = (self.0).0.lock().unwrap();
        state.on_block = None;
        state.on_error = None;
        state.stops += 1;
    }
}

impl Drop for MicDevice {
    fn drop(&mut self) {
        (self.0).0.lock().unwrap().dropped = true;
    }
}

// ============================================================================
// Instrumented speaker
// ============================================================================

#[derive(Debug, Clone)]
struct PlayRecord {
    samples: Vec<f32>,
    started: Instant,
    ended: Option<Instant>,
}

#[derive(Default)]
struct SpeakerState {
    played: Vec<PlayRecord>,
    playing: bool,
    overlaps: u32,
}

#[derive(Clone)]
struct Speaker {
    state: Arc<Mutex<SpeakerState>>,
    /// Fixed time per chunk; `None` plays for the chunk's real duration
    hold: Option<Duration>,
}

impl Speaker {
    fn new(hold: Option<Duration>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SpeakerState::default())),
            hold,
        }
    }

    fn played(&self) -> Vec<PlayRecord> {
        self.state.lock().unwrap().played.clone()
    }

    fn overlaps(&self) -> u32 {
        self.state.lock().unwrap().overlaps
    }
}

struct SpeakerDevice(Speaker);

impl PlaybackDevice for SpeakerDevice {
    fn play(&mut self, chunk: AudioChunk, on_done: PlaybackDone) -> Result<(), DeviceError> {
        let hold = self.0.hold.unwrap_or_else(|| chunk.duration());
        let index = {
            let mut state = self.0.state.lock().unwrap();
            if state.playing {
                state.overlaps += 1;
            }
            state.playing = true;
            state.played.push(PlayRecord {
                samples: chunk.into_samples(),
                started: Instant::now(),
                ended: None,
            });
            state.played.len() - 1
        };

        let shared = self.0.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            {
                let mut state = shared.lock().unwrap();
                state.playing = false;
                state.played[index].ended = Some(Instant::now());
            }
            on_done();
        });
        Ok(())
    }
}

// ============================================================================
// Backend
// ============================================================================

struct Backend {
    mic: Mic,
    speaker: Speaker,
    fail: Option<DeviceError>,
}

impl AudioBackend for Backend {
    fn open_capture(&self, _: AudioFormat) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        match &self.fail {
            Some(err) => Err(err.clone()),
            None => Ok(Box::new(MicDevice(self.mic.clone()))),
        }
    }

    fn open_playback(&self, _: AudioFormat) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        Ok(Box::new(SpeakerDevice(self.speaker.clone())))
    }
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Default)]
struct RemoteState {
    opens: u32,
    open_cancelled: bool,
    sent: Vec<EncodedFrame>,
    closes: u32,
    inbound: Option<mpsc::Sender<TransportEvent>>,
}

#[derive(Clone, Default)]
struct Remote {
    state: Arc<Mutex<RemoteState>>,
    /// `open` never resolves
    hang_open: bool,
    fail_open: Option<TransportError>,
    /// `send` never resolves (a stalled socket)
    stall_sends: bool,
}

impl Remote {
    async fn push(&self, event: TransportEvent) {
        let tx = self.state.lock().unwrap().inbound.clone();
        tx.expect("transport not open").send(event).await.unwrap();
    }

    async fn push_audio(&self, samples: &[f32]) {
        self.push(TransportEvent::Frame {
            data: codec::encode(samples),
        })
        .await;
    }

    fn opens(&self) -> u32 {
        self.state.lock().unwrap().opens
    }

    fn sent(&self) -> Vec<EncodedFrame> {
        self.state.lock().unwrap().sent.clone()
    }

    fn closes(&self) -> u32 {
        self.state.lock().unwrap().closes
    }

    fn open_cancelled(&self) -> bool {
        self.state.lock().unwrap().open_cancelled
    }
}

/// Marks the pending open as cancelled when its future is dropped
struct OpenGuard(Arc<Mutex<RemoteState>>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.lock().unwrap().open_cancelled = true;
    }
}

#[async_trait]
impl SessionTransport for Remote {
    async fn open(&self, _config: &SessionConfig) -> Result<TransportLink, TransportError> {
        self.state.lock().unwrap().opens += 1;

        if self.hang_open {
            let _guard = OpenGuard(self.state.clone());
            std::future::pending::<()>().await;
        }
        if let Some(err) = &self.fail_open {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::channel(64);
        self.state.lock().unwrap().inbound = Some(tx);
        Ok(TransportLink {
            sender: Box::new(RemoteSender {
                state: self.state.clone(),
                stall: self.stall_sends,
            }),
            events: rx,
            label: "in-memory".to_string(),
        })
    }
}

struct RemoteSender {
    state: Arc<Mutex<RemoteState>>,
    stall: bool,
}

#[async_trait]
impl FrameSender for RemoteSender {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportError> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        self.state.lock().unwrap().sent.push(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // The remote end answers a close with its own Close frame
        let inbound = {
            let mut state = self.state.lock().unwrap();
            state.closes += 1;
            state.inbound.take()
        };
        if let Some(tx) = inbound {
            let _ = tx.try_send(TransportEvent::Closed { reason: None });
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    session: InterviewSession,
    mic: Mic,
    speaker: Speaker,
    remote: Remote,
}

fn harness_with(
    settings: AppSettings,
    speaker: Speaker,
    remote: Remote,
    fail: Option<DeviceError>,
) -> Harness {
    let mic = Mic::default();
    let backend = Backend {
        mic: mic.clone(),
        speaker: speaker.clone(),
        fail,
    };
    let session = InterviewSession::new(settings, Arc::new(backend), Arc::new(remote.clone()));
    Harness {
        session,
        mic,
        speaker,
        remote,
    }
}

fn harness() -> Harness {
    harness_with(
        AppSettings::default(),
        Speaker::new(Some(Duration::from_millis(20))),
        Remote::default(),
        None,
    )
}

async fn wait_for_state(session: &InterviewSession, target: SessionState) {
    let mut rx = session.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", target))
        .unwrap();
}

async fn wait_finished(session: &InterviewSession) -> SessionState {
    tokio::time::timeout(WAIT, session.wait_finished())
        .await
        .expect("session did not finish")
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn start_active(h: &Harness) {
    h.session.start(CONTEXT).unwrap();
    wait_for_state(&h.session, SessionState::Active).await;
    eventually("capture subscription", || h.mic.is_subscribed()).await;
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn end_to_end_silence_out_tone_back() {
    let h = harness();
    start_active(&h).await;

    let silence = vec![0.0f32; 4096];
    for _ in 0..3 {
        h.mic.push_block(&silence);
    }

    eventually("three sends", || h.remote.sent().len() == 3).await;
    for frame in h.remote.sent() {
        assert_eq!(frame.mime_type, "audio/pcm;rate=24000");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&frame.data)
            .unwrap();
        assert_eq!(bytes.len(), 4096 * 2);
        assert!(bytes.iter().all(|b| *b == 0));
    }

    h.remote.push_audio(&[0.5; 100]).await;
    eventually("one chunk played", || h.speaker.played().len() == 1).await;

    let played = h.speaker.played();
    assert_eq!(played[0].samples.len(), 100);
    for sample in &played[0].samples {
        assert!((sample - 0.5).abs() <= 1.0 / 32767.0);
    }

    h.session.stop();
    assert_eq!(wait_finished(&h.session).await, SessionState::Closed);
    assert_eq!(h.speaker.played().len(), 1);
    assert_eq!(h.session.metrics().frames_sent, 3);
    assert!(h.session.log().contains("Session connected"));
}

// ============================================================================
// Playback ordering
// ============================================================================

#[tokio::test]
async fn playback_is_fifo_and_never_overlaps() {
    let h = harness_with(
        AppSettings::default(),
        Speaker::new(Some(Duration::from_millis(10))),
        Remote::default(),
        None,
    );
    start_active(&h).await;

    const N: usize = 12;
    for i in 0..N {
        let value = i as f32 / 32.0;
        h.remote.push_audio(&[value; 240]).await;
    }

    eventually("all chunks played", || {
        let played = h.speaker.played();
        played.len() == N && played.iter().all(|p| p.ended.is_some())
    })
    .await;

    let played = h.speaker.played();
    assert_eq!(h.speaker.overlaps(), 0);
    for (i, record) in played.iter().enumerate() {
        let expected = i as f32 / 32.0;
        assert!((record.samples[0] - expected).abs() <= 1.0 / 32767.0);
    }
    for pair in played.windows(2) {
        let ended = pair[0].ended.unwrap();
        assert!(ended <= pair[1].started, "chunks overlapped");
    }

    h.session.stop();
    assert_eq!(wait_finished(&h.session).await, SessionState::Closed);
}

#[tokio::test]
async fn interruption_drops_queued_audio() {
    let h = harness_with(
        AppSettings::default(),
        Speaker::new(Some(Duration::from_millis(150))),
        Remote::default(),
        None,
    );
    start_active(&h).await;

    for _ in 0..5 {
        h.remote.push_audio(&[0.25; 240]).await;
    }
    eventually("first chunk playing", || h.speaker.played().len() == 1).await;
    h.remote.push(TransportEvent::Interrupted).await;
    h.remote.push_audio(&[-0.5; 240]).await;

    eventually("post-interruption chunk played", || {
        h.speaker
            .played()
            .last()
            .map(|p| p.samples[0] < 0.0)
            .unwrap_or(false)
    })
    .await;

    // The chunk that was playing finishes, the four behind it are dropped
    let played = h.speaker.played();
    assert_eq!(played.len(), 2);
    assert!(played[0].samples[0] > 0.0);
    assert_eq!(h.session.metrics().chunks_discarded, 4);
    assert_eq!(h.session.state(), SessionState::Active);

    h.session.stop();
    assert_eq!(wait_finished(&h.session).await, SessionState::Closed);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn stop_before_open_cancels_connect() {
    let remote = Remote {
        hang_open: true,
        ..Remote::default()
    };
    let h = harness_with(AppSettings::default(), Speaker::new(None), remote, None);

    let mut states = h.session.subscribe_state();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let observer = {
        let observed = observed.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                observed.lock().unwrap().push(*states.borrow_and_update());
            }
        })
    };

    h.session.start(CONTEXT).unwrap();
    h.session.stop();

    assert_eq!(wait_finished(&h.session).await, SessionState::Closed);
    eventually("open cancelled", || h.remote.open_cancelled()).await;
    eventually("devices released", || h.mic.is_dropped()).await;

    assert_eq!(h.mic.starts(), 0);
    assert!(h.speaker.played().is_empty());
    observer.abort();
    assert!(!observed.lock().unwrap().contains(&SessionState::Active));
}

#[tokio::test]
async fn stop_twice_closes_once() {
    let h = harness();
    start_active(&h).await;

    h.session.stop();
    h.session.stop();
    assert_eq!(wait_finished(&h.session).await, SessionState::Closed);

    // Late stops after the driver finished are still harmless
    h.session.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.remote.closes(), 1);
    assert_eq!(h.mic.stops(), 1);
    let closed_lines = h
        .session
        .log()
        .snapshot()
        .iter()
        .filter(|e| e.message == "Session closed")
        .count();
    assert_eq!(closed_lines, 1);
    assert_eq!(h.session.state(), SessionState::Closed);
}

#[tokio::test]
async fn remote_close_lets_queued_audio_finish() {
    let h = harness_with(
        AppSettings::default(),
        Speaker::new(Some(Duration::from_millis(40))),
        Remote::default(),
        None,
    );
    start_active(&h).await;

    for _ in 0..3 {
        h.remote.push_audio(&[0.1; 240]).await;
    }
    h.remote
        .push(TransportEvent::Closed {
            reason: Some("session ended".to_string()),
        })
        .await;

    assert_eq!(wait_finished(&h.session).await, SessionState::Closed);
    assert_eq!(h.speaker.played().len(), 3);
    assert!(!h.mic.is_subscribed());
    assert!(h.session.log().contains("session ended"));
}

#[tokio::test]
async fn start_is_ignored_once_started() {
    let h = harness();
    start_active(&h).await;

    h.session.start(CONTEXT).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.remote.opens(), 1);
    assert_eq!(h.mic.starts(), 1);
    assert_eq!(h.session.state(), SessionState::Active);

    h.session.stop();
    wait_finished(&h.session).await;
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn transport_error_while_active_fails_and_releases() {
    let h = harness_with(
        AppSettings::default(),
        Speaker::new(Some(Duration::from_millis(200))),
        Remote::default(),
        None,
    );
    start_active(&h).await;

    for _ in 0..5 {
        h.remote.push_audio(&[0.2; 240]).await;
    }
    eventually("first chunk playing", || h.speaker.played().len() == 1).await;

    h.remote
        .push(TransportEvent::Error(TransportError::Disconnected(
            "connection reset".to_string(),
        )))
        .await;

    assert_eq!(wait_finished(&h.session).await, SessionState::Failed);
    assert!(!h.mic.is_subscribed());
    assert_eq!(h.mic.stops(), 1);

    // The playing chunk finishes, the rest are discarded
    eventually("backlog discarded", || h.session.metrics().chunks_discarded == 4).await;
    assert_eq!(h.speaker.played().len(), 1);
    assert!(h.session.log().contains("connection reset"));
}

#[tokio::test]
async fn open_failure_fails_without_capturing() {
    let remote = Remote {
        fail_open: Some(TransportError::ConnectionFailed("refused".to_string())),
        ..Remote::default()
    };
    let h = harness_with(AppSettings::default(), Speaker::new(None), remote, None);

    h.session.start(CONTEXT).unwrap();
    assert_eq!(wait_finished(&h.session).await, SessionState::Failed);

    assert_eq!(h.mic.starts(), 0);
    eventually("devices released", || h.mic.is_dropped()).await;
    assert!(h.session.log().contains("refused"));
}

#[tokio::test]
async fn device_error_surfaces_from_start() {
    let h = harness_with(
        AppSettings::default(),
        Speaker::new(None),
        Remote::default(),
        Some(DeviceError::NoInputDevice),
    );

    let err = h.session.start(CONTEXT).unwrap_err();
    assert!(matches!(err, SessionError::Device(DeviceError::NoInputDevice)));
    assert_eq!(wait_finished(&h.session).await, SessionState::Failed);
    assert_eq!(h.remote.opens(), 0);
}

#[tokio::test]
async fn empty_context_is_rejected_and_session_stays_idle() {
    let h = harness();

    let err = h.session.start("   ").unwrap_err();
    assert!(matches!(err, SessionError::Config(ConfigError::EmptyContext)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.remote.opens(), 0);

    // The session can still be started with valid input
    start_active(&h).await;
    h.session.stop();
    wait_finished(&h.session).await;
}

#[tokio::test]
async fn capture_stream_error_fails_session() {
    let h = harness();
    start_active(&h).await;

    h.mic.fail(DeviceError::StreamFailed("device unplugged".to_string()));

    assert_eq!(wait_finished(&h.session).await, SessionState::Failed);
    assert!(h.session.log().contains("device unplugged"));
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_logged() {
    let h = harness();
    start_active(&h).await;

    h.remote
        .push(TransportEvent::Frame {
            data: "AAA".to_string(),
        })
        .await;
    h.remote.push_audio(&[0.3; 240]).await;

    eventually("good frame played", || h.speaker.played().len() == 1).await;
    assert!(h.session.log().contains("Dropped malformed audio frame"));
    assert_eq!(h.session.metrics().codec_errors, 1);
    assert_eq!(h.session.state(), SessionState::Active);

    h.session.stop();
    assert_eq!(wait_finished(&h.session).await, SessionState::Closed);
}

#[tokio::test]
async fn blocks_are_dropped_when_transport_is_stalled() {
    let settings = AppSettings {
        outbound_queue_frames: 1,
        ..AppSettings::default()
    };
    let remote = Remote {
        stall_sends: true,
        ..Remote::default()
    };
    let h = harness_with(settings, Speaker::new(None), remote, None);
    start_active(&h).await;

    let block = vec![0.0f32; 4096];
    for _ in 0..5 {
        h.mic.push_block(&block);
    }

    eventually("drop logged", || h.session.log().contains("microphone block")).await;
    assert!(h.session.metrics().blocks_dropped >= 3);

    // A stalled socket must not keep the session from closing
    h.session.stop();
    assert_eq!(wait_finished(&h.session).await, SessionState::Closed);
    assert!(h.remote.sent().is_empty());
}

#[tokio::test]
async fn turn_complete_is_logged_and_counted() {
    let h = harness();
    start_active(&h).await;

    h.remote.push(TransportEvent::TurnComplete).await;
    eventually("turn logged", || h.session.log().contains("AI finished speaking")).await;
    assert_eq!(h.session.metrics().turns_completed, 1);
    assert_eq!(h.session.state(), SessionState::Active);

    h.session.stop();
    wait_finished(&h.session).await;
}
