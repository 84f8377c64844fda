//! Real audio devices: cpal for the microphone, rodio for the speaker
//!
//! Both devices live on dedicated OS threads: `cpal::Stream` and
//! `rodio::OutputStream` are not `Send` on every platform, so the handles the
//! session holds only talk to those threads over channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use rodio::{OutputStream, Sink};

use super::capture::{downmix, BlockAssembler, RateConverter};
use super::{
    AudioBackend, AudioChunk, AudioFormat, BlockCallback, CaptureDevice, DeviceError,
    DeviceErrorCallback, PlaybackDevice, PlaybackDone,
};

/// Default host devices via cpal and rodio
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_capture(&self, format: AudioFormat) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        Ok(Box::new(CpalCapture::open(format)?))
    }

    fn open_playback(&self, format: AudioFormat) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        Ok(Box::new(RodioPlayback::open(format)?))
    }
}

// ============================================================================
// Capture
// ============================================================================

/// Negotiated input stream parameters
#[derive(Debug, Clone)]
struct InputSetup {
    config: StreamConfig,
    sample_format: SampleFormat,
}

/// Microphone capture via the default cpal input device
pub struct CpalCapture {
    format: AudioFormat,
    setup: InputSetup,
    worker: Option<CaptureWorker>,
}

/// Handle on the capture thread. The thread owns the cpal stream.
struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    /// Cleared on stop; the stream callback checks it before delivering
    active: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl CaptureWorker {
    /// Silence the callback and tell the thread to drop its stream.
    ///
    /// Does not join: this runs on the session's async driver and cpal may
    /// take a while to tear the stream down.
    fn shutdown(self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(());
        drop(self.thread);
    }
}

impl CpalCapture {
    /// Probe the default input device and pick a stream configuration.
    pub fn open(format: AudioFormat) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(DeviceError::NoInputDevice)?;

        log::info!("Using audio input device: {:?}", device.name());

        let setup = choose_input_setup(&device, format.sample_rate)?;

        log::info!(
            "Audio input config: {} Hz, {} channels, {:?} (session rate {} Hz)",
            setup.config.sample_rate.0,
            setup.config.channels,
            setup.sample_format,
            format.sample_rate
        );

        Ok(Self {
            format,
            setup,
            worker: None,
        })
    }
}

/// Prefer mono f32 at the session rate; otherwise take the device default and
/// adapt in the callback.
fn choose_input_setup(device: &cpal::Device, sample_rate: u32) -> Result<InputSetup, DeviceError> {
    let exact = device
        .supported_input_configs()
        .map_err(|e| DeviceError::NoSupportedConfig(e.to_string()))?
        .filter(|range| {
            range.min_sample_rate().0 <= sample_rate && range.max_sample_rate().0 >= sample_rate
        })
        .min_by_key(|range| {
            (
                range.channels(),
                range.sample_format() != SampleFormat::F32,
            )
        });

    let supported = match exact {
        Some(range) => range.with_sample_rate(SampleRate(sample_rate)),
        None => device
            .default_input_config()
            .map_err(|e| DeviceError::NoSupportedConfig(e.to_string()))?,
    };

    Ok(InputSetup {
        sample_format: supported.sample_format(),
        config: supported.into(),
    })
}

impl CaptureDevice for CpalCapture {
    fn start(
        &mut self,
        on_block: BlockCallback,
        on_error: DeviceErrorCallback,
    ) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Err(DeviceError::StreamCreationFailed(
                "Capture already running".to_string(),
            ));
        }

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (init_tx, init_rx) = std_mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let setup = self.setup.clone();
        let format = self.format;
        let active = Arc::new(AtomicBool::new(true));
        let stream_active = active.clone();

        let thread = std::thread::Builder::new()
            .name("capture-audio".to_string())
            .spawn(move || {
                let stream = match build_input_stream(
                    &setup,
                    format,
                    stream_active,
                    on_block,
                    on_error,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = init_tx.send(Err(DeviceError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = init_tx.send(Ok(()));

                // Park until told to stop (or the handle is dropped)
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Capture thread exiting");
            })
            .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker {
                    stop_tx,
                    active,
                    thread,
                });
                log::info!("Audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::DeviceThreadGone)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
            log::info!("Audio capture stopped");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream(
    setup: &InputSetup,
    format: AudioFormat,
    active: Arc<AtomicBool>,
    on_block: BlockCallback,
    on_error: DeviceErrorCallback,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(DeviceError::NoInputDevice)?;

    match setup.sample_format {
        SampleFormat::I16 => {
            build_stream_typed::<i16>(&device, setup, format, active, on_block, on_error)
        }
        SampleFormat::U16 => {
            build_stream_typed::<u16>(&device, setup, format, active, on_block, on_error)
        }
        SampleFormat::F32 => {
            build_stream_typed::<f32>(&device, setup, format, active, on_block, on_error)
        }
        other => Err(DeviceError::NoSupportedConfig(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    setup: &InputSetup,
    format: AudioFormat,
    active: Arc<AtomicBool>,
    mut on_block: BlockCallback,
    mut on_error: DeviceErrorCallback,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = setup.config.channels;
    let device_rate = setup.config.sample_rate.0;
    let target_rate = format.sample_rate;
    let mut converter = RateConverter::new(device_rate, target_rate)?;
    let mut assembler = BlockAssembler::new(format.block_size);
    let mut scratch: Vec<f32> = Vec::new();
    let mut resampled: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            &setup.config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !active.load(Ordering::Relaxed) {
                    return;
                }
                scratch.clear();
                scratch.extend(data.iter().map(|&s| cpal::Sample::to_sample::<f32>(s)));
                let mono = downmix(&scratch, channels);
                resampled.clear();
                converter.process(&mono, &mut resampled);
                assembler.push(&resampled, |block| on_block(block));
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
                on_error(DeviceError::StreamFailed(err.to_string()));
            },
            None,
        )
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))
}

// ============================================================================
// Playback
// ============================================================================

struct PlayRequest {
    chunk: AudioChunk,
    on_done: PlaybackDone,
}

/// Speaker output via rodio on the default output device
pub struct RodioPlayback {
    tx: Option<std_mpsc::Sender<PlayRequest>>,
    thread: Option<JoinHandle<()>>,
}

impl RodioPlayback {
    pub fn open(format: AudioFormat) -> Result<Self, DeviceError> {
        let (tx, rx) = std_mpsc::channel::<PlayRequest>();
        let (init_tx, init_rx) = std_mpsc::sync_channel::<Result<(), DeviceError>>(1);

        let thread = std::thread::Builder::new()
            .name("playback-audio".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::error!("Failed to open output stream: {}", e);
                        let _ = init_tx.send(Err(DeviceError::NoOutputDevice));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        let err = DeviceError::StreamCreationFailed(e.to_string());
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));

                while let Ok(PlayRequest { chunk, on_done }) = rx.recv() {
                    let sample_rate = chunk.sample_rate();
                    let source =
                        rodio::buffer::SamplesBuffer::new(1, sample_rate, chunk.into_samples());
                    sink.append(source);
                    sink.sleep_until_end();
                    on_done();
                }
                log::debug!("Playback thread exiting");
            })
            .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                log::info!(
                    "Audio playback initialized on default output device ({} Hz)",
                    format.sample_rate
                );
                Ok(Self {
                    tx: Some(tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::DeviceThreadGone)
            }
        }
    }
}

impl PlaybackDevice for RodioPlayback {
    fn play(&mut self, chunk: AudioChunk, on_done: PlaybackDone) -> Result<(), DeviceError> {
        let tx = self.tx.as_ref().ok_or(DeviceError::DeviceThreadGone)?;
        tx.send(PlayRequest { chunk, on_done })
            .map_err(|_| DeviceError::DeviceThreadGone)
    }
}

impl Drop for RodioPlayback {
    fn drop(&mut self) {
        // Closing the channel lets the thread finish the current chunk and exit
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            // Joining could stall the async drain task; let it wind down on its own
            drop(thread);
        }
    }
}
