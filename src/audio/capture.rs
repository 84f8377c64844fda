//! Capture bridge: microphone blocks to outbound frames
//!
//! Runs inside the capture device's callback, so nothing here may block.
//!
//! ```text
//! Audio Thread (sync)                          Tokio Runtime (async)
//! ┌──────────────────────────┐                 ┌────────────────────┐
//! │ CaptureDevice callback   │                 │ outbound pump      │
//! │   ├─ codec::encode       │──try_send──▶    │   transport.send() │
//! │   └─ drop + count if full│                 └────────────────────┘
//! └──────────────────────────┘
//! ```
//!
//! Also holds the helpers the cpal device uses to turn whatever the sound card
//! delivers into fixed-size mono blocks at the session rate.

use std::sync::Arc;

use rubato::{FftFixedIn, Resampler as _};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{codec, BlockCallback, CaptureDevice, DeviceError, DeviceErrorCallback};
use crate::metrics::SessionMetrics;
use crate::streaming::EncodedFrame;

/// Report dropped blocks on the first drop and then every N drops
const DROP_REPORT_INTERVAL: u64 = 25;

/// Called with the running total of dropped blocks (rate-limited)
pub type DropCallback = Box<dyn FnMut(u64) + Send + 'static>;

/// Forwards captured blocks to the outbound frame channel.
pub struct CaptureBridge {
    device: Box<dyn CaptureDevice>,
    sample_rate: u32,
    metrics: Arc<SessionMetrics>,
    running: bool,
}

impl CaptureBridge {
    pub fn new(
        device: Box<dyn CaptureDevice>,
        sample_rate: u32,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            device,
            sample_rate,
            metrics,
            running: false,
        }
    }

    /// Subscribe to the capture device.
    ///
    /// Each block is encoded and handed to `frames` with `try_send`. When the
    /// channel is full or closed the block is dropped and `on_dropped` hears
    /// about it; the capture thread never waits.
    pub fn start(
        &mut self,
        frames: mpsc::Sender<EncodedFrame>,
        mut on_dropped: DropCallback,
        on_error: DeviceErrorCallback,
    ) -> Result<(), DeviceError> {
        if self.running {
            log::debug!("CaptureBridge: already streaming");
            return Ok(());
        }

        let sample_rate = self.sample_rate;
        let metrics = self.metrics.clone();

        let on_block: BlockCallback = Box::new(move |block: &[f32]| {
            let frame = EncodedFrame::pcm16(codec::encode(block), sample_rate, block.len());
            match frames.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    let total = metrics.block_dropped();
                    if total == 1 || total % DROP_REPORT_INTERVAL == 0 {
                        on_dropped(total);
                    }
                }
            }
        });

        self.device.start(on_block, on_error)?;
        self.running = true;
        log::info!("CaptureBridge: streaming capture blocks at {}Hz", sample_rate);
        Ok(())
    }

    /// Unsubscribe from the device. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.device.stop();
        log::info!(
            "CaptureBridge: stopped ({} blocks dropped)",
            self.metrics.snapshot().blocks_dropped
        );
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CaptureBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accumulates arbitrary-length sample runs into fixed-size blocks
#[derive(Debug)]
pub struct BlockAssembler {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Append samples and call `emit` once per completed block
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(&[f32])) {
        self.pending.extend_from_slice(samples);
        let mut start = 0;
        while self.pending.len() - start >= self.block_size {
            emit(&self.pending[start..start + self.block_size]);
            start += self.block_size;
        }
        self.pending.drain(..start);
    }

    /// Samples held back waiting for a full block
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Average interleaved frames down to mono
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let channels = channels as usize;
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Input frames per resampler call for non-integer ratios
const RESAMPLER_CHUNK: usize = 1024;

/// Converts the device rate to the session rate across callbacks.
///
/// Whole-number ratios (48 kHz to 24 kHz) average groups of samples. Anything
/// else (44.1 kHz, 16 kHz) goes through an FFT resampler that keeps its state
/// for the life of the stream. Input that does not yet fill a group or a
/// resampler chunk is carried into the next call.
pub enum RateConverter {
    Passthrough,
    Decimate {
        ratio: usize,
        carry: Vec<f32>,
    },
    Resample {
        resampler: Box<FftFixedIn<f32>>,
        pending: Vec<f32>,
    },
}

impl std::fmt::Debug for RateConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passthrough => f.write_str("Passthrough"),
            Self::Decimate { ratio, .. } => {
                f.debug_struct("Decimate").field("ratio", ratio).finish()
            }
            Self::Resample { pending, .. } => f
                .debug_struct("Resample")
                .field("pending", &pending.len())
                .finish_non_exhaustive(),
        }
    }
}

impl RateConverter {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self, DeviceError> {
        if source_rate == 0 || target_rate == 0 {
            return Err(DeviceError::NoSupportedConfig(format!(
                "Invalid sample rate (source: {}, target: {})",
                source_rate, target_rate
            )));
        }

        if source_rate == target_rate {
            return Ok(Self::Passthrough);
        }

        if source_rate % target_rate == 0 {
            let ratio = (source_rate / target_rate) as usize;
            return Ok(Self::Decimate {
                ratio,
                carry: Vec::with_capacity(ratio),
            });
        }

        let resampler = FftFixedIn::<f32>::new(
            source_rate as usize,
            target_rate as usize,
            RESAMPLER_CHUNK,
            2, // sub-chunks
            1, // mono
        )
        .map_err(|e| {
            DeviceError::NoSupportedConfig(format!(
                "Cannot resample {} Hz to {} Hz: {}",
                source_rate, target_rate, e
            ))
        })?;

        log::info!("Resampling capture audio {} Hz -> {} Hz", source_rate, target_rate);
        Ok(Self::Resample {
            resampler: Box::new(resampler),
            pending: Vec::with_capacity(RESAMPLER_CHUNK * 2),
        })
    }

    /// Convert `samples` and append whatever output is ready to `out`
    pub fn process(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        match self {
            Self::Passthrough => out.extend_from_slice(samples),
            Self::Decimate { ratio, carry } => {
                let ratio = *ratio;
                for &sample in samples {
                    carry.push(sample);
                    if carry.len() == ratio {
                        out.push(carry.iter().sum::<f32>() / ratio as f32);
                        carry.clear();
                    }
                }
            }
            Self::Resample { resampler, pending } => {
                pending.extend_from_slice(samples);
                let mut start = 0;
                loop {
                    let needed = resampler.input_frames_next();
                    if pending.len() - start < needed {
                        break;
                    }
                    match resampler.process(&[&pending[start..start + needed]], None) {
                        Ok(channels) => {
                            if let Some(mono) = channels.first() {
                                out.extend_from_slice(mono);
                            }
                        }
                        Err(e) => log::error!("Capture resampler failed: {}", e),
                    }
                    start += needed;
                }
                pending.drain(..start);
            }
        }
    }
}
