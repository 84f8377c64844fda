//! Audio I/O for the interview session
//!
//! This module owns everything between the sound card and the transport:
//! the PCM16 codec, the capture bridge that turns microphone blocks into
//! outbound frames, and the playback queue that plays inbound audio in order.
//!
//! Devices are reached through two small traits so the session can run
//! against cpal/rodio in production and scripted devices in tests.

pub mod capture;
pub mod codec;
pub mod device;
pub mod playback;

use std::time::Duration;

pub use capture::CaptureBridge;
pub use codec::CodecError;
pub use device::CpalBackend;
pub use playback::{AudioChunk, PlaybackQueue};

/// Errors raised by capture or playback devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("No supported audio configuration: {0}")]
    NoSupportedConfig(String),
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Audio stream error: {0}")]
    StreamFailed(String),
    #[error("Audio device thread is gone")]
    DeviceThreadGone,
}

/// Mono audio format shared by capture and playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second (the live session uses 24 kHz)
    pub sample_rate: u32,
    /// Samples per capture block
    pub block_size: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            block_size: 4096,
        }
    }
}

impl AudioFormat {
    /// Wall-clock length of one capture block
    pub fn block_duration(&self) -> Duration {
        samples_duration(self.block_size, self.sample_rate)
    }
}

/// Duration of `samples` mono samples at `sample_rate`
pub fn samples_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples as u64 * 1_000_000 / sample_rate as u64)
}

/// Receives one fixed-size block of mono float samples.
pub type BlockCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Receives asynchronous device failures (e.g. the mic was unplugged).
pub type DeviceErrorCallback = Box<dyn FnMut(DeviceError) + Send + 'static>;

/// Invoked exactly once when a chunk has finished playing.
pub type PlaybackDone = Box<dyn FnOnce() + Send + 'static>;

/// A microphone that delivers fixed-size blocks at a steady rate.
///
/// Implementations must never invoke `on_block` concurrently with itself.
pub trait CaptureDevice: Send {
    /// Begin delivering blocks. Calling `start` on a running device is an error.
    fn start(
        &mut self,
        on_block: BlockCallback,
        on_error: DeviceErrorCallback,
    ) -> Result<(), DeviceError>;

    /// Stop delivering blocks. Idempotent.
    fn stop(&mut self);
}

/// A speaker that plays one chunk at a time.
pub trait PlaybackDevice: Send {
    /// Play `chunk`, calling `on_done` exactly once when it has finished.
    ///
    /// Must not block for the duration of the chunk. If an error is returned
    /// `on_done` is dropped without being called.
    fn play(&mut self, chunk: AudioChunk, on_done: PlaybackDone) -> Result<(), DeviceError>;
}

/// Opens the devices for a session.
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, format: AudioFormat) -> Result<Box<dyn CaptureDevice>, DeviceError>;
    fn open_playback(&self, format: AudioFormat) -> Result<Box<dyn PlaybackDevice>, DeviceError>;

    /// Open both devices; a session needs the pair or nothing.
    fn open_devices(&self, format: AudioFormat) -> Result<SessionDevices, DeviceError> {
        let capture = self.open_capture(format)?;
        let playback = self.open_playback(format)?;
        Ok(SessionDevices { capture, playback })
    }
}

/// The capture and playback devices acquired for one session
pub struct SessionDevices {
    pub capture: Box<dyn CaptureDevice>,
    pub playback: Box<dyn PlaybackDevice>,
}

impl std::fmt::Debug for SessionDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDevices").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format() {
        let format = AudioFormat::default();
        assert_eq!(format.sample_rate, 24_000);
        assert_eq!(format.block_size, 4096);
        // 4096 / 24000 s = 170.666 ms
        assert_eq!(format.block_duration().as_millis(), 170);
    }

    #[test]
    fn test_samples_duration() {
        assert_eq!(samples_duration(2400, 24_000), Duration::from_millis(100));
        assert_eq!(samples_duration(0, 24_000), Duration::ZERO);
        assert_eq!(samples_duration(100, 0), Duration::ZERO);
    }

    #[test]
    fn test_device_error_display() {
        assert!(DeviceError::NoInputDevice.to_string().contains("input"));
        let err = DeviceError::StreamFailed("unplugged".to_string());
        assert!(err.to_string().contains("unplugged"));
    }
}
