//! Metrics collection for a live interview session
//!
//! Counters are plain atomics so the capture callback, the playback drain
//! loop and the transport pump can all update them without locking.
//! `snapshot()` gives a serializable copy for diagnostics and the end-of-session
//! summary.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Live counters for one session
#[derive(Debug)]
pub struct SessionMetrics {
    created_at: Instant,
    frames_sent: AtomicU64,
    blocks_dropped: AtomicU64,
    chunks_enqueued: AtomicU64,
    chunks_played: AtomicU64,
    chunks_discarded: AtomicU64,
    codec_errors: AtomicU64,
    turns_completed: AtomicU64,
    peak_queue_depth: AtomicUsize,
}

/// Point-in-time copy of [`SessionMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Milliseconds since the session was created
    pub uptime_ms: u64,
    /// Encoded frames handed to the transport
    pub frames_sent: u64,
    /// Capture blocks dropped because the outbound path could not take them
    pub blocks_dropped: u64,
    /// Decoded chunks appended to the playback queue
    pub chunks_enqueued: u64,
    /// Chunks played to completion (or until the hang guard fired)
    pub chunks_played: u64,
    /// Chunks dropped from the queue by a flush or teardown
    pub chunks_discarded: u64,
    /// Inbound payloads that failed to decode
    pub codec_errors: u64,
    /// Remote turns completed
    pub turns_completed: u64,
    /// Largest playback backlog observed
    pub peak_queue_depth: usize,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            frames_sent: AtomicU64::new(0),
            blocks_dropped: AtomicU64::new(0),
            chunks_enqueued: AtomicU64::new(0),
            chunks_played: AtomicU64::new(0),
            chunks_discarded: AtomicU64::new(0),
            codec_errors: AtomicU64::new(0),
            turns_completed: AtomicU64::new(0),
            peak_queue_depth: AtomicUsize::new(0),
        }
    }

    pub fn frame_sent(&self) -> u64 {
        self.frames_sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the running total so callers can rate-limit their logging
    pub fn block_dropped(&self) -> u64 {
        self.blocks_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn chunk_enqueued(&self, depth: usize) {
        self.chunks_enqueued.fetch_add(1, Ordering::Relaxed);
        self.peak_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn chunk_played(&self) {
        self.chunks_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_discarded(&self) {
        self.chunks_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn codec_error(&self) {
        self.codec_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_completed(&self) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_ms: self.created_at.elapsed().as_millis() as u64,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
            chunks_enqueued: self.chunks_enqueued.load(Ordering::Relaxed),
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
            chunks_discarded: self.chunks_discarded.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            peak_queue_depth: self.peak_queue_depth.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// One-line summary for the session log
    pub fn summary(&self) -> String {
        format!(
            "{} frames sent, {} blocks dropped, {} chunks played ({} discarded), {} turns, {} decode errors",
            self.frames_sent,
            self.blocks_dropped,
            self.chunks_played,
            self.chunks_discarded,
            self.turns_completed,
            self.codec_errors
        )
    }
}
