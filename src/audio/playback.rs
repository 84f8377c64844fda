//! Ordered playback of inbound audio
//!
//! Inbound frames are decoded into [`AudioChunk`]s and appended to the
//! [`PlaybackQueue`]. A single drain task owns the playback device and plays
//! chunks strictly in enqueue order, waiting for each chunk's completion
//! signal before starting the next.
//!
//! ```text
//! transport task ──enqueue──▶ unbounded channel ──▶ drain task ──▶ PlaybackDevice
//!                                                      ▲                 │
//!                                                      └── on_done ──────┘
//! ```
//!
//! `enqueue` never blocks and never rejects: the soft capacity only drives a
//! warning. A flush bumps a generation counter; the drain task skips every
//! chunk stamped with an older generation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::{samples_duration, PlaybackDevice, PlaybackDone};
use crate::metrics::SessionMetrics;

/// Extra time allowed past a chunk's length before giving up on its completion signal
const COMPLETION_GRACE: Duration = Duration::from_secs(2);

/// A decoded chunk of mono playback audio
#[derive(Debug, Clone)]
pub struct AudioChunk {
    samples: Vec<f32>,
    sample_rate: u32,
    sequence: u64,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            sequence,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Position in the inbound stream, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }
}

struct QueuedChunk {
    chunk: AudioChunk,
    generation: u64,
}

struct QueueShared {
    depth: AtomicUsize,
    generation: AtomicU64,
    metrics: Arc<SessionMetrics>,
}

/// FIFO of chunks awaiting playback, consumed by a single drain task.
pub struct PlaybackQueue {
    tx: Option<mpsc::UnboundedSender<QueuedChunk>>,
    shared: Arc<QueueShared>,
    sample_rate: u32,
    soft_capacity: usize,
    next_sequence: u64,
    over_capacity: bool,
}

impl PlaybackQueue {
    /// Spawn the drain task on the current tokio runtime.
    ///
    /// `on_drained` is awaited once, after the drain task has stopped
    /// (either because [`finish`](Self::finish) let the backlog run out or
    /// because [`discard`](Self::discard) dropped it).
    pub fn start<F>(
        device: Box<dyn PlaybackDevice>,
        sample_rate: u32,
        soft_capacity: usize,
        metrics: Arc<SessionMetrics>,
        on_drained: F,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared {
            depth: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            metrics,
        });

        tokio::spawn(drain_loop(rx, device, shared.clone(), on_drained));

        log::info!(
            "PlaybackQueue: drain loop started ({}Hz, soft capacity {} chunks)",
            sample_rate,
            soft_capacity
        );

        Self {
            tx: Some(tx),
            shared,
            sample_rate,
            soft_capacity,
            next_sequence: 0,
            over_capacity: false,
        }
    }

    /// Append decoded samples to the tail of the queue.
    ///
    /// Returns the chunk's sequence number, or `None` if the queue no longer
    /// accepts audio (finished or discarded).
    pub fn enqueue(&mut self, samples: Vec<f32>) -> Option<u64> {
        let tx = self.tx.as_ref()?;

        let sequence = self.next_sequence;
        let chunk = AudioChunk::new(samples, self.sample_rate, sequence);
        let generation = self.shared.generation.load(Ordering::SeqCst);

        let depth = self.shared.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if tx.send(QueuedChunk { chunk, generation }).is_err() {
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            log::warn!("PlaybackQueue: drain loop is gone, dropping chunk {}", sequence);
            return None;
        }

        self.next_sequence += 1;
        self.shared.metrics.chunk_enqueued(depth);

        if depth > self.soft_capacity && !self.over_capacity {
            self.over_capacity = true;
            log::warn!(
                "PlaybackQueue: backlog of {} chunks exceeds soft capacity {}",
                depth,
                self.soft_capacity
            );
        } else if depth <= self.soft_capacity / 2 {
            self.over_capacity = false;
        }

        Some(sequence)
    }

    /// Drop every chunk queued so far. The chunk currently playing finishes.
    pub fn flush(&self) {
        let previous = self.shared.generation.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "PlaybackQueue: flushed generation {} ({} chunks pending)",
            previous,
            self.len()
        );
    }

    /// Stop accepting audio; the drain task plays the backlog then exits.
    pub fn finish(&mut self) {
        if self.tx.take().is_some() {
            log::debug!("PlaybackQueue: finishing, {} chunks left", self.len());
        }
    }

    /// Stop accepting audio and drop the backlog; the drain task exits after
    /// the current chunk.
    pub fn discard(&mut self) {
        self.flush();
        self.finish();
    }

    /// Chunks waiting to be played (excluding the one playing now)
    pub fn len(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        // Never leave a drain task playing into a torn-down session
        self.discard();
    }
}

async fn drain_loop<F>(
    mut rx: mpsc::UnboundedReceiver<QueuedChunk>,
    mut device: Box<dyn PlaybackDevice>,
    shared: Arc<QueueShared>,
    on_drained: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    while let Some(QueuedChunk { chunk, generation }) = rx.recv().await {
        shared.depth.fetch_sub(1, Ordering::SeqCst);

        if generation < shared.generation.load(Ordering::SeqCst) {
            shared.metrics.chunk_discarded();
            continue;
        }

        let sequence = chunk.sequence();
        let deadline = chunk.duration() + COMPLETION_GRACE;

        let (done_tx, done_rx) = oneshot::channel();
        let on_done: PlaybackDone = Box::new(move || {
            let _ = done_tx.send(());
        });

        if let Err(e) = device.play(chunk, on_done) {
            log::warn!("PlaybackQueue: failed to play chunk {}: {}", sequence, e);
            continue;
        }

        match tokio::time::timeout(deadline, done_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                log::warn!(
                    "PlaybackQueue: device dropped completion for chunk {}",
                    sequence
                );
            }
            Err(_) => {
                log::warn!(
                    "PlaybackQueue: no completion for chunk {} after {:?}, moving on",
                    sequence,
                    deadline
                );
            }
        }
        shared.metrics.chunk_played();
    }

    log::debug!("PlaybackQueue: drain loop exiting");
    on_drained.await;
}
