//! Stage 1: the single task that assigns leaf indexes.
//!
//! Exactly one task mutates `next_index`. Entries pool up until the pool
//! hits the batch cap or the flush timer fires; the timer flushes even an
//! empty pool so stage 2 refreshes the tree head at a bounded cadence.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use ct_core::{LogEntry, UnsequencedEntry};

use crate::now_ms;

/// Pool cap, matching the 255 leaves a batch can add without outgrowing
/// two data tiles.
pub const MAX_POOL_SIZE: usize = 255;

/// Stage-0 → stage-1 queue depth.
pub const SUBMISSION_QUEUE_DEPTH: usize = 256;
/// Stage-1 → stage-2 queue depth.
pub const BATCH_QUEUE_DEPTH: usize = 2;

/// A validated entry plus the one-shot channel its submitter is blocked on.
pub struct Submission {
    pub entry: UnsequencedEntry,
    pub done: oneshot::Sender<LogEntry>,
}

/// A sequenced entry travelling to stage 2.
pub struct SequencedSubmission {
    pub entry: LogEntry,
    pub done: oneshot::Sender<LogEntry>,
}

pub type Batch = Vec<SequencedSubmission>;

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub flush_interval: Duration,
}

/// Spawns the sequencer task. Returns the submission sender for stage 0
/// and the batch receiver for stage 2.
pub fn spawn(
    start_index: u64,
    config: SequencerConfig,
    shutdown: watch::Receiver<bool>,
) -> (
    mpsc::Sender<Submission>,
    mpsc::Receiver<Batch>,
    tokio::task::JoinHandle<()>,
) {
    let (submit_tx, submit_rx) = mpsc::channel(SUBMISSION_QUEUE_DEPTH);
    let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
    let handle = tokio::spawn(run(start_index, config, submit_rx, batch_tx, shutdown));
    (submit_tx, batch_rx, handle)
}

async fn run(
    start_index: u64,
    config: SequencerConfig,
    mut rx: mpsc::Receiver<Submission>,
    batch_tx: mpsc::Sender<Batch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_index = start_index;
    let mut pool: Batch = Vec::with_capacity(MAX_POOL_SIZE);
    let mut last_flush = Instant::now();

    info!(next_index, "sequencer started");
    loop {
        tokio::select! {
            item = rx.recv() => {
                let Some(Submission { entry, done }) = item else {
                    // Stage 0 is gone; push out what we have and stop.
                    flush(&mut pool, &batch_tx, &mut last_flush).await;
                    return;
                };
                let entry = entry.sequence(next_index, now_ms());
                next_index += 1;
                pool.push(SequencedSubmission { entry, done });

                if pool.len() >= MAX_POOL_SIZE
                    || last_flush.elapsed() >= config.flush_interval
                {
                    flush(&mut pool, &batch_tx, &mut last_flush).await;
                }
            }
            _ = tokio::time::sleep_until(last_flush + config.flush_interval) => {
                // An empty flush still reaches stage 2: tree head
                // freshness is bounded by the flush interval.
                flush(&mut pool, &batch_tx, &mut last_flush).await;
            }
            _ = shutdown.changed() => {
                info!(pending = pool.len(), "sequencer shutting down");
                flush(&mut pool, &batch_tx, &mut last_flush).await;
                return;
            }
        }
    }
}

async fn flush(pool: &mut Batch, batch_tx: &mpsc::Sender<Batch>, last_flush: &mut Instant) {
    let batch = std::mem::take(pool);
    debug!(entries = batch.len(), "flushing batch");
    // Blocking on a full stage-2 queue is the intended backpressure.
    let _ = batch_tx.send(batch).await;
    *last_flush = Instant::now();
}
