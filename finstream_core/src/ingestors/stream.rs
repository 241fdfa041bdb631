//! # Ingestor Stream Tasks
//!
//! Every supervised process gets four tasks:
//!
//! - **reader**: reads stdout lines into the bounded output queue, evaluating
//!   the backpressure policy before every enqueue;
//! - **pipeline**: drains the queue, parses lines, feeds ticks to the arena and
//!   the fan-out sink, re-emits log records and counts malformed lines;
//! - **stderr**: logs free-form stderr text at `debug`;
//! - **waiter**: owns the child, forwards terminate/kill requests and reports
//!   the exit.
//!
//! The tasks only report outcomes; the supervisor decides what they mean.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::process::{ChildOutput, IngestorChild, ProcessExit};
use crate::core::arena::ArenaHandle;
use crate::core::backpressure::{BackpressurePolicy, BackpressureVerdict, KillReason};
use crate::core::dispatcher::TickSink;
use crate::core::tick::{parse_line, IngestorLine, Tick};

/// Malformed lines are logged on the first occurrence and then every this many.
const MALFORMED_LOG_EVERY: u64 = 100;

/// Tracks how long a queue has stayed above its high-water mark.
#[derive(Debug, Default, Clone, Copy)]
pub struct HighWaterClock {
    above_since: Option<Instant>,
}

impl HighWaterClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the depth seen at `now`; returns the time spent continuously
    /// above `high_water`, zero once the depth falls back to it.
    pub fn observe(&mut self, depth: usize, high_water: usize, now: Instant) -> Duration {
        if depth > high_water {
            let since = *self.above_since.get_or_insert(now);
            now.saturating_duration_since(since)
        } else {
            self.above_since = None;
            Duration::ZERO
        }
    }
}

/// Counters shared between an ingestor's tasks and the supervisor's views.
#[derive(Debug, Default)]
pub struct StreamStats {
    depth: AtomicUsize,
    ticks: AtomicU64,
    malformed: AtomicU64,
}

impl StreamStats {
    /// Output queue depth as of the last enqueue.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// One stdout line, stamped when it was read.
#[derive(Debug, Clone)]
pub struct RawLine {
    pub line: String,
    pub received_at: DateTime<Utc>,
}

/// Why the reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderOutcome {
    /// stdout closed or failed.
    Eof,
    /// The policy returned `Kill`.
    Overflow(KillReason),
    /// The asset's token was cancelled, or the pipeline is gone.
    Stopped,
}

/// Reads stdout into `queue` until EOF, overflow or cancellation.
pub async fn run_reader(
    asset_id: String,
    stdout: ChildOutput,
    queue: mpsc::Sender<RawLine>,
    policy: BackpressurePolicy,
    stats: Arc<StreamStats>,
    cancel: CancellationToken,
) -> ReaderOutcome {
    let mut reader = BufReader::new(stdout);
    let mut clock = HighWaterClock::new();
    let mut buf = Vec::with_capacity(512);

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return ReaderOutcome::Stopped,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => return ReaderOutcome::Eof,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(asset = %asset_id, error = %e, "ingestor stdout read failed");
                return ReaderOutcome::Eof;
            }
        }
        let received_at = Utc::now();
        let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
        if line.trim().is_empty() {
            continue;
        }

        let depth = queue.max_capacity() - queue.capacity();
        let above_for = clock.observe(depth, policy.high_water(), Instant::now());
        if let BackpressureVerdict::Kill(reason) = policy.evaluate(depth, above_for) {
            stats.depth.store(depth, Ordering::Relaxed);
            return ReaderOutcome::Overflow(reason);
        }

        match queue.try_send(RawLine { line, received_at }) {
            Ok(()) => stats.depth.store(depth + 1, Ordering::Relaxed),
            Err(TrySendError::Full(_)) => {
                return ReaderOutcome::Overflow(KillReason::HardOverflow {
                    depth: queue.max_capacity(),
                    capacity: policy.capacity(),
                });
            }
            Err(TrySendError::Closed(_)) => return ReaderOutcome::Stopped,
        }
    }
}

/// Drains `queue`, applying ticks in stream order.
#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline(
    asset_id: String,
    generation: u64,
    mut queue: mpsc::Receiver<RawLine>,
    arena: ArenaHandle,
    sink: Arc<dyn TickSink>,
    tz: Tz,
    stats: Arc<StreamStats>,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            raw = queue.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };
        stats.depth.store(queue.len(), Ordering::Relaxed);

        match parse_line(&asset_id, &raw.line, raw.received_at, tz) {
            Ok(IngestorLine::Tick(tick)) => {
                stats.ticks.fetch_add(1, Ordering::Relaxed);
                let tick = Arc::new(tick);
                arena.apply(Tick::clone(&*tick), generation);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sink.deliver(tick) => {}
                }
            }
            Ok(IngestorLine::Log(record)) => record.emit(&asset_id),
            Err(e) => {
                let count = stats.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                if count == 1 || count % MALFORMED_LOG_EVERY == 0 {
                    tracing::warn!(asset = %asset_id, malformed = count, error = %e, "malformed ingestor line dropped");
                } else {
                    tracing::debug!(asset = %asset_id, error = %e, "malformed ingestor line dropped");
                }
            }
        }
    }
    tracing::trace!(asset = %asset_id, generation, "pipeline stopped");
}

/// Logs stderr lines until EOF or cancellation.
pub async fn run_stderr(asset_id: String, stderr: ChildOutput, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => tracing::debug!(target: "ingestor", asset = %asset_id, "stderr: {line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(asset = %asset_id, error = %e, "ingestor stderr read failed");
                break;
            }
        }
    }
}

/// Requests forwarded to the waiter, which owns the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildControl {
    Terminate,
    Kill,
}

/// Owns `child` until it exits. A closed control channel kills it.
pub async fn run_waiter(
    asset_id: String,
    mut child: Box<dyn IngestorChild>,
    mut control: mpsc::UnboundedReceiver<ChildControl>,
) -> std::io::Result<ProcessExit> {
    let mut control_open = true;
    loop {
        if !control_open {
            return child.wait().await;
        }
        let request = tokio::select! {
            exit = child.wait() => return exit,
            request = control.recv() => request,
        };
        let sent = match request {
            Some(ChildControl::Terminate) => child.terminate(),
            Some(ChildControl::Kill) => child.kill(),
            None => {
                control_open = false;
                child.kill()
            }
        };
        if let Err(e) = sent {
            tracing::warn!(asset = %asset_id, ?request, error = %e, "failed to signal ingestor process");
        }
    }
}
