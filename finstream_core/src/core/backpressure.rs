//! # Producer Backpressure Policy
//!
//! Decides, from the fill state of an ingestor's bounded output queue, whether
//! the producing process must be killed. The policy holds no state of its own:
//! the caller supplies the current depth and how long the depth has stayed
//! above the high-water mark.
//!
//! Two conditions are fatal to a producer:
//!
//! - **Hard overflow**: the queue is at capacity.
//! - **Sustained pressure**: the queue has stayed above `high_water` for longer
//!   than the `sustained` window.
//!
//! Overflow is never fixed by dropping data; the producer is stopped instead.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Rejected policy parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("backpressure capacity must be greater than zero")]
    ZeroCapacity,
    #[error("high-water mark {high_water} must be above zero and below capacity {capacity}")]
    HighWaterOutOfRange { high_water: usize, capacity: usize },
    #[error("sustained-pressure window must be greater than zero")]
    ZeroSustainedWindow,
}

/// Why a producer must be killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KillReason {
    /// The output queue reached its capacity.
    HardOverflow { depth: usize, capacity: usize },
    /// The output queue stayed above the high-water mark for too long.
    SustainedPressure {
        depth: usize,
        high_water: usize,
        #[serde(serialize_with = "serialize_millis")]
        above_for: Duration,
    },
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillReason::HardOverflow { depth, capacity } => {
                write!(f, "hard overflow: depth {depth} reached capacity {capacity}")
            }
            KillReason::SustainedPressure {
                depth,
                high_water,
                above_for,
            } => write!(
                f,
                "sustained pressure: depth {depth} above high water {high_water} for {}ms",
                above_for.as_millis()
            ),
        }
    }
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureVerdict {
    Ok,
    Kill(KillReason),
}

impl BackpressureVerdict {
    pub fn is_kill(&self) -> bool {
        matches!(self, BackpressureVerdict::Kill(_))
    }
}

/// # Backpressure Policy
///
/// Validated thresholds for one output queue. Cheap to copy into every reader
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressurePolicy {
    capacity: usize,
    high_water: usize,
    sustained: Duration,
}

impl BackpressurePolicy {
    /// Builds a policy, enforcing `0 < high_water < capacity` and a non-zero window.
    pub fn new(capacity: usize, high_water: usize, sustained: Duration) -> Result<Self, PolicyError> {
        if capacity == 0 {
            return Err(PolicyError::ZeroCapacity);
        }
        if high_water == 0 || high_water >= capacity {
            return Err(PolicyError::HighWaterOutOfRange { high_water, capacity });
        }
        if sustained.is_zero() {
            return Err(PolicyError::ZeroSustainedWindow);
        }
        Ok(Self {
            capacity,
            high_water,
            sustained,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn sustained(&self) -> Duration {
        self.sustained
    }

    /// Evaluates the queue state observed just before an enqueue.
    pub fn evaluate(&self, depth: usize, above_high_water_for: Duration) -> BackpressureVerdict {
        if depth >= self.capacity {
            return BackpressureVerdict::Kill(KillReason::HardOverflow {
                depth,
                capacity: self.capacity,
            });
        }
        if depth > self.high_water && above_high_water_for > self.sustained {
            return BackpressureVerdict::Kill(KillReason::SustainedPressure {
                depth,
                high_water: self.high_water,
                above_for: above_high_water_for,
            });
        }
        BackpressureVerdict::Ok
    }
}
