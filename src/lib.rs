//! Visitor counter core.
//!
//! This crate turns a per-frame stream of detector boxes into deduplicated
//! visitor counts.
//!
//! # Architecture
//!
//! Per frame, in a single thread:
//!
//! 1. **Detections** arrive from an external detector (`detect`).
//! 2. **Tracking** (`tracker`) assigns them to live objects by greedy
//!    nearest-centroid matching and drives each object's lifecycle
//!    (New -> Scanned -> Exited).
//! 3. **Counting** (`counter`) watches each object's side of a vertical line
//!    and fires exactly once per Right -> Left crossing.
//! 4. **Persistence** (`storage`) appends count events and retired tracks.
//!
//! Person re-identification (`reid`) lets the tracker recognise someone who
//! left and came back under a new track id, so they are not counted twice.
//! A status board (`status`) publishes read-only snapshots for the API thread.
//!
//! # Module Structure
//!
//! - `detect`: detection types, boundary filtering, detector backends
//! - `frame`: frame pixels for re-identification crops
//! - `reid`: feature extractor trait, embedding gallery
//! - `tracker`: object tracker and greedy assignment
//! - `counter`: line crossing counter
//! - `storage`: count event store, durable sink with retries
//! - `engine`: per-frame pipeline tying the above together
//! - `status`, `api`, `export`, `config`: host-facing surfaces

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod counter;
pub mod detect;
pub mod engine;
pub mod export;
pub mod frame;
pub mod reid;
pub mod status;
pub mod storage;
pub mod tracker;

pub use counter::{CountEvent, CountStats, Direction, LineCounter, Side};
pub use detect::{
    BBox, Centroid, Detection, DetectionFilter, DetectorBackend, DetectorOutput, ReplayBackend,
    ScriptedBackend,
};
pub use engine::{CountingEngine, EngineConfig, FrameReport};
pub use export::{ExportArtifact, ExportSummary, Exporter};
pub use frame::Frame;
pub use reid::{EmbeddingGallery, Embedding, FeatureExtractor, HistogramExtractor, Identity};
pub use status::{ActiveObject, StatusBoard, StatusHandle, StatusSnapshot};
pub use storage::{
    DurableSink, EventStore, InMemoryEventStore, RetryPolicy, SqliteEventStore, StoredEvent,
    TrackRecord,
};
pub use tracker::{ObjectState, TrackedObject, Tracker, TrackerConfig};

/// Track id: process-unique, monotonically increasing, never reused.
pub type ObjectId = u64;

/// Person id from the embedding gallery, sequential from 1.
pub type PersonId = u64;

// -------------------- Errors --------------------

/// Failures callers need to tell apart. Carried inside `anyhow::Error`;
/// recover with `err.downcast_ref::<CounterError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterError {
    /// Status was queried before the first frame was published.
    NotReady,
    /// An export artifact was requested before any export ran.
    NoDataYet,
    /// A detection failed boundary validation.
    InvalidDetection(String),
}

impl std::fmt::Display for CounterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterError::NotReady => write!(f, "counter not ready: no frame processed yet"),
            CounterError::NoDataYet => write!(f, "no data yet: export has not been written"),
            CounterError::InvalidDetection(msg) => write!(f, "invalid detection: {}", msg),
        }
    }
}

impl std::error::Error for CounterError {}

// -------------------- Clock --------------------

/// Wall clock in floating-point unix seconds.
///
/// Timeouts are measured against this, so tests can drive them with
/// [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start_s: f64) -> Self {
        Self {
            bits: AtomicU64::new(start_s.to_bits()),
        }
    }

    pub fn set(&self, now_s: f64) {
        self.bits.store(now_s.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let now = self.now();
        self.set(now + by.as_secs_f64());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100.0);
        clock.advance(Duration::from_millis(1500));
        assert!((clock.now() - 101.5).abs() < 1e-9);
    }

    #[test]
    fn counter_error_survives_anyhow() {
        let err: anyhow::Error = CounterError::NotReady.into();
        assert_eq!(err.downcast_ref::<CounterError>(), Some(&CounterError::NotReady));
    }
}
