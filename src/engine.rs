//! Per-frame counting pipeline.
//!
//! `process_frame` runs, in order: detection filtering, tracker update,
//! the periodic exit sweep, line evaluation, event delivery, the track log,
//! and finally a status publish. A failing frame is reported to the caller
//! and the next frame starts from whatever state the tracker is in.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::counter::{CountEvent, CountStats, LineCounter};
use crate::detect::{Detection, DetectionFilter};
use crate::frame::Frame;
use crate::reid::{EmbeddingGallery, FeatureExtractor, DEFAULT_SIMILARITY_THRESHOLD};
use crate::status::{StatusBoard, StatusHandle, StatusSnapshot};
use crate::storage::{DurableSink, EventStore, RetryPolicy, TrackRecord};
use crate::tracker::{Tracker, TrackerConfig};
use crate::{Clock, ObjectId};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub filter: DetectionFilter,
    pub tracker: TrackerConfig,
    /// Used with `line_position` to place the counting line.
    pub frame_width: u32,
    /// Counting line as a fraction of frame width.
    pub line_position: f32,
    pub counting_enabled: bool,
    pub exit_check_interval: Duration,
    pub reid_threshold: f32,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            filter: DetectionFilter::default(),
            tracker: TrackerConfig::default(),
            frame_width: 640,
            line_position: 0.5,
            counting_enabled: true,
            exit_check_interval: Duration::from_secs(1),
            reid_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Crossings counted on this frame.
    pub events: Vec<CountEvent>,
    /// Tracks retired by the exit sweep, if it ran.
    pub exited: Vec<ObjectId>,
    /// Tracks removed from the live set for any reason.
    pub departed: usize,
    pub held_events: usize,
}

pub struct CountingEngine {
    cfg: EngineConfig,
    clock: Arc<dyn Clock>,
    tracker: Tracker,
    counter: LineCounter,
    sink: DurableSink,
    board: StatusBoard,
    frames_processed: u64,
    last_exit_check: f64,
    drained: bool,
}

impl CountingEngine {
    /// `extractor` enables re-identification; pass `None` for geometry-only
    /// tracking.
    pub fn new(
        cfg: EngineConfig,
        store: Box<dyn EventStore>,
        clock: Arc<dyn Clock>,
        extractor: Option<Box<dyn FeatureExtractor>>,
    ) -> Self {
        let mut tracker = Tracker::new(cfg.tracker.clone(), clock.clone());
        if let Some(extractor) = extractor {
            tracker = tracker.with_gallery(EmbeddingGallery::new(extractor, cfg.reid_threshold));
        }
        let counter = LineCounter::at_fraction(cfg.line_position, cfg.frame_width, clock.clone());
        log::info!(
            "counting line at x={} (frame width {}), counting {}",
            counter.line_x(),
            cfg.frame_width,
            if cfg.counting_enabled { "enabled" } else { "disabled" }
        );
        let sink = DurableSink::new(store, cfg.retry);
        let last_exit_check = clock.now();
        Self {
            cfg,
            clock,
            tracker,
            counter,
            sink,
            board: StatusBoard::new(),
            frames_processed: 0,
            last_exit_check,
            drained: false,
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.board.handle()
    }

    pub fn stats(&self) -> CountStats {
        self.counter.stats()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn counter(&self) -> &LineCounter {
        &self.counter
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn held_events(&self) -> usize {
        self.sink.pending_len()
    }

    pub fn process_frame(
        &mut self,
        detections: &[Detection],
        frame: Option<&Frame>,
    ) -> Result<FrameReport> {
        if self.drained {
            return Err(anyhow!("counting engine already shut down"));
        }
        self.frames_processed += 1;
        let result = self.step(detections, frame);
        self.publish();
        result
    }

    fn step(&mut self, detections: &[Detection], frame: Option<&Frame>) -> Result<FrameReport> {
        let mut report = FrameReport {
            frame_index: self.frames_processed,
            ..FrameReport::default()
        };

        // Without pixels only the configured width is known.
        let (width, height) = match frame {
            Some(frame) => (frame.width() as f32, frame.height() as f32),
            None => (self.cfg.frame_width as f32, f32::INFINITY),
        };
        let accepted = self.cfg.filter.apply_within(detections, width, height);
        let tracked = self.tracker.update(&accepted, frame).map(|_| ());

        // Persist whatever left the live set even if the update failed part
        // way through.
        let departed = self.tracker.take_departed();
        report.departed += departed.len();
        for obj in &departed {
            self.sink.record_track(&TrackRecord::from(obj));
        }
        tracked.map_err(|e| anyhow!("frame {}: tracker update failed: {}", report.frame_index, e))?;

        let now = self.clock.now();
        if now - self.last_exit_check >= self.cfg.exit_check_interval.as_secs_f64() {
            self.last_exit_check = now;
            report.exited = self.tracker.check_for_exits();
            let departed = self.tracker.take_departed();
            report.departed += departed.len();
            for obj in &departed {
                self.sink.record_track(&TrackRecord::from(obj));
            }
        }

        if self.cfg.counting_enabled {
            report.events = self.counter.evaluate(&mut self.tracker);
        }
        for event in &report.events {
            self.sink.submit(event);
        }
        report.held_events = self.sink.pending_len();
        Ok(report)
    }

    /// Flush held events and retire every live track. Safe to call more than
    /// once and from every exit path; tracks are written only on the first
    /// call, while the flush is retried each time.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.drained {
            self.drained = true;
            let remaining = self.tracker.drain();
            log::info!(
                "shutting down: retiring {} live track(s), {} held event(s)",
                remaining.len(),
                self.sink.pending_len()
            );
            for obj in &remaining {
                self.sink.record_track(&TrackRecord::from(obj));
            }
        }
        let flushed = self.sink.flush();
        self.publish();
        flushed
    }

    fn publish(&self) {
        let snapshot = StatusSnapshot::capture(
            self.counter.stats(),
            &self.tracker,
            self.frames_processed,
            self.sink.pending_len(),
            self.clock.now(),
        );
        if let Err(e) = self.board.publish(snapshot) {
            log::error!("status publish failed: {}", e);
        }
    }
}
