//! Detection log replay.
//!
//! Each line of the log is one frame. A line is either a bare array of
//! detections (`[[x1, y1, x2, y2, conf], ...]`) or an object carrying an
//! optional frame image path next to the detections:
//!
//! ```text
//! {"frame": "frames/000123.jpg", "detections": [[100, 100, 140, 220, 0.9]]}
//! ```
//!
//! Blank lines are skipped. End of file is end of stream.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use crate::detect::backend::{DetectorBackend, DetectorOutput};
use crate::detect::result::Detection;
use crate::frame::Frame;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplayLine {
    Bare(Vec<Detection>),
    Framed {
        frame: Option<PathBuf>,
        #[serde(default)]
        detections: Vec<Detection>,
    },
}

pub struct ReplayBackend {
    path: PathBuf,
    base_dir: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl ReplayBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| anyhow!("failed to open detection log {}: {}", path.display(), e))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            path: path.to_path_buf(),
            base_dir,
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_frame(&self, frame_path: &Path) -> Option<Frame> {
        let resolved = if frame_path.is_absolute() {
            frame_path.to_path_buf()
        } else {
            self.base_dir.join(frame_path)
        };
        match Frame::open(&resolved) {
            Ok(frame) => Some(frame),
            Err(e) => {
                // Missing pixels only cost re-identification for this frame.
                log::warn!("replay line {}: {}", self.line_no, e);
                None
            }
        }
    }
}

impl DetectorBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn next_output(&mut self) -> Result<Option<DetectorOutput>> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(None);
            };
            self.line_no += 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ReplayLine = serde_json::from_str(&line).map_err(|e| {
                anyhow!(
                    "invalid detection log {} line {}: {}",
                    self.path.display(),
                    self.line_no,
                    e
                )
            })?;
            let output = match parsed {
                ReplayLine::Bare(detections) => DetectorOutput {
                    detections,
                    frame: None,
                },
                ReplayLine::Framed { frame, detections } => DetectorOutput {
                    frame: frame.as_deref().and_then(|p| self.load_frame(p)),
                    detections,
                },
            };
            return Ok(Some(output));
        }
    }
}
