use anyhow::Result;
use std::collections::VecDeque;

use crate::detect::backend::{DetectorBackend, DetectorOutput};
use crate::detect::result::Detection;

/// Stub backend for tests and demos. Plays back a fixed per-frame script.
pub struct ScriptedBackend {
    frames: VecDeque<Vec<Detection>>,
}

impl ScriptedBackend {
    pub fn new(frames: Vec<Vec<Detection>>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn next_output(&mut self) -> Result<Option<DetectorOutput>> {
        Ok(self.frames.pop_front().map(|detections| DetectorOutput {
            detections,
            frame: None,
        }))
    }
}
