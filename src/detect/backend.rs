use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// One unit of detector output: the boxes for a frame, plus the frame itself
/// when the source can supply pixels.
#[derive(Default)]
pub struct DetectorOutput {
    pub detections: Vec<Detection>,
    pub frame: Option<Frame>,
}

/// Detector backend trait.
///
/// The counting core treats detection as an external capability: a backend
/// hands over boxes in pixel space and, optionally, the frame they came from.
/// An empty detection list is a valid answer meaning "nothing seen".
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Produce the next frame's detections.
    ///
    /// Returns `Ok(None)` at end of stream.
    fn next_output(&mut self) -> Result<Option<DetectorOutput>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
