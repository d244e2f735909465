use anyhow::{anyhow, Result};

use crate::detect::BBox;
use crate::frame::Frame;
use crate::reid::{Embedding, FeatureExtractor};

const BINS_PER_CHANNEL: usize = 8;

/// Colour-histogram appearance features.
///
/// 8 bins per RGB channel over the cropped person region, 24 values,
/// L2-normalized. Cheap and model-free; coarse enough that clothing colour
/// dominates the match.
#[derive(Default)]
pub struct HistogramExtractor;

impl HistogramExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl FeatureExtractor for HistogramExtractor {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn extract(&mut self, frame: &Frame, bbox: &BBox) -> Result<Embedding> {
        let crop = frame
            .crop(bbox)
            .ok_or_else(|| anyhow!("person region outside frame"))?;

        let mut hist = vec![0f32; BINS_PER_CHANNEL * 3];
        for pixel in crop.pixels() {
            for (channel, value) in pixel.0.iter().enumerate() {
                let bin = (*value as usize * BINS_PER_CHANNEL) / 256;
                hist[channel * BINS_PER_CHANNEL + bin] += 1.0;
            }
        }
        Embedding::new(hist)
    }
}
