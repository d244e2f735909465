use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::CounterError;

/// Axis-aligned bounding box in pixel space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn centroid(&self) -> Centroid {
        Centroid {
            x: (self.x1 + self.x2) / 2.0,
            y: (self.y1 + self.y2) / 2.0,
        }
    }

    /// Non-finite coordinates or zero/negative area.
    pub fn is_degenerate(&self) -> bool {
        let finite = [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite());
        !finite || self.width() <= 0.0 || self.height() <= 0.0
    }
}

/// Tracked position of an object (center of its box).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub x: f32,
    pub y: f32,
}

impl Centroid {
    pub fn distance(&self, other: &Centroid) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// One detector output box.
///
/// On the wire a detection is the 5-tuple `[x1, y1, x2, y2, confidence]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 5]", into = "[f32; 5]")]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            bbox: BBox::new(x1, y1, x2, y2),
            confidence,
        }
    }

    pub fn centroid(&self) -> Centroid {
        self.bbox.centroid()
    }

    pub fn validate(&self) -> Result<()> {
        if self.bbox.is_degenerate() {
            return Err(CounterError::InvalidDetection(format!(
                "degenerate box ({}, {}, {}, {})",
                self.bbox.x1, self.bbox.y1, self.bbox.x2, self.bbox.y2
            ))
            .into());
        }
        let c = self.centroid();
        if !c.x.is_finite() || !c.y.is_finite() {
            return Err(CounterError::InvalidDetection(format!(
                "box ({}, {}, {}, {}) has no finite centre",
                self.bbox.x1, self.bbox.y1, self.bbox.x2, self.bbox.y2
            ))
            .into());
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(CounterError::InvalidDetection(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            ))
            .into());
        }
        Ok(())
    }
}

impl From<[f32; 5]> for Detection {
    fn from(raw: [f32; 5]) -> Self {
        Detection::new(raw[0], raw[1], raw[2], raw[3], raw[4])
    }
}

impl From<Detection> for [f32; 5] {
    fn from(det: Detection) -> Self {
        [
            det.bbox.x1,
            det.bbox.y1,
            det.bbox.x2,
            det.bbox.y2,
            det.confidence,
        ]
    }
}

/// Boundary filter applied to raw detector output before tracking.
#[derive(Clone, Copy, Debug)]
pub struct DetectionFilter {
    pub conf_threshold: f32,
    pub min_width: f32,
    pub min_height: f32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            conf_threshold: 0.4,
            min_width: 30.0,
            min_height: 60.0,
        }
    }
}

impl DetectionFilter {
    /// Keeps well-formed detections that pass the confidence and size gates.
    ///
    /// Malformed boxes are logged and dropped; they never reach the tracker.
    pub fn apply(&self, detections: &[Detection]) -> Vec<Detection> {
        detections
            .iter()
            .filter(|det| match det.validate() {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("detection rejected: {}", e);
                    false
                }
            })
            .filter(|det| det.confidence >= self.conf_threshold)
            .filter(|det| det.bbox.width() > self.min_width && det.bbox.height() > self.min_height)
            .copied()
            .collect()
    }

    /// [`apply`](Self::apply), then drop boxes centred outside a
    /// `width x height` frame.
    pub fn apply_within(&self, detections: &[Detection], width: f32, height: f32) -> Vec<Detection> {
        let mut kept = self.apply(detections);
        kept.retain(|det| {
            let c = det.centroid();
            let inside = (0.0..=width).contains(&c.x) && (0.0..=height).contains(&c.y);
            if !inside {
                log::warn!(
                    "detection rejected: centre ({}, {}) outside {}x{} frame",
                    c.x,
                    c.y,
                    width,
                    height
                );
            }
            inside
        });
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_parses_from_tuple() {
        let det: Detection = serde_json::from_str("[100, 100, 140, 220, 0.9]").unwrap();
        assert_eq!(det.bbox, BBox::new(100.0, 100.0, 140.0, 220.0));
        assert_eq!(det.centroid(), Centroid { x: 120.0, y: 160.0 });
    }

    #[test]
    fn degenerate_boxes_are_rejected() {
        assert!(Detection::new(10.0, 10.0, 10.0, 50.0, 0.9).validate().is_err());
        assert!(Detection::new(10.0, 60.0, 40.0, 20.0, 0.9).validate().is_err());
        assert!(Detection::new(f32::NAN, 0.0, 40.0, 20.0, 0.9)
            .validate()
            .is_err());
        assert!(Detection::new(0.0, 0.0, 40.0, 80.0, 1.5).validate().is_err());
        assert!(Detection::new(0.0, 0.0, 40.0, 80.0, 0.5).validate().is_ok());
    }

    #[test]
    fn box_with_overflowing_centre_is_rejected() {
        // Finite corners and positive area, but x1 + x2 overflows f32.
        let det = Detection::new(-3.0e38, 0.0, -2.9e38, 100.0, 0.9);
        assert!(det.bbox.width() > 0.0);
        let err = det.validate().unwrap_err();
        assert!(err.to_string().contains("no finite centre"));
    }

    #[test]
    fn filter_drops_boxes_centred_outside_the_frame() {
        let filter = DetectionFilter::default();
        let kept = filter.apply_within(
            &[
                Detection::new(100.0, 100.0, 140.0, 220.0, 0.9),
                Detection::new(5_000.0, 100.0, 5_040.0, 220.0, 0.9),
                Detection::new(-1.2e38, 100.0, -0.8e38, 220.0, 0.9),
                Detection::new(100.0, 900.0, 140.0, 1_020.0, 0.9),
            ],
            300.0,
            240.0,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox.x1, 100.0);

        // Unknown height only bounds x.
        let kept = filter.apply_within(
            &[Detection::new(100.0, 900.0, 140.0, 1_020.0, 0.9)],
            300.0,
            f32::INFINITY,
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn filter_drops_small_and_unconfident_boxes() {
        let filter = DetectionFilter::default();
        let kept = filter.apply(&[
            Detection::new(0.0, 0.0, 40.0, 100.0, 0.9),
            Detection::new(0.0, 0.0, 20.0, 100.0, 0.9),
            Detection::new(0.0, 0.0, 40.0, 100.0, 0.2),
            Detection::new(5.0, 5.0, 5.0, 5.0, 0.9),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox.x2, 40.0);
    }
}
