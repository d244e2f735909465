//! Frame pixels handed to re-identification.
//!
//! The counting core never decodes video itself. A `Frame` is whatever image
//! the detector boundary supplied alongside its boxes; the tracker only needs
//! it to crop person regions for the feature extractor.

use anyhow::{anyhow, Result};
use image::{imageops, RgbImage};
use std::path::Path;

use crate::detect::BBox;

pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    /// Load a frame from an image file on disk.
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .map_err(|e| anyhow!("failed to load frame {}: {}", path.display(), e))?
            .to_rgb8();
        Ok(Self::new(image))
    }

    /// Solid-colour frame; handy for synthetic inputs.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    /// Crop the region under `bbox`, clamped to the frame.
    ///
    /// Returns `None` when the clamped region is empty.
    pub fn crop(&self, bbox: &BBox) -> Option<RgbImage> {
        let (w, h) = (self.width() as i64, self.height() as i64);
        if w == 0 || h == 0 {
            return None;
        }
        let x1 = (bbox.x1 as i64).max(0);
        let y1 = (bbox.y1 as i64).max(0);
        let x2 = (bbox.x2 as i64).min(w - 1);
        let y2 = (bbox.y2 as i64).min(h - 1);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        let view = imageops::crop_imm(
            &self.image,
            x1 as u32,
            y1 as u32,
            (x2 - x1) as u32,
            (y2 - y1) as u32,
        );
        Some(view.to_image())
    }
}
