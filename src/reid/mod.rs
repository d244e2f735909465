//! Person re-identification.
//!
//! Feature extraction is an injected capability ([`FeatureExtractor`]); this
//! module owns only the gallery protocol the tracker relies on: one
//! running-average embedding per person, sequential person ids, and a
//! track id -> person id mapping that never changes once assigned.

mod histogram;

pub use histogram::HistogramExtractor;

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};

use crate::detect::BBox;
use crate::frame::Frame;
use crate::{ObjectId, PersonId};

/// Weight kept from the stored embedding on each re-identification.
pub const GALLERY_KEEP_WEIGHT: f32 = 0.7;
/// Weight given to the fresh observation.
pub const GALLERY_NEW_WEIGHT: f32 = 0.3;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

/// Unit-length appearance feature vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Normalizes `values` to unit length.
    ///
    /// Rejects empty, non-finite, and zero-norm vectors: those are what a
    /// failed extraction looks like, and they must not enter the gallery.
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(anyhow!("embedding is empty"));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("embedding contains non-finite values"));
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(anyhow!("embedding has zero norm"));
        }
        Ok(Self(values.into_iter().map(|v| v / norm).collect()))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cosine similarity clamped to [0, 1]. Mismatched lengths score 0.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        if self.len() != other.len() {
            return 0.0;
        }
        let dot: f32 = self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum();
        dot.clamp(0.0, 1.0)
    }

    /// `keep * self + (1 - keep) * other`, re-normalized.
    fn blend(&self, other: &Embedding) -> Result<Embedding> {
        if self.len() != other.len() {
            return Err(anyhow!(
                "embedding length mismatch ({} vs {})",
                self.len(),
                other.len()
            ));
        }
        let mixed = self
            .0
            .iter()
            .zip(&other.0)
            .map(|(old, new)| GALLERY_KEEP_WEIGHT * old + GALLERY_NEW_WEIGHT * new)
            .collect();
        Embedding::new(mixed)
    }
}

/// Appearance feature extractor supplied by the host.
pub trait FeatureExtractor: Send {
    fn name(&self) -> &'static str;

    /// Embedding for the region `bbox` of `frame`.
    fn extract(&mut self, frame: &Frame, bbox: &BBox) -> Result<Embedding>;

    /// Similarity in [0, 1].
    fn compare(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.cosine(b)
    }
}

/// Result of [`EmbeddingGallery::identify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    pub person_id: PersonId,
    pub is_new: bool,
}

pub struct EmbeddingGallery {
    extractor: Box<dyn FeatureExtractor>,
    similarity_threshold: f32,
    gallery: BTreeMap<PersonId, Embedding>,
    track_persons: HashMap<ObjectId, PersonId>,
    person_count: PersonId,
}

impl EmbeddingGallery {
    pub fn new(extractor: Box<dyn FeatureExtractor>, similarity_threshold: f32) -> Self {
        log::info!(
            "person re-identification enabled (extractor={}, threshold={:.2})",
            extractor.name(),
            similarity_threshold
        );
        Self {
            extractor,
            similarity_threshold,
            gallery: BTreeMap::new(),
            track_persons: HashMap::new(),
            person_count: 0,
        }
    }

    pub fn extract_features(&mut self, frame: &Frame, bbox: &BBox) -> Result<Embedding> {
        self.extractor.extract(frame, bbox)
    }

    /// Resolve the person behind `track_id`.
    ///
    /// A track already mapped keeps its person. Otherwise the crop is matched
    /// against every stored person; the best score strictly above the
    /// threshold wins and its embedding absorbs the new observation. With no
    /// match a new sequential person id is allocated.
    pub fn identify(&mut self, frame: &Frame, bbox: &BBox, track_id: ObjectId) -> Result<Identity> {
        if let Some(&person_id) = self.track_persons.get(&track_id) {
            return Ok(Identity {
                person_id,
                is_new: false,
            });
        }

        let features = self.extractor.extract(frame, bbox)?;

        let mut best: Option<(PersonId, f32)> = None;
        for (&person_id, stored) in &self.gallery {
            let score = self.extractor.compare(&features, stored);
            if best.map_or(score > 0.0, |(_, best_score)| score > best_score) {
                best = Some((person_id, score));
            }
        }

        if let Some((person_id, score)) = best {
            if score > self.similarity_threshold {
                self.absorb(person_id, &features);
                self.track_persons.insert(track_id, person_id);
                log::debug!(
                    "track {} re-identified as person {} (similarity {:.3})",
                    track_id,
                    person_id,
                    score
                );
                return Ok(Identity {
                    person_id,
                    is_new: false,
                });
            }
        }

        self.person_count += 1;
        let person_id = self.person_count;
        self.gallery.insert(person_id, features);
        self.track_persons.insert(track_id, person_id);
        log::debug!("track {} registered as new person {}", track_id, person_id);
        Ok(Identity {
            person_id,
            is_new: true,
        })
    }

    /// Fold a fresh observation of `person_id` into its stored embedding.
    ///
    /// Unknown person ids are ignored.
    pub fn update_gallery(&mut self, person_id: PersonId, frame: &Frame, bbox: &BBox) -> Result<()> {
        if !self.gallery.contains_key(&person_id) {
            return Ok(());
        }
        let features = self.extractor.extract(frame, bbox)?;
        self.absorb(person_id, &features);
        Ok(())
    }

    pub fn person_for_track(&self, track_id: ObjectId) -> Option<PersonId> {
        self.track_persons.get(&track_id).copied()
    }

    pub fn embedding(&self, person_id: PersonId) -> Option<&Embedding> {
        self.gallery.get(&person_id)
    }

    pub fn len(&self) -> usize {
        self.gallery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }

    fn absorb(&mut self, person_id: PersonId, features: &Embedding) {
        let Some(stored) = self.gallery.get(&person_id) else {
            return;
        };
        match stored.blend(features) {
            Ok(updated) => {
                self.gallery.insert(person_id, updated);
            }
            Err(e) => log::warn!("gallery update for person {} skipped: {}", person_id, e),
        }
    }
}
