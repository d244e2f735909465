//! Centroid object tracker.
//!
//! Keeps one [`TrackedObject`] per live track id, matches each frame's
//! detections to live objects with [`assignment::greedy_assign`], and drives
//! the per-object lifecycle:
//!
//! ```text
//!   New ──(line crossing | re-entry of a counted person)──> Scanned
//!   Scanned ──(disappeared too long | exit timeout)──> Exited
//! ```
//!
//! New objects that vanish are simply dropped. Every object removed from the
//! live set is queued in `departed` so the host can persist its record.

pub mod assignment;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::{BBox, Centroid, Detection};
use crate::frame::Frame;
use crate::reid::EmbeddingGallery;
use crate::{Clock, ObjectId, PersonId};

use assignment::greedy_assign;

pub const DEFAULT_MAX_DISAPPEARED: u32 = 40;
pub const DEFAULT_MAX_DISTANCE: f32 = 50.0;
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    New,
    Scanned,
    Exited,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::New => "new",
            ObjectState::Scanned => "scanned",
            ObjectState::Exited => "exited",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackedObject {
    pub id: ObjectId,
    pub centroid: Centroid,
    pub bbox: BBox,
    pub disappeared_frames: u32,
    /// Unix seconds.
    pub first_seen: f64,
    pub last_seen: f64,
    pub state: ObjectState,
    pub entry_time: Option<f64>,
    pub exit_time: Option<f64>,
    pub person_id: Option<PersonId>,
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Frames an object may go unmatched before it is deregistered.
    pub max_disappeared: u32,
    /// Largest centroid jump (pixels) still treated as the same object.
    pub max_distance: f32,
    /// Inactivity after which a Scanned object is considered gone.
    pub exit_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_disappeared: DEFAULT_MAX_DISAPPEARED,
            max_distance: DEFAULT_MAX_DISTANCE,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }
}

pub struct Tracker {
    cfg: TrackerConfig,
    clock: Arc<dyn Clock>,
    next_object_id: ObjectId,
    objects: BTreeMap<ObjectId, TrackedObject>,
    gallery: Option<EmbeddingGallery>,
    counted_persons: HashSet<PersonId>,
    departed: Vec<TrackedObject>,
}

impl Tracker {
    pub fn new(cfg: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            clock,
            next_object_id: 0,
            objects: BTreeMap::new(),
            gallery: None,
            counted_persons: HashSet::new(),
            departed: Vec::new(),
        }
    }

    /// Enable person re-identification.
    pub fn with_gallery(mut self, gallery: EmbeddingGallery) -> Self {
        self.gallery = Some(gallery);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.cfg
    }

    pub fn reid_enabled(&self) -> bool {
        self.gallery.is_some()
    }

    pub fn gallery(&self) -> Option<&EmbeddingGallery> {
        self.gallery.as_ref()
    }

    /// Live objects in id order.
    pub fn objects(&self) -> &BTreeMap<ObjectId, TrackedObject> {
        &self.objects
    }

    pub fn get(&self, id: ObjectId) -> Option<&TrackedObject> {
        self.objects.get(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn counted_persons(&self) -> &HashSet<PersonId> {
        &self.counted_persons
    }

    /// True when the object's person has already been counted in an earlier
    /// lifetime. Always false without re-identification.
    pub fn is_already_counted(&self, id: ObjectId) -> bool {
        self.objects
            .get(&id)
            .and_then(|obj| obj.person_id)
            .is_some_and(|person| self.counted_persons.contains(&person))
    }

    /// Drain records of objects removed from the live set since the last call.
    pub fn take_departed(&mut self) -> Vec<TrackedObject> {
        std::mem::take(&mut self.departed)
    }

    /// Advance the tracker by one frame.
    ///
    /// Call exactly once per processed frame: disappearance bookkeeping is
    /// per call, so a second call with the same detections would age every
    /// unmatched object twice.
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame: Option<&Frame>,
    ) -> Result<&BTreeMap<ObjectId, TrackedObject>> {
        let detections: Vec<Detection> = detections
            .iter()
            .filter(|det| match det.validate() {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("tracker: {}", e);
                    false
                }
            })
            .copied()
            .collect();

        if !detections.is_empty() && self.objects.len() > 2 * detections.len() {
            self.shed_stalest_half();
        }

        if detections.is_empty() {
            let ids: Vec<ObjectId> = self.objects.keys().copied().collect();
            for id in ids {
                self.mark_disappeared(id);
            }
            return Ok(&self.objects);
        }

        if self.objects.is_empty() {
            for det in &detections {
                self.register(det.bbox, frame)?;
            }
            return Ok(&self.objects);
        }

        let object_ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        let object_centroids: Vec<Centroid> =
            self.objects.values().map(|obj| obj.centroid).collect();
        let input_centroids: Vec<Centroid> = detections.iter().map(|d| d.centroid()).collect();

        let assignment = greedy_assign(&object_centroids, &input_centroids, self.cfg.max_distance);

        let now = self.clock.now();
        for &(row, col) in &assignment.matches {
            let id = object_ids[row];
            let obj = self
                .objects
                .get_mut(&id)
                .ok_or_else(|| anyhow!("assigned object {} is not live", id))?;
            obj.centroid = input_centroids[col];
            obj.bbox = detections[col].bbox;
            obj.disappeared_frames = 0;
            obj.last_seen = now;
        }

        for &row in &assignment.unmatched_rows {
            self.mark_disappeared(object_ids[row]);
        }

        for &col in &assignment.unmatched_cols {
            self.register(detections[col].bbox, frame)?;
        }

        Ok(&self.objects)
    }

    /// Start tracking a new object. Returns its id.
    pub fn register(&mut self, bbox: BBox, frame: Option<&Frame>) -> Result<ObjectId> {
        let id = self.next_object_id;
        if self.objects.contains_key(&id) {
            return Err(anyhow!("duplicate track id {}", id));
        }
        self.next_object_id += 1;

        let now = self.clock.now();
        let mut obj = TrackedObject {
            id,
            centroid: bbox.centroid(),
            bbox,
            disappeared_frames: 0,
            first_seen: now,
            last_seen: now,
            state: ObjectState::New,
            entry_time: None,
            exit_time: None,
            person_id: None,
        };

        if let (Some(gallery), Some(frame)) = (self.gallery.as_mut(), frame) {
            match gallery.identify(frame, &bbox, id) {
                Ok(identity) => {
                    obj.person_id = Some(identity.person_id);
                    if self.counted_persons.contains(&identity.person_id) {
                        obj.state = ObjectState::Scanned;
                        obj.entry_time = Some(now);
                        log::info!(
                            "person {} already counted; track {} starts as scanned",
                            identity.person_id,
                            id
                        );
                    }
                }
                Err(e) => {
                    log::warn!("re-identification failed for track {}: {}", id, e);
                }
            }
        }

        log::debug!(
            "track {} registered at ({:.1}, {:.1})",
            id,
            obj.centroid.x,
            obj.centroid.y
        );
        self.objects.insert(id, obj);
        Ok(id)
    }

    /// Remove `id` from the live set.
    ///
    /// A Scanned object becomes Exited and its person joins the counted set.
    /// Returns the final record, or `None` when `id` is not live.
    pub fn deregister(&mut self, id: ObjectId) -> Option<TrackedObject> {
        let now = self.clock.now();
        let mut obj = self.objects.remove(&id)?;
        if obj.state == ObjectState::Scanned {
            self.exit(&mut obj, now);
        }
        log::debug!("track {} deregistered ({})", id, obj.state.as_str());
        self.departed.push(obj.clone());
        Some(obj)
    }

    /// New -> Scanned. Returns false when `id` is not live or not New.
    pub fn mark_as_scanned(&mut self, id: ObjectId) -> bool {
        let now = self.clock.now();
        match self.objects.get_mut(&id) {
            Some(obj) if obj.state == ObjectState::New => {
                obj.state = ObjectState::Scanned;
                obj.entry_time = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Retire Scanned objects unseen for longer than the exit timeout.
    ///
    /// Meant for a periodic sweep (about once a second), not every frame.
    pub fn check_for_exits(&mut self) -> Vec<ObjectId> {
        let now = self.clock.now();
        let timeout = self.cfg.exit_timeout.as_secs_f64();
        let expired: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|obj| obj.state == ObjectState::Scanned && now - obj.last_seen > timeout)
            .map(|obj| obj.id)
            .collect();

        for &id in &expired {
            self.deregister(id);
        }
        if !expired.is_empty() {
            log::info!("exit sweep retired {} track(s): {:?}", expired.len(), expired);
        }
        expired
    }

    /// Deregister every live object (shutdown path).
    pub fn drain(&mut self) -> Vec<TrackedObject> {
        let ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        for id in ids {
            self.deregister(id);
        }
        self.take_departed()
    }

    fn exit(&mut self, obj: &mut TrackedObject, now: f64) {
        obj.state = ObjectState::Exited;
        obj.exit_time = Some(now);
        if let Some(person) = obj.person_id {
            self.counted_persons.insert(person);
        }
    }

    fn mark_disappeared(&mut self, id: ObjectId) {
        let Some(obj) = self.objects.get_mut(&id) else {
            return;
        };
        obj.disappeared_frames += 1;
        if obj.disappeared_frames > self.cfg.max_disappeared {
            self.deregister(id);
        }
    }

    /// Load shedding under detector flicker: drop the half of live objects
    /// that have been missing longest. Ties go to the older track.
    fn shed_stalest_half(&mut self) {
        let mut ranked: Vec<(ObjectId, u32)> = self
            .objects
            .values()
            .map(|obj| (obj.id, obj.disappeared_frames))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        let evict = ranked.len() / 2;
        log::info!(
            "tracker: {} live objects, shedding {} stalest",
            ranked.len(),
            evict
        );
        for (id, _) in ranked.into_iter().take(evict) {
            self.deregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reid::tests::TableExtractor;
    use crate::reid::DEFAULT_SIMILARITY_THRESHOLD;
    use crate::ManualClock;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(x1, y1, x2, y2, 0.9)
    }

    /// Square box centred on (cx, cy).
    fn at(cx: f32, cy: f32) -> Detection {
        det(cx - 1.0, cy - 1.0, cx + 1.0, cy + 1.0)
    }

    fn tracker(cfg: TrackerConfig) -> (Tracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        (Tracker::new(cfg, clock.clone()), clock)
    }

    #[test]
    fn registers_all_detections_when_empty() {
        let (mut t, _) = tracker(TrackerConfig::default());
        let objects = t.update(&[at(0.0, 0.0), at(100.0, 100.0)], None).unwrap();
        assert_eq!(objects.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(objects.values().all(|o| o.state == ObjectState::New));
    }

    #[test]
    fn greedy_assignment_keeps_identities() {
        let (mut t, _) = tracker(TrackerConfig {
            max_distance: f32::INFINITY,
            ..TrackerConfig::default()
        });
        t.update(&[at(0.0, 0.0), at(10.0, 10.0), at(20.0, 20.0)], None)
            .unwrap();
        let objects = t
            .update(&[at(1.0, 1.0), at(11.0, 11.0), at(50.0, 50.0)], None)
            .unwrap();

        assert_eq!(objects[&0].centroid, Centroid { x: 1.0, y: 1.0 });
        assert_eq!(objects[&1].centroid, Centroid { x: 11.0, y: 11.0 });
        assert_eq!(objects[&2].centroid, Centroid { x: 20.0, y: 20.0 });
        assert_eq!(objects[&2].disappeared_frames, 1);
        assert_eq!(objects[&3].centroid, Centroid { x: 50.0, y: 50.0 });
        assert_eq!(objects.len(), 4);
    }

    #[test]
    fn ids_are_never_reused() {
        let (mut t, _) = tracker(TrackerConfig {
            max_disappeared: 0,
            ..TrackerConfig::default()
        });
        t.update(&[at(0.0, 0.0)], None).unwrap();
        t.update(&[], None).unwrap();
        assert!(t.is_empty());
        let objects = t.update(&[at(0.0, 0.0)], None).unwrap();
        assert_eq!(objects.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn object_removed_after_max_disappeared() {
        let (mut t, _) = tracker(TrackerConfig {
            max_disappeared: 2,
            ..TrackerConfig::default()
        });
        t.update(&[at(0.0, 0.0)], None).unwrap();
        t.update(&[], None).unwrap();
        t.update(&[], None).unwrap();
        assert_eq!(t.get(0).unwrap().disappeared_frames, 2);
        t.update(&[], None).unwrap();
        assert!(t.get(0).is_none());

        let departed = t.take_departed();
        assert_eq!(departed.len(), 1);
        assert_eq!(departed[0].state, ObjectState::New);
        assert_eq!(departed[0].exit_time, None);
    }

    #[test]
    fn scanned_object_exits_on_deregistration() {
        let (mut t, clock) = tracker(TrackerConfig {
            max_disappeared: 1,
            ..TrackerConfig::default()
        });
        t.update(&[at(0.0, 0.0)], None).unwrap();
        assert!(t.mark_as_scanned(0));
        assert!(!t.mark_as_scanned(0));
        clock.advance(Duration::from_secs(3));
        t.update(&[], None).unwrap();
        t.update(&[], None).unwrap();

        assert!(t.is_empty());
        let departed = t.take_departed();
        assert_eq!(departed[0].state, ObjectState::Exited);
        assert_eq!(departed[0].exit_time, Some(1_003.0));
        assert_eq!(departed[0].entry_time, Some(1_000.0));
    }

    #[test]
    fn exit_sweep_only_retires_stale_scanned_objects() {
        let (mut t, clock) = tracker(TrackerConfig::default());
        t.update(&[at(0.0, 0.0), at(200.0, 0.0)], None).unwrap();
        t.mark_as_scanned(0);

        clock.advance(Duration::from_secs(5));
        assert!(t.check_for_exits().is_empty());

        clock.advance(Duration::from_secs(6));
        assert_eq!(t.check_for_exits(), vec![0]);
        assert!(t.get(0).is_none());
        // New objects are never retired by the sweep.
        assert!(t.get(1).is_some());

        let departed = t.take_departed();
        assert_eq!(departed[0].state, ObjectState::Exited);
        assert_eq!(departed[0].exit_time, Some(1_011.0));
    }

    #[test]
    fn stalest_half_shed_when_objects_outnumber_detections() {
        let (mut t, _) = tracker(TrackerConfig::default());
        t.update(
            &[at(0.0, 0.0), at(100.0, 0.0), at(200.0, 0.0), at(300.0, 0.0)],
            None,
        )
        .unwrap();
        // 4 live vs 2 detections: no shedding yet; objects 2 and 3 go missing.
        t.update(&[at(0.0, 0.0), at(100.0, 0.0)], None).unwrap();
        assert_eq!(t.len(), 4);

        // 4 live > 2 * 1 detection: the two stalest (2 and 3) are evicted
        // before assignment, even though they are the younger tracks.
        let objects = t.update(&[at(0.0, 0.0)], None).unwrap();
        assert!(objects.contains_key(&0));
        assert!(objects.contains_key(&1));
        assert!(!objects.contains_key(&2));
        assert!(!objects.contains_key(&3));
        assert_eq!(objects[&1].disappeared_frames, 1);
        assert_eq!(t.take_departed().len(), 2);
    }

    #[test]
    fn degenerate_detections_are_ignored() {
        let (mut t, _) = tracker(TrackerConfig::default());
        let objects = t
            .update(&[det(10.0, 10.0, 10.0, 30.0), at(0.0, 0.0)], None)
            .unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[&0].centroid, Centroid { x: 0.0, y: 0.0 });
    }

    #[test]
    fn unreachable_object_ages_out_instead_of_failing_updates() {
        let (mut t, _) = tracker(TrackerConfig {
            max_disappeared: 2,
            ..TrackerConfig::default()
        });
        // Finite centre near -1e38: any distance to it overflows to inf.
        t.update(&[det(-1.2e38, 100.0, -0.8e38, 220.0)], None).unwrap();
        assert_eq!(t.len(), 1);

        for _ in 0..3 {
            t.update(&[at(120.0, 160.0)], None).unwrap();
        }
        assert!(t.get(0).is_none());
        let person = t.get(1).unwrap();
        assert_eq!(person.centroid, Centroid { x: 120.0, y: 160.0 });
        assert_eq!(person.disappeared_frames, 0);
        assert_eq!(t.len(), 1);
    }

    fn reid_tracker(table: &[(i32, Vec<f32>)]) -> (Tracker, Arc<ManualClock>) {
        let extractor = TableExtractor {
            table: table.iter().cloned().collect(),
        };
        let gallery = EmbeddingGallery::new(Box::new(extractor), DEFAULT_SIMILARITY_THRESHOLD);
        let (t, clock) = tracker(TrackerConfig {
            max_disappeared: 0,
            ..TrackerConfig::default()
        });
        (t.with_gallery(gallery), clock)
    }

    #[test]
    fn counted_person_reenters_as_scanned() {
        let (mut t, _) = reid_tracker(&[(99, vec![1.0, 0.0]), (399, vec![0.98, 0.05])]);
        let frame = Frame::filled(8, 8, [0, 0, 0]);

        t.update(&[at(100.0, 50.0)], Some(&frame)).unwrap();
        assert_eq!(t.get(0).unwrap().person_id, Some(1));
        t.mark_as_scanned(0);
        t.update(&[], Some(&frame)).unwrap();
        assert!(t.counted_persons().contains(&1));

        let objects = t.update(&[at(400.0, 50.0)], Some(&frame)).unwrap();
        let back = &objects[&1];
        assert_eq!(back.person_id, Some(1));
        assert_eq!(back.state, ObjectState::Scanned);
        assert!(back.entry_time.is_some());
        assert!(t.is_already_counted(1));
    }

    #[test]
    fn reid_failure_degrades_to_geometry() {
        let (mut t, _) = reid_tracker(&[]);
        let frame = Frame::filled(8, 8, [0, 0, 0]);
        let objects = t.update(&[at(100.0, 50.0)], Some(&frame)).unwrap();
        assert_eq!(objects[&0].person_id, None);
        assert_eq!(objects[&0].state, ObjectState::New);
    }

    #[test]
    fn reid_skipped_without_frame() {
        let (mut t, _) = reid_tracker(&[(99, vec![1.0, 0.0])]);
        let objects = t.update(&[at(100.0, 50.0)], None).unwrap();
        assert_eq!(objects[&0].person_id, None);
        assert!(t.gallery().unwrap().is_empty());
    }
}
