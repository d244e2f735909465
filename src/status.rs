//! Read-only status snapshots for the API thread.
//!
//! The main loop owns all mutable counting state. After each frame it builds a
//! complete [`StatusSnapshot`] and swaps it in under a write lock; readers clone
//! the whole snapshot under a read lock, so they never see half of a frame.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::counter::CountStats;
use crate::detect::Centroid;
use crate::tracker::{ObjectState, Tracker};
use crate::{CounterError, ObjectId, PersonId};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActiveObject {
    pub id: ObjectId,
    pub state: ObjectState,
    pub centroid: Centroid,
    pub person_id: Option<PersonId>,
    pub already_counted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub total: u64,
    pub total_left: u64,
    pub total_right: u64,
    pub active_objects: Vec<ActiveObject>,
    pub frames_processed: u64,
    /// Count events not yet committed to the store.
    pub held_events: usize,
    pub updated_at: f64,
}

impl StatusSnapshot {
    pub fn capture(
        stats: CountStats,
        tracker: &Tracker,
        frames_processed: u64,
        held_events: usize,
        updated_at: f64,
    ) -> Self {
        let active_objects = tracker
            .objects()
            .values()
            .map(|obj| ActiveObject {
                id: obj.id,
                state: obj.state,
                centroid: obj.centroid,
                person_id: obj.person_id,
                already_counted: tracker.is_already_counted(obj.id),
            })
            .collect();
        Self {
            total: stats.total,
            total_left: stats.total_left,
            total_right: stats.total_right,
            active_objects,
            frames_processed,
            held_events,
            updated_at,
        }
    }
}

type Slot = Arc<RwLock<Option<StatusSnapshot>>>;

/// Write side. Owned by the main loop.
#[derive(Debug, Default)]
pub struct StatusBoard {
    slot: Slot,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: StatusSnapshot) -> Result<()> {
        let mut guard = self
            .slot
            .write()
            .map_err(|_| anyhow!("status board lock poisoned"))?;
        *guard = Some(snapshot);
        Ok(())
    }

    pub fn handle(&self) -> StatusHandle {
        StatusHandle {
            slot: self.slot.clone(),
        }
    }
}

/// Read side. Cheap to clone and safe to hand to other threads.
#[derive(Clone, Debug)]
pub struct StatusHandle {
    slot: Slot,
}

impl StatusHandle {
    /// Latest published snapshot, or [`CounterError::NotReady`] before the
    /// first frame.
    pub fn snapshot(&self) -> Result<StatusSnapshot> {
        let guard = self
            .slot
            .read()
            .map_err(|_| anyhow!("status board lock poisoned"))?;
        guard.clone().ok_or_else(|| CounterError::NotReady.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;
    use crate::tracker::TrackerConfig;
    use crate::ManualClock;

    #[test]
    fn not_ready_before_first_publish() {
        let board = StatusBoard::new();
        let err = board.handle().snapshot().unwrap_err();
        assert_eq!(
            err.downcast_ref::<CounterError>(),
            Some(&CounterError::NotReady)
        );
    }

    #[test]
    fn handles_see_whole_snapshots() {
        let clock = Arc::new(ManualClock::new(10.0));
        let mut tracker = Tracker::new(TrackerConfig::default(), clock);
        tracker
            .update(&[Detection::new(0.0, 0.0, 40.0, 80.0, 0.9)], None)
            .unwrap();
        tracker.mark_as_scanned(0);

        let board = StatusBoard::new();
        let handle = board.handle();
        let stats = CountStats {
            total: 1,
            total_left: 1,
            total_right: 0,
        };
        board
            .publish(StatusSnapshot::capture(stats, &tracker, 3, 0, 10.0))
            .unwrap();

        let snap = handle.clone().snapshot().unwrap();
        assert_eq!(snap.total, 1);
        assert_eq!(snap.frames_processed, 3);
        assert_eq!(snap.active_objects.len(), 1);
        assert_eq!(snap.active_objects[0].state, ObjectState::Scanned);
        assert_eq!(snap.active_objects[0].centroid, Centroid { x: 20.0, y: 40.0 });
        assert!(!snap.active_objects[0].already_counted);
    }
}
