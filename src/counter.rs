//! Line crossing counter.
//!
//! A vertical line at `line_x` splits the frame into Left and Right. Each
//! tracked object is counted at most once, on its first observed Right -> Left
//! side change. Crossings are edge-triggered: the recorded side is refreshed
//! every frame, so a second Right -> Left needs a return to Right first, and
//! even then a counted object never counts again. Left -> Right is never
//! counted.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::tracker::{ObjectState, Tracker};
use crate::{Clock, ObjectId, PersonId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// Direction tag persisted with a count event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Moved from the right side of the line to the left.
    Left,
    Right,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CountEvent {
    pub object_id: ObjectId,
    pub person_id: Option<PersonId>,
    pub direction: Direction,
    /// Unix seconds.
    pub timestamp: f64,
    /// Aggregate count after this event.
    pub total: u64,
}

impl CountEvent {
    pub fn note(&self) -> String {
        match self.person_id {
            Some(person) => format!(
                "Object ID: {} - Right to Left (person {})",
                self.object_id, person
            ),
            None => format!("Object ID: {} - Right to Left", self.object_id),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountStats {
    pub total: u64,
    pub total_left: u64,
    /// Always zero: Left -> Right movement is not counted.
    pub total_right: u64,
}

#[derive(Clone, Copy, Debug)]
struct SideRecord {
    side: Side,
    counted: bool,
}

pub struct LineCounter {
    line_x: f32,
    clock: Arc<dyn Clock>,
    stats: CountStats,
    last_sides: HashMap<ObjectId, SideRecord>,
    counted_ids: HashSet<ObjectId>,
}

impl LineCounter {
    pub fn new(line_x: f32, clock: Arc<dyn Clock>) -> Self {
        Self {
            line_x,
            clock,
            stats: CountStats::default(),
            last_sides: HashMap::new(),
            counted_ids: HashSet::new(),
        }
    }

    /// Line at `position` (0..=1) of the frame width, truncated to a whole pixel.
    pub fn at_fraction(position: f32, frame_width: u32, clock: Arc<dyn Clock>) -> Self {
        let line_x = (position * frame_width as f32).trunc();
        Self::new(line_x, clock)
    }

    pub fn line_x(&self) -> f32 {
        self.line_x
    }

    pub fn count(&self) -> u64 {
        self.stats.total
    }

    pub fn stats(&self) -> CountStats {
        self.stats
    }

    /// True for a live object that has already been counted or arrived
    /// pre-scanned. Departed objects are forgotten on the next evaluation.
    pub fn is_counted(&self, id: ObjectId) -> bool {
        self.counted_ids.contains(&id)
    }

    pub fn side_of(&self, x: f32) -> Side {
        if x < self.line_x {
            Side::Left
        } else {
            Side::Right
        }
    }

    /// Evaluate every live object once and return the crossings that fired.
    ///
    /// Each fired crossing has already been applied: the aggregate count is
    /// incremented and the tracker has moved the object to Scanned.
    pub fn evaluate(&mut self, tracker: &mut Tracker) -> Vec<CountEvent> {
        let observed: Vec<(ObjectId, f32, ObjectState, Option<PersonId>)> = tracker
            .objects()
            .values()
            .map(|obj| (obj.id, obj.centroid.x, obj.state, obj.person_id))
            .collect();

        // Ids are never reused, so records of departed objects are dead.
        let live: HashSet<ObjectId> = observed.iter().map(|o| o.0).collect();
        self.last_sides.retain(|id, _| live.contains(id));
        self.counted_ids.retain(|id| live.contains(id));

        let mut events = Vec::new();
        for (id, cx, state, person_id) in observed {
            if self.counted_ids.contains(&id) {
                continue;
            }

            let current = self.side_of(cx);

            // Re-entry of an already counted person arrives pre-scanned.
            if state != ObjectState::New {
                self.counted_ids.insert(id);
                self.last_sides.insert(
                    id,
                    SideRecord {
                        side: current,
                        counted: true,
                    },
                );
                log::debug!("track {} arrived {}; not counted again", id, state.as_str());
                continue;
            }

            let Some(record) = self.last_sides.get_mut(&id) else {
                self.last_sides.insert(
                    id,
                    SideRecord {
                        side: current,
                        counted: false,
                    },
                );
                continue;
            };

            let crossed = record.side == Side::Right && current == Side::Left;
            record.side = current;
            if !crossed || record.counted {
                continue;
            }
            record.counted = true;

            self.stats.total += 1;
            self.stats.total_left += 1;
            self.counted_ids.insert(id);

            if !tracker.mark_as_scanned(id) {
                log::error!(
                    "crossing for track {} counted but tracker refused New -> Scanned",
                    id
                );
            }

            let event = CountEvent {
                object_id: id,
                person_id,
                direction: Direction::Left,
                timestamp: self.clock.now(),
                total: self.stats.total,
            };
            log::info!(
                "visitor counted (right to left): track {} total {}",
                id,
                self.stats.total
            );
            events.push(event);
        }
        events
    }
}
