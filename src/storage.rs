//! Count event persistence.
//!
//! Count events are append-only rows `(id, timestamp, direction, note)`;
//! ids are sequential and rows are never mutated. Retired tracks go to a
//! separate `track_history` table. [`DurableSink`] sits between the main loop
//! and a store and keeps events in memory, in order, while the store is
//! unavailable.

use anyhow::{anyhow, Result};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::counter::{CountEvent, Direction};
use crate::tracker::{ObjectState, TrackedObject};
use crate::{ObjectId, PersonId};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub timestamp: f64,
    pub direction: String,
    pub note: String,
}

/// Final record of a track removed from the live set.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackRecord {
    pub track_id: ObjectId,
    pub person_id: Option<PersonId>,
    pub state: ObjectState,
    pub first_seen: f64,
    pub last_seen: f64,
    pub entry_time: Option<f64>,
    pub exit_time: Option<f64>,
    /// From first sighting to exit, or to last sighting if it never exited.
    pub duration_secs: f64,
    pub last_x: f32,
    pub last_y: f32,
}

impl From<&TrackedObject> for TrackRecord {
    fn from(obj: &TrackedObject) -> Self {
        let end = obj.exit_time.unwrap_or(obj.last_seen);
        Self {
            track_id: obj.id,
            person_id: obj.person_id,
            state: obj.state,
            first_seen: obj.first_seen,
            last_seen: obj.last_seen,
            entry_time: obj.entry_time,
            exit_time: obj.exit_time,
            duration_secs: (end - obj.first_seen).max(0.0),
            last_x: obj.centroid.x,
            last_y: obj.centroid.y,
        }
    }
}

pub trait EventStore: Send {
    /// Append one count event and return its sequence id.
    fn append_event(&mut self, timestamp: f64, direction: Direction, note: &str) -> Result<i64>;

    /// Events with id greater than `after_id`, oldest first.
    fn events_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<StoredEvent>>;

    /// Newest first.
    fn history(&mut self, limit: usize, offset: usize) -> Result<Vec<StoredEvent>>;

    fn event_count(&mut self) -> Result<u64>;

    fn append_track(&mut self, record: &TrackRecord) -> Result<()>;

    fn track_count(&mut self) -> Result<u64>;
}

// -------------------- SQLite --------------------

/// One connection per owner. Writers from different connections are
/// serialized by SQLite; WAL keeps committed rows readable meanwhile.
pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)
            .map_err(|e| anyhow!("failed to open event store {}: {}", db_path.display(), e))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS visitors (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp REAL NOT NULL,
              direction TEXT NOT NULL,
              notes TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS track_history (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              track_id INTEGER NOT NULL,
              person_id INTEGER,
              state TEXT NOT NULL,
              first_seen REAL NOT NULL,
              last_seen REAL NOT NULL,
              entry_time REAL,
              exit_time REAL,
              duration REAL NOT NULL,
              last_x REAL NOT NULL,
              last_y REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_visitors_timestamp ON visitors(timestamp);
            "#,
        )?;
        Ok(())
    }

    fn query_events(&self, sql: &str, args: [i64; 2]) -> Result<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params![args[0], args[1]])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(StoredEvent {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                direction: row.get(2)?,
                note: row.get(3)?,
            });
        }
        Ok(out)
    }

    /// Highest committed event id, if any.
    pub fn last_event_id(&self) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row("SELECT MAX(id) FROM visitors", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        Ok(id)
    }
}

impl EventStore for SqliteEventStore {
    fn append_event(&mut self, timestamp: f64, direction: Direction, note: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO visitors(timestamp, direction, notes) VALUES (?1, ?2, ?3)",
            params![timestamp, direction.as_str(), note],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn events_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<StoredEvent>> {
        self.query_events(
            "SELECT id, timestamp, direction, notes FROM visitors WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            [after_id, to_sql_limit(limit)?],
        )
    }

    fn history(&mut self, limit: usize, offset: usize) -> Result<Vec<StoredEvent>> {
        self.query_events(
            "SELECT id, timestamp, direction, notes FROM visitors ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            [to_sql_limit(limit)?, to_sql_limit(offset)?],
        )
    }

    fn event_count(&mut self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM visitors", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn append_track(&mut self, record: &TrackRecord) -> Result<()> {
        let track_id = i64::try_from(record.track_id)
            .map_err(|_| anyhow!("track id {} exceeds i64 range", record.track_id))?;
        let person_id = record
            .person_id
            .map(i64::try_from)
            .transpose()
            .map_err(|_| anyhow!("person id exceeds i64 range"))?;
        self.conn.execute(
            r#"
            INSERT INTO track_history(
              track_id, person_id, state, first_seen, last_seen,
              entry_time, exit_time, duration, last_x, last_y
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                track_id,
                person_id,
                record.state.as_str(),
                record.first_seen,
                record.last_seen,
                record.entry_time,
                record.exit_time,
                record.duration_secs,
                record.last_x as f64,
                record.last_y as f64
            ],
        )?;
        Ok(())
    }

    fn track_count(&mut self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM track_history", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

fn to_sql_limit(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("limit {} exceeds i64 range", value))
}

// -------------------- In-memory --------------------

#[derive(Debug, Default)]
struct InMemoryState {
    events: Vec<StoredEvent>,
    tracks: Vec<TrackRecord>,
    failing_writes: u32,
    unavailable: bool,
}

impl InMemoryState {
    fn check_writable(&mut self) -> Result<()> {
        if self.unavailable {
            return Err(anyhow!("event store unavailable"));
        }
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(anyhow!("event store busy"));
        }
        Ok(())
    }
}

/// Store kept in process memory. Clones share the same rows, so one clone
/// can feed a sink while another serves reads.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<InMemoryState>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        if let Ok(mut state) = self.inner.lock() {
            state.failing_writes = n;
        }
    }

    /// Fail every write until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.unavailable = unavailable;
        }
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.inner
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    pub fn tracks(&self) -> Vec<TrackRecord> {
        self.inner
            .lock()
            .map(|state| state.tracks.clone())
            .unwrap_or_default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("in-memory event store lock poisoned"))
    }
}

impl EventStore for InMemoryEventStore {
    fn append_event(&mut self, timestamp: f64, direction: Direction, note: &str) -> Result<i64> {
        let mut state = self.state()?;
        state.check_writable()?;
        let id = state.events.last().map(|ev| ev.id + 1).unwrap_or(1);
        state.events.push(StoredEvent {
            id,
            timestamp,
            direction: direction.as_str().to_string(),
            note: note.to_string(),
        });
        Ok(id)
    }

    fn events_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<StoredEvent>> {
        let state = self.state()?;
        Ok(state
            .events
            .iter()
            .filter(|ev| ev.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn history(&mut self, limit: usize, offset: usize) -> Result<Vec<StoredEvent>> {
        let state = self.state()?;
        Ok(state
            .events
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn event_count(&mut self) -> Result<u64> {
        Ok(self.state()?.events.len() as u64)
    }

    fn append_track(&mut self, record: &TrackRecord) -> Result<()> {
        let mut state = self.state()?;
        state.check_writable()?;
        state.tracks.push(record.clone());
        Ok(())
    }

    fn track_count(&mut self) -> Result<u64> {
        Ok(self.state()?.tracks.len() as u64)
    }
}

// -------------------- Durable sink --------------------

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Attempts per write, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before retry number `retry` (0-based), plus up to
    /// one base interval of random jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_backoff);
        let jitter_ms = self.base_backoff.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

#[derive(Clone, Debug, PartialEq)]
struct PendingEvent {
    timestamp: f64,
    direction: Direction,
    note: String,
}

impl From<&CountEvent> for PendingEvent {
    fn from(ev: &CountEvent) -> Self {
        Self {
            timestamp: ev.timestamp,
            direction: ev.direction,
            note: ev.note(),
        }
    }
}

/// Write-through sink for count events.
///
/// Events are committed in the order they were submitted. A write that still
/// fails after the retry budget stays queued, and everything submitted after
/// it queues behind it. The in-process count stays authoritative meanwhile.
pub struct DurableSink {
    store: Box<dyn EventStore>,
    policy: RetryPolicy,
    pending: VecDeque<PendingEvent>,
    last_committed_id: Option<i64>,
}

impl DurableSink {
    pub fn new(store: Box<dyn EventStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            pending: VecDeque::new(),
            last_committed_id: None,
        }
    }

    /// Events submitted but not yet committed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_committed_id(&self) -> Option<i64> {
        self.last_committed_id
    }

    /// Queue one count event and try to commit the backlog. Returns how many
    /// events remain held.
    pub fn submit(&mut self, event: &CountEvent) -> usize {
        self.pending.push_back(PendingEvent::from(event));
        self.drain_pending();
        self.pending.len()
    }

    /// Record a retired track. Best effort: one attempt, no backoff; a track
    /// that cannot be written is logged and dropped.
    pub fn record_track(&mut self, record: &TrackRecord) {
        if let Err(e) = self.store.append_track(record) {
            log::warn!("track {} not persisted: {}", record.track_id, e);
        }
    }

    /// Drain held events. Errors when some are still pending afterwards.
    pub fn flush(&mut self) -> Result<()> {
        self.drain_pending();
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} count event(s) still pending after flush",
                self.pending.len()
            ))
        }
    }

    fn drain_pending(&mut self) {
        while let Some(front) = self.pending.front().cloned() {
            match self.with_retries(|store| {
                store.append_event(front.timestamp, front.direction, &front.note)
            }) {
                Ok(id) => {
                    self.pending.pop_front();
                    self.last_committed_id = Some(id);
                    log::debug!("count event {} committed", id);
                }
                Err(e) => {
                    log::error!(
                        "event store write failed, holding {} count event(s): {}",
                        self.pending.len(),
                        e
                    );
                    return;
                }
            }
        }
    }

    fn with_retries<T>(
        &mut self,
        mut op: impl FnMut(&mut dyn EventStore) -> Result<T>,
    ) -> Result<T> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                std::thread::sleep(self.policy.backoff(attempt - 1));
            }
            match op(self.store.as_mut()) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    log::warn!(
                        "event store write attempt {}/{} failed: {}",
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("event store write not attempted")))
    }
}
