//! Count event export.
//!
//! An export always contains every committed event, so the artifact on disk
//! is a complete picture. `last_export_id` only tracks how much of it is new.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::storage::{EventStore, StoredEvent};
use crate::{Clock, CounterError};

const PAGE_SIZE: usize = 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub generated_at: f64,
    pub total: u64,
    pub events: Vec<StoredEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub total: u64,
    /// Events committed since the previous export.
    pub new_events: u64,
    pub last_export_id: i64,
}

pub struct Exporter {
    store: Box<dyn EventStore>,
    path: PathBuf,
    clock: Arc<dyn Clock>,
    last_export_id: i64,
}

impl Exporter {
    pub fn new(store: Box<dyn EventStore>, path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            path: path.into(),
            clock,
            last_export_id: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_export_id(&self) -> i64 {
        self.last_export_id
    }

    /// Newest first, straight from the store.
    pub fn history(&mut self, limit: usize, offset: usize) -> Result<Vec<StoredEvent>> {
        self.store.history(limit, offset)
    }

    pub fn export(&mut self) -> Result<ExportSummary> {
        let mut events = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.store.events_after(cursor, PAGE_SIZE)?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = last.id;
            events.extend(page);
        }

        let new_events = events
            .iter()
            .filter(|ev| ev.id > self.last_export_id)
            .count() as u64;
        let artifact = ExportArtifact {
            generated_at: self.clock.now(),
            total: events.len() as u64,
            events,
        };
        write_atomically(&self.path, &serde_json::to_vec_pretty(&artifact)?)?;

        if let Some(last) = artifact.events.last() {
            self.last_export_id = last.id;
        }
        if new_events == 0 {
            log::info!(
                "no new visitors since last export; rewrote {} event(s) to {}",
                artifact.total,
                self.path.display()
            );
        } else {
            log::info!(
                "exported {} event(s) ({} new) to {}",
                artifact.total,
                new_events,
                self.path.display()
            );
        }
        Ok(ExportSummary {
            path: self.path.clone(),
            total: artifact.total,
            new_events,
            last_export_id: self.last_export_id,
        })
    }

    /// Bytes of the last written artifact, or [`CounterError::NoDataYet`].
    pub fn download(&self) -> Result<Vec<u8>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CounterError::NoDataYet.into()),
            Err(e) => Err(anyhow!(
                "failed to read export {}: {}",
                self.path.display(),
                e
            )),
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)
        .map_err(|e| anyhow!("failed to write export {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| anyhow!("failed to move export into {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::Direction;
    use crate::storage::InMemoryEventStore;
    use crate::ManualClock;

    fn setup() -> (Exporter, InMemoryEventStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryEventStore::new();
        let exporter = Exporter::new(
            Box::new(store.clone()),
            dir.path().join("visitors.json"),
            Arc::new(ManualClock::new(42.0)),
        );
        (exporter, store, dir)
    }

    #[test]
    fn download_before_export_is_no_data_yet() {
        let (exporter, _, _dir) = setup();
        let err = exporter.download().unwrap_err();
        assert_eq!(
            err.downcast_ref::<CounterError>(),
            Some(&CounterError::NoDataYet)
        );
    }

    #[test]
    fn export_tracks_new_rows() {
        let (mut exporter, store, _dir) = setup();
        let mut writer = store.clone();
        writer.append_event(1.0, Direction::Left, "a").unwrap();
        writer.append_event(2.0, Direction::Left, "b").unwrap();

        let first = exporter.export().unwrap();
        assert_eq!(first.total, 2);
        assert_eq!(first.new_events, 2);
        assert_eq!(exporter.last_export_id(), 2);

        let again = exporter.export().unwrap();
        assert_eq!(again.total, 2);
        assert_eq!(again.new_events, 0);

        writer.append_event(3.0, Direction::Left, "c").unwrap();
        let third = exporter.export().unwrap();
        assert_eq!(third.new_events, 1);
        assert_eq!(third.last_export_id, 3);

        let artifact: ExportArtifact = serde_json::from_slice(&exporter.download().unwrap()).unwrap();
        assert_eq!(artifact.generated_at, 42.0);
        assert_eq!(artifact.total, 3);
        assert_eq!(artifact.events[2].note, "c");
    }

    #[test]
    fn empty_store_still_writes_an_artifact() {
        let (mut exporter, _, _dir) = setup();
        let summary = exporter.export().unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(exporter.last_export_id(), 0);
        assert!(exporter.download().is_ok());
    }
}
