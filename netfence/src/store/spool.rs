//! On-disk spool backing the durable queue.
//!
//! Each sub-session is one JSON document named `<local_id>.json` in
//! the spool directory. Every mutation rewrites the affected document
//! through a temp-file-and-rename so a crash mid-write leaves the
//! previous version intact. Opening the spool loads every record back
//! into memory; unreadable files are skipped with a warning and left
//! on disk for inspection.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CoverageSubSession, StartMode, StoreError};
use crate::fence::Fence;

/// Counts of what a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Fences pruned from surviving sub-sessions.
    pub fences_removed: usize,
    /// Whole sub-sessions deleted (aged out or left empty).
    pub sub_sessions_removed: usize,
}

impl CleanupSummary {
    /// Whether the pass removed anything at all.
    pub fn is_empty(&self) -> bool {
        self.fences_removed == 0 && self.sub_sessions_removed == 0
    }
}

/// Spool of coverage sub-sessions, one JSON file per record.
///
/// Not safe for concurrent mutation; ownership belongs to the store
/// worker task.
#[derive(Debug)]
pub struct SpoolStore {
    dir: PathBuf,
    records: HashMap<Uuid, CoverageSubSession>,
    current: Option<Uuid>,
}

impl SpoolStore {
    /// Open a spool directory, creating it if needed and loading every
    /// record already on disk.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut records = HashMap::new();
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable spool entry");
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match Self::load_record(&path) {
                Ok(record) => {
                    records.insert(record.local_id, record);
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable spool record"
                    );
                }
            }
        }

        debug!(
            dir = %dir.display(),
            records = records.len(),
            "spool opened"
        );

        Ok(Self {
            dir,
            records,
            current: None,
        })
    }

    fn load_record(path: &Path) -> Result<CoverageSubSession, StoreError> {
        let data = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Rewrite one record's document via temp file and rename.
    fn persist(&self, id: Uuid) -> Result<(), StoreError> {
        let record = self
            .records
            .get(&id)
            .ok_or(StoreError::NoCurrentSubSession)?;
        let json = serde_json::to_string_pretty(record)?;
        let path = self.record_path(id);
        let tmp = self.dir.join(format!("{}.json.tmp", id));
        fs::write(&tmp, json).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }

    fn remove_record_file(&self, id: Uuid) -> Result<(), StoreError> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Begin a new sub-session and make it current.
    pub fn begin_sub_session(
        &mut self,
        at: DateTime<Utc>,
        loop_uuid: Option<String>,
    ) -> Result<Uuid, StoreError> {
        let record = CoverageSubSession::begin(at, loop_uuid);
        let id = record.local_id;
        self.records.insert(id, record);
        self.persist(id)?;
        self.current = Some(id);
        debug!(sub_session = %id, "sub-session started");
        Ok(id)
    }

    fn current_mut(&mut self) -> Result<&mut CoverageSubSession, StoreError> {
        let id = self.current.ok_or(StoreError::NoCurrentSubSession)?;
        self.records
            .get_mut(&id)
            .ok_or(StoreError::NoCurrentSubSession)
    }

    /// Append a fence to the current sub-session.
    pub fn save_fence(&mut self, fence: Fence) -> Result<(), StoreError> {
        let record = self.current_mut()?;
        let id = record.local_id;
        record.fences.push(fence);
        self.persist(id)
    }

    /// Set the server-assigned identity and anchor of the current
    /// sub-session. Both land in one write, so no reader ever observes
    /// an identifier without its anchor.
    pub fn assign_identity(
        &mut self,
        test_uuid: String,
        anchor_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = self.current_mut()?;
        let id = record.local_id;
        record.test_uuid = Some(test_uuid);
        record.anchor_at = Some(anchor_at);
        self.persist(id)
    }

    /// End the current sub-session. It keeps its data and becomes
    /// eligible for warm delivery; the spool is left with no current
    /// sub-session.
    pub fn finalize_current(&mut self, at: DateTime<Utc>) -> Result<Uuid, StoreError> {
        let record = self.current_mut()?;
        let id = record.local_id;
        record.finalized_at = Some(at);
        self.persist(id)?;
        self.current = None;
        debug!(sub_session = %id, "sub-session finalized");
        Ok(id)
    }

    /// Sub-sessions eligible for delivery in the given start mode.
    ///
    /// Cold start recovers everything that ever got an identifier,
    /// finished or not. Warm start only touches finalized records, so
    /// a running measurement is never partially submitted. Records
    /// without an identifier are never eligible; cleanup retires them.
    pub fn eligible(&self, mode: StartMode) -> Vec<CoverageSubSession> {
        self.records
            .values()
            .filter(|r| Some(r.local_id) != self.current)
            .filter(|r| r.test_uuid.is_some())
            .filter(|r| match mode {
                StartMode::Cold => true,
                StartMode::Warm => r.is_finalized(),
            })
            .cloned()
            .collect()
    }

    /// Delete a sub-session and its document. Deleting an unknown id
    /// is a no-op.
    pub fn delete(&mut self, id: Uuid) -> Result<(), StoreError> {
        if self.records.remove(&id).is_none() {
            debug!(sub_session = %id, "delete of unknown sub-session ignored");
            return Ok(());
        }
        if self.current == Some(id) {
            self.current = None;
        }
        self.remove_record_file(id)
    }

    /// Age-based cleanup.
    ///
    /// Unfinished records are never touched regardless of age: they
    /// are either the active measurement or a crash leftover a cold
    /// start may still deliver. Finalized records lose fences entered
    /// before `now - max_age` and are deleted outright once no fences
    /// remain.
    pub fn cleanup(
        &mut self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<CleanupSummary, StoreError> {
        // Clamp so the cutoff arithmetic stays in range.
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365_000));
        let cutoff = now - max_age;
        let mut summary = CleanupSummary::default();

        let ids: Vec<Uuid> = self.records.keys().copied().collect();
        for id in ids {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if !record.is_finalized() {
                continue;
            }

            let before = record.fences.len();
            record.fences.retain(|f| f.entered_at >= cutoff);
            let pruned = before - record.fences.len();
            summary.fences_removed += pruned;

            if record.fences.is_empty() {
                summary.sub_sessions_removed += 1;
                self.records.remove(&id);
                if let Err(e) = self.remove_record_file(id) {
                    warn!(sub_session = %id, error = %e, "failed to remove emptied record");
                }
            } else if pruned > 0 {
                if let Err(e) = self.persist(id) {
                    warn!(sub_session = %id, error = %e, "failed to persist pruned record");
                }
            }
        }

        Ok(summary)
    }

    /// Number of records currently in the spool.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// The current sub-session's local id, if a measurement is active.
    pub fn current_id(&self) -> Option<Uuid> {
        self.current
    }
}
