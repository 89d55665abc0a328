//! Run and review persistence using JSON file storage

use crate::models::workflow::{
    DecisionKind, ReviewRecord, ReviewStatus, RunRecord, RunStatus, WorkflowState,
};
use crate::workflow::error::WorkflowError;
use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Root JSON store containing all run data
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JsonStore {
    /// Latest snapshot of every run
    pub runs: Vec<RunRecord>,
    /// All HITL reviews, pending and resolved
    pub reviews: Vec<ReviewRecord>,
}

/// Run persistence manager
///
/// Every write re-reads the file under an exclusive lock before applying the
/// change, so several processes (a running pipeline and a reviewer's CLI)
/// can share one store.
pub struct WorkflowPersistence {
    /// Path to JSON store file
    store_path: PathBuf,
    /// In-memory data store
    store: Arc<Mutex<JsonStore>>,
}

impl WorkflowPersistence {
    /// Create new persistence manager
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create run store directory")?;
        }

        let store = if store_path.exists() {
            Self::load_store(&store_path)?
        } else {
            JsonStore::default()
        };

        Ok(Self {
            store_path,
            store: Arc::new(Mutex::new(store)),
        })
    }

    /// Load JSON store from file with file locking
    fn load_store(path: &Path) -> Result<JsonStore> {
        let file = File::open(path).context("Failed to open run store file")?;

        file.lock_shared()
            .context("Failed to acquire read lock on run store")?;

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(file);
        reader
            .read_to_string(&mut contents)
            .context("Failed to read run store")?;

        // Lock released when the reader drops the file
        drop(reader);

        if contents.trim().is_empty() {
            return Ok(JsonStore::default());
        }

        serde_json::from_str(&contents).context("Failed to parse run store JSON")
    }

    fn lock(&self) -> MutexGuard<'_, JsonStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a change to the store and write it back under an exclusive file lock
    fn update<T>(&self, apply: impl FnOnce(&mut JsonStore) -> T) -> Result<T> {
        let mut store = self.lock();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.store_path)
            .context("Failed to open run store file for writing")?;

        file.lock_exclusive()
            .context("Failed to acquire write lock on run store")?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read run store")?;
        if !contents.trim().is_empty() {
            *store = serde_json::from_str(&contents).context("Failed to parse run store JSON")?;
        }

        let output = apply(&mut store);

        let json = serde_json::to_string_pretty(&*store).context("Failed to serialize run store")?;
        file.set_len(0).context("Failed to truncate run store")?;
        file.seek(SeekFrom::Start(0))
            .context("Failed to rewind run store")?;
        file.write_all(json.as_bytes())
            .context("Failed to write run store")?;
        file.flush().context("Failed to flush run store to disk")?;

        // Lock released when the file is dropped
        Ok(output)
    }

    /// Insert or replace the snapshot of a run
    ///
    /// A record that already finished is only rewritten with the same
    /// status; anything else fails with [`WorkflowError::RunFinished`] and
    /// leaves the record as it is.
    pub fn save_run(&self, state: &WorkflowState, status: RunStatus) -> Result<(), WorkflowError> {
        let now = Utc::now();
        self.update(|store| {
            match store.runs.iter_mut().find(|r| r.run_id == state.run_id) {
                Some(record) => {
                    if record.status.is_finished() && record.status != status {
                        return Err(WorkflowError::RunFinished {
                            run_id: record.run_id,
                            status: record.status,
                        });
                    }
                    if status == RunStatus::AwaitingReview
                        && record.status != RunStatus::AwaitingReview
                    {
                        record.escalations += 1;
                    }
                    record.status = status;
                    record.stage = state.stage;
                    record.updated_at = now;
                    if status.is_finished() {
                        record.completed_at = state.completed_at.or(Some(now));
                    }
                    record.state = state.clone();
                }
                None => store.runs.push(RunRecord {
                    run_id: state.run_id,
                    session_id: state.session_id.clone(),
                    status,
                    stage: state.stage,
                    started_at: state.started_at,
                    updated_at: now,
                    completed_at: if status.is_finished() {
                        state.completed_at.or(Some(now))
                    } else {
                        None
                    },
                    escalations: u32::from(status == RunStatus::AwaitingReview),
                    state: state.clone(),
                }),
            }
            Ok(())
        })?
    }

    /// Get run by ID
    pub fn get_run(&self, run_id: Uuid) -> Option<RunRecord> {
        let store = self.lock();
        store.runs.iter().find(|r| r.run_id == run_id).cloned()
    }

    /// List runs, optionally restricted to one session
    pub fn list_runs(&self, session_id: Option<&str>) -> Vec<RunRecord> {
        let store = self.lock();
        store
            .runs
            .iter()
            .filter(|r| session_id.map_or(true, |s| r.session_id == s))
            .cloned()
            .collect()
    }

    /// Find unfinished runs for crash recovery
    pub fn find_incomplete_runs(&self) -> Vec<RunRecord> {
        let store = self.lock();
        store
            .runs
            .iter()
            .filter(|r| !r.status.is_finished())
            .cloned()
            .collect()
    }

    /// Store a pending review unless one already exists for the same snapshot
    ///
    /// Returns the handle of the stored or the existing review.
    pub fn insert_review_if_absent(&self, review: ReviewRecord) -> Result<Uuid> {
        self.update(|store| {
            let existing = store.reviews.iter().find(|r| {
                r.run_id == review.run_id
                    && r.fingerprint == review.fingerprint
                    && r.status == ReviewStatus::Pending
            });
            match existing {
                Some(existing) => existing.handle,
                None => {
                    let handle = review.handle;
                    store.reviews.push(review);
                    handle
                }
            }
        })
    }

    /// Get review by handle
    pub fn get_review(&self, handle: Uuid) -> Option<ReviewRecord> {
        let store = self.lock();
        store.reviews.iter().find(|r| r.handle == handle).cloned()
    }

    /// Pending reviews, optionally restricted to one run
    pub fn pending_reviews(&self, run_id: Option<Uuid>) -> Vec<ReviewRecord> {
        let store = self.lock();
        store
            .reviews
            .iter()
            .filter(|r| r.status == ReviewStatus::Pending && run_id.map_or(true, |id| r.run_id == id))
            .cloned()
            .collect()
    }

    /// Mark a pending review resolved, returning it
    ///
    /// Returns `None` when the handle is unknown or no longer pending, so only
    /// one caller can ever resolve a given review.
    pub fn resolve_review(
        &self,
        handle: Uuid,
        decision: DecisionKind,
        reviewer: Option<String>,
    ) -> Result<Option<ReviewRecord>> {
        let now = Utc::now();
        self.update(|store| {
            let review = store
                .reviews
                .iter_mut()
                .find(|r| r.handle == handle && r.status == ReviewStatus::Pending)?;
            review.status = ReviewStatus::Resolved;
            review.resolved_at = Some(now);
            review.decision = Some(decision);
            review.reviewer = reviewer;
            Some(review.clone())
        })
    }

    /// Cancel every pending review of a run, returning how many were cancelled
    pub fn cancel_reviews(&self, run_id: Uuid) -> Result<usize> {
        let now = Utc::now();
        self.update(|store| {
            let mut cancelled = 0;
            for review in store
                .reviews
                .iter_mut()
                .filter(|r| r.run_id == run_id && r.status == ReviewStatus::Pending)
            {
                review.status = ReviewStatus::Cancelled;
                review.resolved_at = Some(now);
                cancelled += 1;
            }
            cancelled
        })
    }

    /// Aggregate metrics over persisted runs
    pub fn query_metrics(&self, session_id: Option<&str>) -> RunMetrics {
        let store = self.lock();

        let runs: Vec<_> = store
            .runs
            .iter()
            .filter(|r| session_id.map_or(true, |s| r.session_id == s))
            .collect();

        let count_status =
            |status: RunStatus| runs.iter().filter(|r| r.status == status).count();

        let durations: Vec<_> = runs
            .iter()
            .filter_map(|r| {
                r.completed_at
                    .map(|completed| (completed - r.started_at).num_milliseconds().max(0) as u64)
            })
            .collect();

        let avg_duration_ms = if !durations.is_empty() {
            durations.iter().sum::<u64>() / durations.len() as u64
        } else {
            0
        };

        let avg_revisions = if !runs.is_empty() {
            runs.iter().map(|r| r.state.revision_count as f64).sum::<f64>() / runs.len() as f64
        } else {
            0.0
        };

        RunMetrics {
            run_count: runs.len(),
            completed_count: count_status(RunStatus::Completed),
            failed_count: count_status(RunStatus::Failed),
            cancelled_count: count_status(RunStatus::Cancelled),
            awaiting_review_count: count_status(RunStatus::AwaitingReview),
            escalation_count: runs.iter().map(|r| r.escalations as usize).sum(),
            avg_revisions,
            avg_duration_ms,
        }
    }
}

/// Run metrics
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub run_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub cancelled_count: usize,
    pub awaiting_review_count: usize,
    /// HITL suspensions across all runs
    pub escalation_count: usize,
    pub avg_revisions: f64,
    pub avg_duration_ms: u64,
}

impl RunMetrics {
    /// Percentage of runs that reached DONE (0.0 to 100.0)
    pub fn success_rate(&self) -> f64 {
        if self.run_count == 0 {
            return 0.0;
        }
        (self.completed_count as f64 / self.run_count as f64) * 100.0
    }

    /// Percentage of runs that failed or were cancelled (0.0 to 100.0)
    pub fn failure_rate(&self) -> f64 {
        if self.run_count == 0 {
            return 0.0;
        }
        ((self.failed_count + self.cancelled_count) as f64 / self.run_count as f64) * 100.0
    }
}
