//! Session memory
//!
//! Finished runs are appended to their session's history. Appends for one
//! session are serialized so the history order matches the append order.

use crate::models::workflow::{ProblemSession, Stage, Verdict, WorkflowState};
use crate::workflow::error::WorkflowError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use fs2::FileExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Reject session ids that cannot name a session file
pub fn validate_session_id(session_id: &str) -> Result<(), WorkflowError> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !session_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(WorkflowError::InvalidSessionId(session_id.to_string()))
    }
}

/// Append-only store of finished runs per session
#[async_trait]
pub trait SessionMemory: Send + Sync {
    /// Append a frozen run state to the history of `state.session_id`
    async fn append(&self, state: &WorkflowState) -> Result<()>;

    /// Runs of a session in insertion order; empty for unknown sessions
    async fn load_history(&self, session_id: &str) -> Result<Vec<WorkflowState>>;

    async fn load_session(&self, session_id: &str) -> Result<Option<ProblemSession>>;
}

fn new_session(state: &WorkflowState) -> ProblemSession {
    let now = Utc::now();
    ProblemSession {
        session_id: state.session_id.clone(),
        raw_input: state.raw_input.clone(),
        created_at: now,
        updated_at: now,
        history: Vec::new(),
    }
}

/// Session memory kept in process
#[derive(Default)]
pub struct InMemorySessionMemory {
    sessions: DashMap<String, ProblemSession>,
}

impl InMemorySessionMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionMemory for InMemorySessionMemory {
    async fn append(&self, state: &WorkflowState) -> Result<()> {
        // The entry guard holds the shard lock for the whole append
        let mut session = self
            .sessions
            .entry(state.session_id.clone())
            .or_insert_with(|| new_session(state));
        session.history.push(state.clone());
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn load_history(&self, session_id: &str) -> Result<Vec<WorkflowState>> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<ProblemSession>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }
}

/// Session memory stored as one JSON file per session
pub struct JsonSessionStore {
    dir: PathBuf,
    /// One lock per session id serializing appends within the process,
    /// present only while the session is in use
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl JsonSessionStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).context("Failed to create session directory")?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.json", session_id)))
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the session's lock once nobody else holds or waits on it
    fn release_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Read-modify-write of the session file under an exclusive file lock
    fn append_to_file(path: &Path, state: &WorkflowState) -> Result<usize> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .context("Failed to open session file for writing")?;
        file.lock_exclusive()
            .context("Failed to acquire write lock on session file")?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read session file")?;
        let mut session: ProblemSession = if contents.trim().is_empty() {
            new_session(state)
        } else {
            serde_json::from_str(&contents).context("Failed to parse session JSON")?
        };

        session.history.push(state.clone());
        session.updated_at = Utc::now();

        let json = serde_json::to_string_pretty(&session).context("Failed to serialize session")?;
        file.set_len(0).context("Failed to truncate session file")?;
        file.seek(SeekFrom::Start(0))
            .context("Failed to rewind session file")?;
        file.write_all(json.as_bytes())
            .context("Failed to write session file")?;
        file.flush().context("Failed to flush session file")?;

        Ok(session.history.len())
    }

    fn read_session(path: &Path) -> Result<Option<ProblemSession>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(path).context("Failed to open session file")?;
        file.lock_shared()
            .context("Failed to acquire read lock on session file")?;

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(file);
        reader
            .read_to_string(&mut contents)
            .context("Failed to read session file")?;

        if contents.trim().is_empty() {
            return Ok(None);
        }
        let session = serde_json::from_str(&contents).context("Failed to parse session JSON")?;
        Ok(Some(session))
    }
}

#[async_trait]
impl SessionMemory for JsonSessionStore {
    async fn append(&self, state: &WorkflowState) -> Result<()> {
        let path = self.session_path(&state.session_id)?;
        let lock = self.session_lock(&state.session_id);
        let appended = {
            let _guard = lock.lock().await;
            Self::append_to_file(&path, state)
        };
        self.release_lock(&state.session_id, lock);
        let runs = appended?;

        tracing::debug!(
            "Appended run {} to session {} ({} runs)",
            state.run_id,
            state.session_id,
            runs
        );
        Ok(())
    }

    async fn load_history(&self, session_id: &str) -> Result<Vec<WorkflowState>> {
        Ok(self
            .load_session(session_id)
            .await?
            .map(|s| s.history)
            .unwrap_or_default())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<ProblemSession>> {
        let path = self.session_path(session_id)?;
        let lock = self.session_lock(session_id);
        let session = {
            let _guard = lock.lock().await;
            Self::read_session(&path)
        };
        self.release_lock(session_id, lock);
        session
    }
}

/// Overview of a session's history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub total_runs: usize,
    pub completed: usize,
    pub failed: usize,
    /// Share of verified runs whose solution was judged correct (0.0 to 1.0)
    pub verified_rate: f64,
    /// How often each routed topic came up
    pub topics: BTreeMap<String, usize>,
}

/// Summarize a session history
pub fn summarize_history(session_id: &str, history: &[WorkflowState]) -> SessionSummary {
    let completed = history.iter().filter(|s| s.stage == Stage::Done).count();
    let failed = history.iter().filter(|s| s.stage == Stage::Failed).count();

    let verdicts: Vec<_> = history
        .iter()
        .filter_map(|s| s.verification_result.as_ref().map(|v| v.verdict))
        .collect();
    let verified_rate = if verdicts.is_empty() {
        0.0
    } else {
        verdicts.iter().filter(|v| **v == Verdict::Correct).count() as f64 / verdicts.len() as f64
    };

    let mut topics = BTreeMap::new();
    for intent in history.iter().filter_map(|s| s.intent.as_ref()) {
        *topics.entry(intent.topic.clone()).or_insert(0) += 1;
    }

    SessionSummary {
        session_id: session_id.to_string(),
        total_runs: history.len(),
        completed,
        failed,
        verified_rate,
        topics,
    }
}
