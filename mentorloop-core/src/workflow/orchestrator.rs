//! Run lifecycle management

use crate::memory::{validate_session_id, JsonSessionStore, SessionMemory};
use crate::models::configuration::Configuration;
use crate::models::workflow::{
    FailureKind, HumanDecision, RawInput, ReviewRecord, RunRecord, RunStatus, Stage, TraceEntry,
    TransitionType, WorkflowState,
};
use crate::services::input::{ExternalInputNormalizer, InputNormalizer, TextInputNormalizer};
use crate::services::retrieval::KnowledgeBaseRetriever;
use crate::workflow::agent::AgentRegistry;
use crate::workflow::engine::{PipelineEngine, RunOutcome};
use crate::workflow::error::WorkflowError;
use crate::workflow::hitl::{HitlGate, PendingReviewHandle};
use crate::workflow::persistence::{RunMetrics, WorkflowPersistence};
use crate::workflow::policy::EscalationPolicy;
use anyhow::{anyhow, Context};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

type RunTask = JoinHandle<Result<RunOutcome, WorkflowError>>;

/// Entry point for starting, resuming and cancelling runs
pub struct WorkflowOrchestrator {
    /// Runs executing in background tasks
    active_runs: Arc<DashMap<Uuid, RunTask>>,
    engine: Arc<PipelineEngine>,
    gate: Arc<HitlGate>,
    persistence: Arc<WorkflowPersistence>,
    memory: Arc<dyn SessionMemory>,
    normalizer: Arc<dyn InputNormalizer>,
}

impl WorkflowOrchestrator {
    /// Create new orchestrator accepting text input only
    pub fn new(
        engine: PipelineEngine,
        gate: Arc<HitlGate>,
        persistence: Arc<WorkflowPersistence>,
        memory: Arc<dyn SessionMemory>,
    ) -> Self {
        Self {
            active_runs: Arc::new(DashMap::new()),
            engine: Arc::new(engine),
            gate,
            persistence,
            memory,
            normalizer: Arc::new(TextInputNormalizer),
        }
    }

    /// Build every collaborator from configuration, storing data under the data directory
    pub fn from_config(config: &Configuration, registry: AgentRegistry) -> anyhow::Result<Self> {
        let data_dir = config.data_dir();
        let persistence = Arc::new(
            WorkflowPersistence::new(data_dir.join("runs.json"))
                .context("Failed to open run store")?,
        );
        let memory = Arc::new(
            JsonSessionStore::new(data_dir.join("sessions"))
                .context("Failed to open session store")?,
        );
        let gate = Arc::new(HitlGate::new(persistence.clone()));

        let mut engine = PipelineEngine::new(
            registry,
            EscalationPolicy::new(config.policy.clone()),
            gate.clone(),
            persistence.clone(),
        );
        if config.retrieval.knowledge_dir.is_some() {
            let retriever = KnowledgeBaseRetriever::from_config(&config.retrieval)
                .context("Failed to load knowledge base")?;
            engine = engine.with_retriever(Arc::new(retriever), config.retrieval.top_k);
        }

        Ok(Self::new(engine, gate, persistence, memory)
            .with_normalizer(Arc::new(ExternalInputNormalizer::new(&config.input))))
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn InputNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn gate(&self) -> Arc<HitlGate> {
        self.gate.clone()
    }

    /// Normalize input and create the initial state, persisted as running
    async fn prepare(
        &self,
        session_id: Option<String>,
        input: RawInput,
    ) -> Result<WorkflowState, WorkflowError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_session_id(&session_id)?;
        let text = self.normalizer.normalize(&input).await?;
        let state = WorkflowState::new(session_id, input, text);
        self.persistence.save_run(&state, RunStatus::Running)?;

        tracing::info!(
            "Started run {} in session {}",
            state.run_id,
            state.session_id
        );
        Ok(state)
    }

    /// Run a new problem until it finishes or suspends for review
    ///
    /// Unusable input fails with `UnrecognizedInput`, and a session id that
    /// cannot be stored with `InvalidSessionId`, before any run exists.
    pub async fn start(
        &self,
        session_id: Option<String>,
        input: RawInput,
    ) -> Result<RunOutcome, WorkflowError> {
        let state = self.prepare(session_id, input).await?;
        drive_and_record(&self.engine, self.memory.as_ref(), state).await
    }

    /// Start a run in a background task and return its id
    pub async fn spawn(
        &self,
        session_id: Option<String>,
        input: RawInput,
    ) -> Result<Uuid, WorkflowError> {
        let state = self.prepare(session_id, input).await?;
        let run_id = state.run_id;

        let engine = self.engine.clone();
        let memory = self.memory.clone();
        let handle = tokio::spawn(async move {
            let outcome = drive_and_record(&engine, memory.as_ref(), state).await;
            tracing::debug!("Run task {} finished", run_id);
            outcome
        });

        self.active_runs.insert(run_id, handle);
        Ok(run_id)
    }

    /// Check if a run is executing in a background task
    pub fn is_running(&self, run_id: Uuid) -> bool {
        self.active_runs.contains_key(&run_id)
    }

    /// Get count of background runs
    pub fn active_count(&self) -> usize {
        self.active_runs.len()
    }

    /// Wait for a background run to finish or suspend
    ///
    /// Runs not driven by this orchestrator report their persisted outcome;
    /// `RunNotFound` is returned when there is none yet.
    pub async fn wait(&self, run_id: Uuid) -> Result<RunOutcome, WorkflowError> {
        if let Some((_key, handle)) = self.active_runs.remove(&run_id) {
            match handle.await {
                Ok(outcome) => return outcome,
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return Err(WorkflowError::Persistence(anyhow!(
                        "Run task {} panicked: {}",
                        run_id,
                        e
                    )))
                }
            }
        }

        // Not running here; report the persisted snapshot
        let record = self
            .persistence
            .get_run(run_id)
            .ok_or(WorkflowError::RunNotFound(run_id))?;
        outcome_from_record(&self.gate, record).ok_or(WorkflowError::RunNotFound(run_id))
    }

    /// Apply a reviewer decision and continue the run
    pub async fn resume(
        &self,
        handle: PendingReviewHandle,
        decision: HumanDecision,
        reviewer: Option<String>,
    ) -> Result<RunOutcome, WorkflowError> {
        let state = self.gate.resume(handle, decision, reviewer)?;
        drive_and_record(&self.engine, self.memory.as_ref(), state).await
    }

    /// Continue a run left running by an interrupted process
    pub async fn recover(&self, run_id: Uuid) -> Result<RunOutcome, WorkflowError> {
        let record = self
            .persistence
            .get_run(run_id)
            .ok_or(WorkflowError::RunNotFound(run_id))?;

        if record.status != RunStatus::Running || self.is_running(run_id) {
            return outcome_from_record(&self.gate, record)
                .ok_or(WorkflowError::RunNotFound(run_id));
        }

        tracing::info!("Recovering run {} at stage '{}'", run_id, record.stage);
        drive_and_record(&self.engine, self.memory.as_ref(), record.state).await
    }

    /// Stop a run, withdrawing its pending reviews
    ///
    /// Finished runs are returned unchanged.
    pub async fn cancel(
        &self,
        run_id: Uuid,
        reason: Option<String>,
    ) -> Result<WorkflowState, WorkflowError> {
        if let Some((_key, handle)) = self.active_runs.remove(&run_id) {
            handle.abort();
            // Let the task unwind so it cannot write after the cancellation
            let _ = handle.await;
        }

        let record = self
            .persistence
            .get_run(run_id)
            .ok_or(WorkflowError::RunNotFound(run_id))?;

        if record.status.is_finished() {
            tracing::info!("Run {} already finished as {:?}", run_id, record.status);
            return Ok(record.state);
        }

        let withdrawn = self.gate.cancel(run_id)?;
        let reason = reason.unwrap_or_else(|| "cancelled by caller".to_string());

        let mut state = record.state;
        let from = state.stage;
        state.push_trace(
            TraceEntry::transition(Some(from), Stage::Failed, TransitionType::Cancelled)
                .with_notes(reason.clone()),
        );
        let state = state.fail(FailureKind::Cancelled, reason);

        self.persistence.save_run(&state, RunStatus::Cancelled)?;
        self.memory.append(&state).await?;

        tracing::info!(
            "Cancelled run {} ({} pending reviews withdrawn)",
            run_id,
            withdrawn
        );
        Ok(state)
    }

    pub fn get_run(&self, run_id: Uuid) -> Option<RunRecord> {
        self.persistence.get_run(run_id)
    }

    /// Full trace of a run
    pub fn trace(&self, run_id: Uuid) -> Result<Vec<TraceEntry>, WorkflowError> {
        self.persistence
            .get_run(run_id)
            .map(|record| record.state.trace)
            .ok_or(WorkflowError::RunNotFound(run_id))
    }

    pub fn pending_reviews(&self, run_id: Option<Uuid>) -> Vec<ReviewRecord> {
        self.gate.pending(run_id)
    }

    /// Runs a crash left running or waiting for review
    pub fn find_incomplete_runs(&self) -> Vec<RunRecord> {
        self.persistence.find_incomplete_runs()
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<WorkflowState>, WorkflowError> {
        Ok(self.memory.load_history(session_id).await?)
    }

    pub fn metrics(&self, session_id: Option<&str>) -> RunMetrics {
        self.persistence.query_metrics(session_id)
    }
}

/// Drive a run and hand finished states to session memory
async fn drive_and_record(
    engine: &PipelineEngine,
    memory: &dyn SessionMemory,
    state: WorkflowState,
) -> Result<RunOutcome, WorkflowError> {
    let outcome = engine.drive(state).await?;

    match &outcome {
        RunOutcome::Completed(state) | RunOutcome::Failed(state) => {
            memory.append(state).await?;
        }
        RunOutcome::Suspended { handle, state } => {
            tracing::info!(
                "Run {} waiting for review {}",
                state.run_id,
                handle
            );
        }
    }

    Ok(outcome)
}

/// Outcome of a persisted run, `None` while it is still executing
fn outcome_from_record(gate: &HitlGate, record: RunRecord) -> Option<RunOutcome> {
    match record.status {
        RunStatus::Completed => Some(RunOutcome::Completed(record.state)),
        RunStatus::Failed | RunStatus::Cancelled => Some(RunOutcome::Failed(record.state)),
        RunStatus::AwaitingReview => {
            let review = gate.pending(Some(record.run_id)).into_iter().next()?;
            Some(RunOutcome::Suspended {
                handle: PendingReviewHandle::from(review.handle),
                state: record.state,
            })
        }
        RunStatus::Running => None,
    }
}
