//! Pipeline transition loop

use crate::models::workflow::{
    AgentResult, EscalationReason, FailureKind, ReviewRequest, RevisionRecord, RunStatus, Stage,
    StagePayload, TraceEntry, TransitionType, WorkflowState,
};
use crate::services::logging::{log_escalation, log_invariant_violation, log_stage_event};
use crate::services::retrieval::{retrieval_query, NoRetrieval, Retriever};
use crate::workflow::agent::{AgentRegistry, StageConfig};
use crate::workflow::error::WorkflowError;
use crate::workflow::hitl::{allowed_decisions, HitlGate, PendingReviewHandle};
use crate::workflow::persistence::WorkflowPersistence;
use crate::workflow::policy::{EscalationPolicy, Transition};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

/// Where a call to [`PipelineEngine::drive`] stopped
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Reached DONE
    Completed(WorkflowState),
    /// Waiting for a reviewer; continue with the handle
    Suspended {
        handle: PendingReviewHandle,
        state: WorkflowState,
    },
    /// Reached FAILED; the trace is kept for diagnosis
    Failed(WorkflowState),
}

impl RunOutcome {
    pub fn state(&self) -> &WorkflowState {
        match self {
            RunOutcome::Completed(state) | RunOutcome::Failed(state) => state,
            RunOutcome::Suspended { state, .. } => state,
        }
    }

    pub fn into_state(self) -> WorkflowState {
        match self {
            RunOutcome::Completed(state) | RunOutcome::Failed(state) => state,
            RunOutcome::Suspended { state, .. } => state,
        }
    }

    pub fn handle(&self) -> Option<PendingReviewHandle> {
        match self {
            RunOutcome::Suspended { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed(_) => RunStatus::Completed,
            RunOutcome::Suspended { .. } => RunStatus::AwaitingReview,
            RunOutcome::Failed(_) => RunStatus::Failed,
        }
    }
}

/// Drives a run through the stage pipeline until it finishes or suspends
pub struct PipelineEngine {
    /// Agent per stage
    registry: AgentRegistry,
    /// Retry / escalation rules
    policy: EscalationPolicy,
    /// Context source for the explanation stage
    retriever: Arc<dyn Retriever>,
    /// Snippets requested per retrieval
    retrieval_top_k: usize,
    /// HITL gate
    gate: Arc<HitlGate>,
    /// Persistence layer
    persistence: Arc<WorkflowPersistence>,
}

impl PipelineEngine {
    /// Create new engine without retrieval
    pub fn new(
        registry: AgentRegistry,
        policy: EscalationPolicy,
        gate: Arc<HitlGate>,
        persistence: Arc<WorkflowPersistence>,
    ) -> Self {
        Self {
            registry,
            policy,
            retriever: Arc::new(NoRetrieval),
            retrieval_top_k: 0,
            gate,
            persistence,
        }
    }

    /// Attach a retriever queried before the explanation stage
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>, top_k: usize) -> Self {
        self.retriever = retriever;
        self.retrieval_top_k = top_k;
        self
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Run stages from the state's current stage until DONE, FAILED or HITL
    ///
    /// Stage failures and broken invariants end up in the returned outcome.
    /// `Err` is reserved for persistence problems and for runs that another
    /// process finished meanwhile ([`WorkflowError::RunFinished`]).
    pub async fn drive(&self, mut state: WorkflowState) -> Result<RunOutcome, WorkflowError> {
        loop {
            let stage = state.stage;
            match stage {
                Stage::Done => {
                    if state.completed_at.is_none() {
                        state.completed_at = Some(Utc::now());
                    }
                    self.checkpoint(&state, RunStatus::Completed)?;
                    tracing::info!("Run {} completed: {}", state.run_id, state.outcome_message());
                    return Ok(RunOutcome::Completed(state));
                }
                Stage::Failed => {
                    self.checkpoint(&state, RunStatus::Failed)?;
                    tracing::error!("Run {} failed: {}", state.run_id, state.outcome_message());
                    return Ok(RunOutcome::Failed(state));
                }
                Stage::Hitl => {
                    let handle = self.gate.suspend(&state)?;
                    return Ok(RunOutcome::Suspended { handle, state });
                }
                _ => {}
            }

            if let Err(e) = state.check_prerequisites(stage) {
                state = invariant_failure(state, stage, violation_message(e));
                continue;
            }

            let Some(agent) = self.registry.get(stage) else {
                state = invariant_failure(state, stage, "no agent registered".to_string());
                continue;
            };

            if stage == Stage::Explain && state.retrieved_context.is_empty() {
                self.attach_context(&mut state).await;
            }

            let attempt = state.attempts(stage) + 1;
            let config = StageConfig {
                stage,
                attempt,
                max_attempts: self.policy.max_attempts(stage),
                retry_hint: state.retry_hint.clone(),
                confidence_threshold: self.policy.config().confidence_threshold(stage),
            };

            tracing::debug!(
                "Run {} invoking '{}' agent (attempt {}/{})",
                state.run_id,
                stage,
                attempt,
                config.max_attempts
            );

            let start_time = Instant::now();
            let result = agent.run(&state, &config).await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let merged = match state.merge(&result) {
                Ok(merged) => merged,
                Err(e) => {
                    state = invariant_failure(state, stage, violation_message(e));
                    continue;
                }
            };

            let transition = self.policy.decide(
                stage,
                &result,
                &merged.attempt_counts,
                merged.revision_count,
            );

            state = apply_transition(state, merged, &result, attempt, duration_ms, transition);

            if state.stage.is_agent_stage() {
                self.checkpoint(&state, RunStatus::Running)?;
            }
        }
    }

    /// Persist a snapshot, stopping the run if it was finished elsewhere
    fn checkpoint(&self, state: &WorkflowState, status: RunStatus) -> Result<(), WorkflowError> {
        let saved = self.persistence.save_run(state, status);
        if let Err(WorkflowError::RunFinished { status: stored, .. }) = &saved {
            tracing::warn!(
                "Run {} was finished as {:?} elsewhere; stopping at '{}'",
                state.run_id,
                stored,
                state.stage
            );
        }
        saved
    }

    /// Query the retriever with the parsed problem; failures leave the context empty
    async fn attach_context(&self, state: &mut WorkflowState) {
        if self.retrieval_top_k == 0 {
            return;
        }
        let Some(query) = retrieval_query(state) else {
            return;
        };

        match self.retriever.retrieve(&query, self.retrieval_top_k).await {
            Ok(snippets) if !snippets.is_empty() => {
                let sources: Vec<_> = snippets.iter().map(|s| s.source.clone()).collect();
                let count = snippets.len();
                state.retrieved_context = snippets;
                state.push_trace(
                    TraceEntry::transition(
                        Some(Stage::Explain),
                        Stage::Explain,
                        TransitionType::ContextAttached,
                    )
                    .with_notes(format!("{} snippets attached", count))
                    .with_output(serde_json::json!({ "sources": sources })),
                );
            }
            Ok(_) => {
                tracing::debug!("No knowledge found for run {}", state.run_id);
            }
            Err(e) => {
                tracing::warn!(
                    "Retrieval failed for run {}, continuing without context: {:#}",
                    state.run_id,
                    e
                );
            }
        }
    }
}

/// Build the next state for a policy decision
///
/// `before` is the state the agent saw, `merged` the state with its result
/// merged in.
fn apply_transition(
    before: WorkflowState,
    merged: WorkflowState,
    result: &AgentResult,
    attempt: u32,
    duration_ms: u64,
    transition: Transition,
) -> WorkflowState {
    let stage = before.stage;
    let run_id = before.run_id;

    match transition {
        Transition::Advance { next } => {
            let mut state = merged;
            state.stage = next;
            if next == Stage::Done {
                state.completed_at = Some(Utc::now());
            }
            state.push_trace(
                TraceEntry::transition(Some(stage), next, TransitionType::Advance)
                    .with_result(result, attempt)
                    .with_duration(duration_ms),
            );
            log_stage_event(run_id, stage, next, TransitionType::Advance, None);
            state
        }
        Transition::Retry { hint } => {
            let mut state = merged;
            tracing::warn!(
                "Stage '{}' of run {} failed attempt {}, retrying",
                stage,
                run_id,
                attempt
            );
            state.retry_hint = hint;
            state.push_trace(
                TraceEntry::transition(Some(stage), stage, TransitionType::Retry)
                    .with_result(result, attempt)
                    .with_duration(duration_ms),
            );
            state
        }
        Transition::Revise => {
            let revision = merged.revision_count + 1;
            let issues = merged
                .verification_result
                .as_ref()
                .map(|report| report.issues.clone())
                .unwrap_or_default();
            let record = RevisionRecord {
                revision,
                rejected_answer: merged.solution.as_ref().map(|s| s.final_answer.clone()),
                issues: issues.clone(),
                confidence: result.confidence,
                timestamp: Utc::now(),
            };

            let mut state = merged.rewind_to(Stage::Solve);
            state.revision_count = revision;
            state.revision_history.push(record);
            if !issues.is_empty() {
                state.retry_hint = Some(format!("Verifier rejected the solution: {}", issues.join("; ")));
            }
            state.push_trace(
                TraceEntry::transition(Some(stage), Stage::Solve, TransitionType::Revision)
                    .with_result(result, attempt)
                    .with_duration(duration_ms),
            );
            log_stage_event(
                run_id,
                stage,
                Stage::Solve,
                TransitionType::Revision,
                Some(&format!("revision {}", revision)),
            );
            state
        }
        Transition::Escalate(reason) => {
            // Confidence gating does not consume an attempt
            let mut state = match reason {
                EscalationReason::LowConfidence { .. } => before,
                _ => merged,
            };
            let payload: Option<StagePayload> = result.payload.clone();
            let revision_history = match reason {
                EscalationReason::RevisionsExhausted { .. } => state.revision_history.clone(),
                _ => Vec::new(),
            };

            log_escalation(run_id, stage, &reason);

            state.pending_human_review = Some(ReviewRequest {
                stage,
                allowed_decisions: allowed_decisions(&state, stage, &reason, payload.as_ref()),
                reason,
                payload,
                confidence: result.confidence,
                notes: result.notes.clone(),
                revision_history,
                requested_at: Utc::now(),
            });
            state.stage = Stage::Hitl;
            state.push_trace(
                TraceEntry::transition(Some(stage), Stage::Hitl, TransitionType::Escalated)
                    .with_result(result, attempt)
                    .with_duration(duration_ms),
            );
            state
        }
        Transition::Fail { reason } => {
            let mut state = merged;
            state.push_trace(
                TraceEntry::transition(Some(stage), Stage::Failed, TransitionType::Fatal)
                    .with_result(result, attempt)
                    .with_duration(duration_ms),
            );
            state.fail(FailureKind::FatalStage, reason)
        }
    }
}

fn violation_message(error: WorkflowError) -> String {
    match error {
        WorkflowError::InvariantViolation { message, .. } => message,
        other => other.to_string(),
    }
}

/// Terminate the run after a broken precondition
fn invariant_failure(mut state: WorkflowState, stage: Stage, message: String) -> WorkflowState {
    log_invariant_violation(state.run_id, stage, &message);
    state.push_trace(
        TraceEntry::transition(Some(stage), Stage::Failed, TransitionType::InvariantViolation)
            .with_notes(message.clone()),
    );
    state.fail(FailureKind::InvariantViolation, message)
}
