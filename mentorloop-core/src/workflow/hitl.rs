//! Human-in-the-loop gate
//!
//! Suspending a run persists its state together with a review record and
//! hands back a [`PendingReviewHandle`]. Nothing waits on the handle: a
//! reviewer resolves it later, possibly from another process, and the run
//! is continued from the state returned by [`HitlGate::resume`].

use crate::models::workflow::{
    DecisionKind, EscalationReason, FailureKind, HumanDecision, ReviewRecord, ReviewRequest,
    ReviewStatus, RunStatus, Stage, StagePayload, TraceEntry, TransitionType, WorkflowState,
};
use crate::workflow::error::WorkflowError;
use crate::workflow::persistence::WorkflowPersistence;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque reference to a pending review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingReviewHandle(Uuid);

impl PendingReviewHandle {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for PendingReviewHandle {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for PendingReviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PendingReviewHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Decisions that make sense for a review of `stage`
///
/// Accepting is only offered when there is something to accept: the
/// offending payload, or an output the stage already produced. A verifier
/// that kept rejecting the solution cannot be accepted; the reviewer has to
/// correct the verdict instead.
pub fn allowed_decisions(
    state: &WorkflowState,
    stage: Stage,
    reason: &EscalationReason,
    payload: Option<&StagePayload>,
) -> Vec<DecisionKind> {
    let mut decisions = Vec::with_capacity(4);
    let acceptable = !matches!(reason, EscalationReason::RevisionsExhausted { .. })
        && (payload.is_some() || state.has_output(stage));
    if acceptable {
        decisions.push(DecisionKind::Accept);
    }
    decisions.extend([DecisionKind::Correct, DecisionKind::Retry, DecisionKind::Abort]);
    decisions
}

impl ReviewRequest {
    /// Human-readable explanation of why the review is needed
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Review needed at stage '{}': {}",
            self.stage, self.reason
        )];

        if let Some(confidence) = self.confidence {
            lines.push(format!("Confidence: {:.0}%", confidence * 100.0));
        }
        if let Some(notes) = &self.notes {
            lines.push(format!("Notes: {}", notes));
        }
        if let Some(payload) = &self.payload {
            if let Ok(json) = serde_json::to_string(payload) {
                lines.push(format!("Output: {}", json));
            }
        }

        if matches!(self.reason, EscalationReason::RevisionsExhausted { .. }) {
            for record in &self.revision_history {
                lines.push(format!(
                    "Revision {}: {} ({})",
                    record.revision,
                    record.rejected_answer.as_deref().unwrap_or("no answer"),
                    if record.issues.is_empty() {
                        "no issues reported".to_string()
                    } else {
                        record.issues.join("; ")
                    }
                ));
            }
        }

        let options: Vec<_> = self
            .allowed_decisions
            .iter()
            .map(|d| match d {
                DecisionKind::Accept => "accept",
                DecisionKind::Correct => "correct",
                DecisionKind::Retry => "retry",
                DecisionKind::Abort => "abort",
            })
            .collect();
        lines.push(format!("Options: {}", options.join(" / ")));

        lines.join("\n")
    }
}

/// Suspends runs for human review and applies reviewer decisions
pub struct HitlGate {
    persistence: Arc<WorkflowPersistence>,
}

impl HitlGate {
    pub fn new(persistence: Arc<WorkflowPersistence>) -> Self {
        Self { persistence }
    }

    /// Persist a run waiting in HITL and return the handle of its review
    ///
    /// Suspending the same unresumed state again returns the existing handle.
    pub fn suspend(&self, state: &WorkflowState) -> Result<PendingReviewHandle, WorkflowError> {
        let request = match (&state.stage, &state.pending_human_review) {
            (Stage::Hitl, Some(request)) => request,
            (stage, _) => {
                return Err(WorkflowError::InvariantViolation {
                    stage: *stage,
                    message: "suspend requires a pending review at HITL".to_string(),
                })
            }
        };

        let record = ReviewRecord {
            handle: Uuid::new_v4(),
            run_id: state.run_id,
            session_id: state.session_id.clone(),
            stage: request.stage,
            fingerprint: state.fingerprint(),
            status: ReviewStatus::Pending,
            requested_at: request.requested_at,
            resolved_at: None,
            decision: None,
            reviewer: None,
            state: state.clone(),
        };
        let created = record.handle;

        self.persistence.save_run(state, RunStatus::AwaitingReview)?;
        let handle = self.persistence.insert_review_if_absent(record)?;

        if handle == created {
            tracing::info!(
                "Review {} created for run {} at stage '{}'",
                handle,
                state.run_id,
                request.stage
            );
        } else {
            tracing::debug!("Run {} already has pending review {}", state.run_id, handle);
        }

        Ok(PendingReviewHandle(handle))
    }

    /// Apply a reviewer decision and return the state to continue from
    ///
    /// Fails with [`WorkflowError::InvalidHandle`] when the handle is unknown
    /// or was already resolved. A decision rejected as invalid leaves the
    /// review pending.
    pub fn resume(
        &self,
        handle: PendingReviewHandle,
        decision: HumanDecision,
        reviewer: Option<String>,
    ) -> Result<WorkflowState, WorkflowError> {
        let review = self
            .persistence
            .get_review(handle.0)
            .filter(|r| r.status == ReviewStatus::Pending)
            .ok_or(WorkflowError::InvalidHandle(handle.0))?;

        let next = apply_decision(&review.state, &decision)?;

        // Only one caller can move the review out of pending
        self.persistence
            .resolve_review(handle.0, decision.kind(), reviewer.clone())?
            .ok_or(WorkflowError::InvalidHandle(handle.0))?;

        let status = if next.stage == Stage::Failed {
            RunStatus::Failed
        } else {
            RunStatus::Running
        };
        self.persistence.save_run(&next, status)?;

        tracing::info!(
            "Review {} resolved with {:?} by {}; run {} continues at '{}'",
            handle,
            decision.kind(),
            reviewer.as_deref().unwrap_or("unknown reviewer"),
            next.run_id,
            next.stage
        );

        Ok(next)
    }

    pub fn get(&self, handle: PendingReviewHandle) -> Option<ReviewRecord> {
        self.persistence.get_review(handle.0)
    }

    /// Pending reviews, optionally for a single run
    pub fn pending(&self, run_id: Option<Uuid>) -> Vec<ReviewRecord> {
        self.persistence.pending_reviews(run_id)
    }

    /// Withdraw every pending review of a run
    pub fn cancel(&self, run_id: Uuid) -> Result<usize, WorkflowError> {
        Ok(self.persistence.cancel_reviews(run_id)?)
    }
}

/// Compute the state that follows a reviewer decision
fn apply_decision(
    state: &WorkflowState,
    decision: &HumanDecision,
) -> Result<WorkflowState, WorkflowError> {
    let request = match (&state.stage, &state.pending_human_review) {
        (Stage::Hitl, Some(request)) => request.clone(),
        (stage, _) => {
            return Err(WorkflowError::InvariantViolation {
                stage: *stage,
                message: "review state is not waiting in HITL".to_string(),
            })
        }
    };
    let stage = request.stage;

    if !request.allowed_decisions.contains(&decision.kind()) {
        return Err(WorkflowError::InvalidDecision {
            stage,
            message: format!("{:?} is not offered for this review", decision.kind()),
        });
    }

    let next = match decision {
        HumanDecision::Accept => {
            let mut next = state.clone();
            match request.payload.clone() {
                Some(payload) => next.set_output(payload),
                None if state.has_output(stage) => {}
                None => {
                    return Err(WorkflowError::InvalidDecision {
                        stage,
                        message: "there is no output to accept".to_string(),
                    })
                }
            }
            advance_past(next, stage, TransitionType::HumanAccepted, None)
        }
        HumanDecision::Correct { value } => {
            if value.stage() != stage {
                return Err(WorkflowError::InvalidDecision {
                    stage,
                    message: format!(
                        "a '{}' value cannot correct stage '{}'",
                        value.stage(),
                        stage
                    ),
                });
            }
            let mut next = state.clone();
            next.set_output(value.clone());
            let output = serde_json::to_value(value).ok();
            advance_past(next, stage, TransitionType::HumanCorrected, output)
        }
        HumanDecision::Retry { hint } => {
            let mut next = state.rewind_to(stage);
            next.retry_hint = hint.clone();
            let mut entry = TraceEntry::transition(Some(Stage::Hitl), stage, TransitionType::HumanRetry);
            if let Some(hint) = hint {
                entry = entry.with_notes(hint.clone());
            }
            next.push_trace(entry);
            next
        }
        HumanDecision::Abort { reason } => {
            let reason = reason
                .clone()
                .unwrap_or_else(|| "aborted by reviewer".to_string());
            let mut next = state
                .clone()
                .fail(FailureKind::HumanAborted, reason.clone());
            next.push_trace(
                TraceEntry::transition(Some(Stage::Hitl), Stage::Failed, TransitionType::HumanAborted)
                    .with_notes(reason),
            );
            next
        }
    };

    Ok(next)
}

fn advance_past(
    mut state: WorkflowState,
    stage: Stage,
    transition_type: TransitionType,
    output: Option<serde_json::Value>,
) -> WorkflowState {
    let target = stage.next();
    state.stage = target;
    state.pending_human_review = None;
    // A hint only applies to another attempt of the stage that earned it
    state.retry_hint = None;
    if target == Stage::Done {
        state.completed_at = Some(Utc::now());
    }

    let mut entry = TraceEntry::transition(Some(Stage::Hitl), target, transition_type);
    if let Some(output) = output {
        entry = entry.with_output(output);
    }
    state.push_trace(entry);
    state
}
