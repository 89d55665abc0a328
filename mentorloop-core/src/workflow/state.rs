//! Immutable-update operations on the workflow state

use crate::models::workflow::{
    AgentResult, AgentStatus, FailureInfo, FailureKind, RawInput, Stage, StagePayload,
    TraceEntry, TransitionType, WorkflowState,
};
use crate::workflow::error::WorkflowError;
use chrono::Utc;
use std::collections::BTreeMap;
use uuid::Uuid;

impl TraceEntry {
    /// New entry; sequence and timestamp are assigned by [`WorkflowState::push_trace`]
    pub fn transition(from: Option<Stage>, to: Stage, transition_type: TransitionType) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            from_stage: from,
            to_stage: to,
            transition_type,
            status: None,
            attempt: None,
            confidence: None,
            duration_ms: None,
            notes: None,
            output: None,
        }
    }

    /// Copy status, confidence, notes and payload of an agent result
    pub fn with_result(mut self, result: &AgentResult, attempt: u32) -> Self {
        self.status = Some(result.status);
        self.attempt = Some(attempt);
        self.confidence = result.confidence;
        self.notes = result.notes.clone();
        self.output = result
            .payload
            .as_ref()
            .and_then(|p| serde_json::to_value(p).ok());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

impl WorkflowState {
    /// Create the state for a new run, starting at intent routing
    pub fn new(
        session_id: impl Into<String>,
        raw_input: RawInput,
        input_text: impl Into<String>,
    ) -> Self {
        let mut state = Self {
            run_id: Uuid::new_v4(),
            session_id: session_id.into(),
            raw_input,
            input_text: input_text.into(),
            stage: Stage::IntentRoute,
            intent: None,
            normalized_input: None,
            parsed_expression: None,
            solution: None,
            explanation: None,
            verification_result: None,
            evaluation_result: None,
            guardrail_result: None,
            retrieved_context: Vec::new(),
            attempt_counts: BTreeMap::new(),
            revision_count: 0,
            revision_history: Vec::new(),
            pending_human_review: None,
            retry_hint: None,
            failure: None,
            trace: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        };
        state.push_trace(TraceEntry::transition(
            None,
            Stage::IntentRoute,
            TransitionType::Initial,
        ));
        state
    }

    /// Agent invocations made so far at `stage`
    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempt_counts.get(&stage).copied().unwrap_or(0)
    }

    /// Whether the field produced by `stage` is populated
    pub fn has_output(&self, stage: Stage) -> bool {
        match stage {
            Stage::IntentRoute => self.intent.is_some(),
            Stage::Normalize => self.normalized_input.is_some(),
            Stage::Parse => self.parsed_expression.is_some(),
            Stage::Solve => self.solution.is_some(),
            Stage::Explain => self.explanation.is_some(),
            Stage::Verify => self.verification_result.is_some(),
            Stage::Evaluate => self.evaluation_result.is_some(),
            Stage::Guardrail => self.guardrail_result.is_some(),
            Stage::Done | Stage::Hitl | Stage::Failed => false,
        }
    }

    /// Agent stages whose output is populated, in pipeline order
    pub fn populated_stages(&self) -> Vec<Stage> {
        Stage::PIPELINE
            .iter()
            .copied()
            .filter(|s| self.has_output(*s))
            .collect()
    }

    /// Output of `stage` wrapped as a payload
    pub fn output(&self, stage: Stage) -> Option<StagePayload> {
        match stage {
            Stage::IntentRoute => self.intent.clone().map(StagePayload::IntentRoute),
            Stage::Normalize => self.normalized_input.clone().map(StagePayload::Normalize),
            Stage::Parse => self.parsed_expression.clone().map(StagePayload::Parse),
            Stage::Solve => self.solution.clone().map(StagePayload::Solve),
            Stage::Explain => self.explanation.clone().map(StagePayload::Explain),
            Stage::Verify => self.verification_result.clone().map(StagePayload::Verify),
            Stage::Evaluate => self.evaluation_result.clone().map(StagePayload::Evaluate),
            Stage::Guardrail => self.guardrail_result.clone().map(StagePayload::Guardrail),
            Stage::Done | Stage::Hitl | Stage::Failed => None,
        }
    }

    /// Populate the field matching the payload's stage
    pub fn set_output(&mut self, payload: StagePayload) {
        match payload {
            StagePayload::IntentRoute(v) => self.intent = Some(v),
            StagePayload::Normalize(v) => self.normalized_input = Some(v),
            StagePayload::Parse(v) => self.parsed_expression = Some(v),
            StagePayload::Solve(v) => self.solution = Some(v),
            StagePayload::Explain(v) => self.explanation = Some(v),
            StagePayload::Verify(v) => self.verification_result = Some(v),
            StagePayload::Evaluate(v) => self.evaluation_result = Some(v),
            StagePayload::Guardrail(v) => self.guardrail_result = Some(v),
        }
    }

    fn clear_output(&mut self, stage: Stage) {
        match stage {
            Stage::IntentRoute => self.intent = None,
            Stage::Normalize => self.normalized_input = None,
            Stage::Parse => self.parsed_expression = None,
            Stage::Solve => self.solution = None,
            Stage::Explain => self.explanation = None,
            Stage::Verify => self.verification_result = None,
            Stage::Evaluate => self.evaluation_result = None,
            Stage::Guardrail => self.guardrail_result = None,
            Stage::Done | Stage::Hitl | Stage::Failed => {}
        }
    }

    /// First earlier stage whose output is missing before `stage` may run
    pub fn missing_prerequisite(&self, stage: Stage) -> Option<Stage> {
        stage
            .predecessors()
            .iter()
            .copied()
            .find(|s| !self.has_output(*s))
    }

    /// Required-fields precondition for running `stage`
    pub fn check_prerequisites(&self, stage: Stage) -> Result<(), WorkflowError> {
        if !stage.is_agent_stage() {
            return Err(WorkflowError::InvariantViolation {
                stage,
                message: "no agent runs at this stage".to_string(),
            });
        }
        match self.missing_prerequisite(stage) {
            Some(missing) => Err(WorkflowError::InvariantViolation {
                stage,
                message: format!("output of stage '{}' is not populated", missing),
            }),
            None => Ok(()),
        }
    }

    /// Return a new state with the result merged in
    ///
    /// The attempt counter of the current stage is incremented. An `ok`
    /// result populates exactly the current stage's field; other statuses
    /// leave every field untouched. `self` is never modified.
    pub fn merge(&self, result: &AgentResult) -> Result<WorkflowState, WorkflowError> {
        let stage = self.stage;
        if !stage.is_agent_stage() {
            return Err(WorkflowError::InvariantViolation {
                stage,
                message: "merge outside an agent stage".to_string(),
            });
        }

        if let Some(confidence) = result.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(WorkflowError::InvariantViolation {
                    stage,
                    message: format!("confidence {} is outside [0, 1]", confidence),
                });
            }
        }

        if let Some(payload) = &result.payload {
            if payload.stage() != stage {
                return Err(WorkflowError::InvariantViolation {
                    stage,
                    message: format!("agent returned a '{}' payload", payload.stage()),
                });
            }
        }

        let mut next = self.clone();
        *next.attempt_counts.entry(stage).or_insert(0) += 1;
        next.retry_hint = None;

        if result.status == AgentStatus::Ok {
            let payload = result
                .payload
                .clone()
                .ok_or_else(|| WorkflowError::InvariantViolation {
                    stage,
                    message: "ok result without payload".to_string(),
                })?;
            next.set_output(payload);
        }

        Ok(next)
    }

    /// Return a copy with every output from `stage` onward cleared
    ///
    /// Attempt counters of the cleared stages restart at zero. Earlier
    /// outputs, revision bookkeeping and the trace are kept. Retrieved
    /// context is derived from the parsed problem and is dropped only when
    /// rewinding to parsing or earlier.
    pub fn rewind_to(&self, stage: Stage) -> WorkflowState {
        let mut next = self.clone();
        let Some(from) = stage.pipeline_index() else {
            return next;
        };

        for cleared in &Stage::PIPELINE[from..] {
            next.clear_output(*cleared);
            next.attempt_counts.remove(cleared);
        }

        if stage <= Stage::Parse {
            next.retrieved_context.clear();
        }

        next.stage = stage;
        next.pending_human_review = None;
        next
    }

    /// Append to the trace, assigning sequence and a non-decreasing timestamp
    pub fn push_trace(&mut self, mut entry: TraceEntry) {
        entry.sequence = self.trace.len() as u64;
        let now = Utc::now();
        entry.timestamp = match self.trace.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.trace.push(entry);
    }

    /// Move to FAILED, recording the last stage reached
    pub fn fail(mut self, kind: FailureKind, reason: impl Into<String>) -> WorkflowState {
        let last_stage = match &self.pending_human_review {
            Some(review) => review.stage,
            None => self.stage,
        };
        self.failure = Some(FailureInfo {
            kind,
            stage: last_stage,
            reason: reason.into(),
        });
        self.stage = Stage::Failed;
        self.pending_human_review = None;
        self.completed_at = Some(Utc::now());
        self
    }

    /// Identity of this snapshot, stable across repeated suspends
    pub fn fingerprint(&self) -> String {
        let stage = self
            .pending_human_review
            .as_ref()
            .map(|r| r.stage)
            .unwrap_or(self.stage);
        format!("{}:{}:{}", self.run_id, stage, self.trace.len())
    }

    /// Terminal message for the user
    pub fn outcome_message(&self) -> String {
        match (&self.stage, &self.failure) {
            (Stage::Done, _) => match &self.solution {
                Some(solution) => format!("Answer: {}", solution.final_answer),
                None => "Completed".to_string(),
            },
            (Stage::Failed, Some(failure)) => format!(
                "Failed at stage '{}' ({:?}): {}",
                failure.stage, failure.kind, failure.reason
            ),
            (Stage::Hitl, _) => match &self.pending_human_review {
                Some(review) => format!(
                    "Waiting for human review of stage '{}': {}",
                    review.stage, review.reason
                ),
                None => "Waiting for human review".to_string(),
            },
            (stage, _) => format!("In progress at stage '{}'", stage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::{IntentRoute, NormalizedInput, ParsedProblem};

    fn text_state(text: &str) -> WorkflowState {
        WorkflowState::new("session-1", RawInput::Text(text.to_string()), text)
    }

    #[test]
    fn test_new_state_has_initial_trace() {
        let state = text_state("2x = 4");
        assert_eq!(state.stage, Stage::IntentRoute);
        assert_eq!(state.trace.len(), 1);
        assert_eq!(state.trace[0].transition_type, TransitionType::Initial);
        assert!(state.populated_stages().is_empty());
    }

    #[test]
    fn test_merge_rejects_wrong_stage_payload() {
        let state = text_state("2x = 4");
        let result = AgentResult::ok(StagePayload::Normalize(NormalizedInput {
            text: "2x = 4".to_string(),
        }));

        let err = state.merge(&result).unwrap_err();
        assert!(matches!(err, WorkflowError::InvariantViolation { .. }));
    }

    #[test]
    fn test_merge_rejects_out_of_range_confidence() {
        let state = text_state("2x = 4");
        let result = AgentResult::ok(StagePayload::IntentRoute(IntentRoute {
            topic: "algebra".to_string(),
            subtopic: None,
            in_scope: true,
        }))
        .with_confidence(1.2);

        assert!(state.merge(&result).is_err());
    }

    #[test]
    fn test_merge_error_result_only_counts_attempt() {
        let state = text_state("2x = 4");
        let merged = state.merge(&AgentResult::retryable("timeout")).unwrap();
        assert_eq!(merged.attempts(Stage::IntentRoute), 1);
        assert!(merged.populated_stages().is_empty());
    }

    #[test]
    fn test_prerequisites() {
        let mut state = text_state("2x = 4");
        assert!(state.check_prerequisites(Stage::IntentRoute).is_ok());
        assert_eq!(state.missing_prerequisite(Stage::Parse), Some(Stage::IntentRoute));

        state.set_output(StagePayload::IntentRoute(IntentRoute {
            topic: "algebra".to_string(),
            subtopic: None,
            in_scope: true,
        }));
        state.set_output(StagePayload::Normalize(NormalizedInput {
            text: "2x = 4".to_string(),
        }));
        assert!(state.check_prerequisites(Stage::Parse).is_ok());
        assert!(state.check_prerequisites(Stage::Solve).is_err());
        assert!(state.check_prerequisites(Stage::Done).is_err());
    }

    #[test]
    fn test_rewind_to_parse_drops_context() {
        let mut state = text_state("2x = 4");
        state.set_output(StagePayload::Parse(ParsedProblem {
            expression: "2x = 4".to_string(),
            problem_type: None,
            variables: vec![],
            constraints: vec![],
        }));
        state.retrieved_context.push(crate::models::workflow::Snippet {
            source: "algebra.md".to_string(),
            text: "Divide both sides".to_string(),
            score: 0.7,
        });

        let rewound = state.rewind_to(Stage::Solve);
        assert_eq!(rewound.retrieved_context.len(), 1);

        let rewound = state.rewind_to(Stage::Parse);
        assert!(rewound.retrieved_context.is_empty());
        assert!(rewound.parsed_expression.is_none());
        assert_eq!(rewound.stage, Stage::Parse);
    }

    #[test]
    fn test_fail_records_reviewed_stage() {
        let state = text_state("");
        let failed = state.fail(FailureKind::FatalStage, "empty input");
        assert_eq!(failed.stage, Stage::Failed);
        let failure = failed.failure.as_ref().unwrap();
        assert_eq!(failure.stage, Stage::IntentRoute);
        assert!(failed.outcome_message().contains("empty input"));
        assert!(failed.completed_at.is_some());
    }
}
