//! Tutoring pipeline data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Position of a run in the tutoring state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Classify topic and scope of the problem
    IntentRoute,
    /// Clean up notation and wording
    Normalize,
    /// Turn the normalized text into a structured problem
    Parse,
    /// Produce a worked solution
    Solve,
    /// Explain the solution to the student
    Explain,
    /// Check the solution for correctness
    Verify,
    /// Score the overall answer quality
    Evaluate,
    /// Safety, scope and citation checks
    Guardrail,
    /// Run finished with a validated answer
    Done,
    /// Waiting for a human decision
    Hitl,
    /// Run ended without an answer
    Failed,
}

impl Stage {
    /// Stages that are backed by an agent, in execution order
    pub const PIPELINE: [Stage; 8] = [
        Stage::IntentRoute,
        Stage::Normalize,
        Stage::Parse,
        Stage::Solve,
        Stage::Explain,
        Stage::Verify,
        Stage::Evaluate,
        Stage::Guardrail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::IntentRoute => "intent_route",
            Stage::Normalize => "normalize",
            Stage::Parse => "parse",
            Stage::Solve => "solve",
            Stage::Explain => "explain",
            Stage::Verify => "verify",
            Stage::Evaluate => "evaluate",
            Stage::Guardrail => "guardrail",
            Stage::Done => "done",
            Stage::Hitl => "hitl",
            Stage::Failed => "failed",
        }
    }

    /// Index in [`Stage::PIPELINE`], `None` for control stages
    pub fn pipeline_index(&self) -> Option<usize> {
        Self::PIPELINE.iter().position(|s| s == self)
    }

    /// Whether an agent runs at this stage
    pub fn is_agent_stage(&self) -> bool {
        self.pipeline_index().is_some()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// Stage reached after this one completes successfully
    pub fn next(&self) -> Stage {
        match self.pipeline_index() {
            Some(idx) if idx + 1 < Self::PIPELINE.len() => Self::PIPELINE[idx + 1],
            Some(_) => Stage::Done,
            None => *self,
        }
    }

    /// Agent stages that run strictly before this one
    pub fn predecessors(&self) -> &'static [Stage] {
        match self.pipeline_index() {
            Some(idx) => &Self::PIPELINE[..idx],
            None => &[],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let stage = match normalized.as_str() {
            "intent_route" | "intent" => Stage::IntentRoute,
            "normalize" => Stage::Normalize,
            "parse" => Stage::Parse,
            "solve" => Stage::Solve,
            "explain" => Stage::Explain,
            "verify" => Stage::Verify,
            "evaluate" => Stage::Evaluate,
            "guardrail" => Stage::Guardrail,
            "done" => Stage::Done,
            "hitl" => Stage::Hitl,
            "failed" => Stage::Failed,
            _ => return Err(format!("unknown stage '{}'", s)),
        };
        Ok(stage)
    }
}

/// Outcome class reported by an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Output produced
    Ok,
    /// Transient or salvageable failure, worth another attempt
    RetryableError,
    /// No retry can fix this input
    FatalError,
    /// Agent asks for a human decision
    NeedsHuman,
}

/// Topic classification produced by the intent router
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentRoute {
    /// Broad math topic (algebra, calculus, ...)
    pub topic: String,
    /// Finer grained topic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtopic: Option<String>,
    /// Whether the problem is something the tutor handles
    #[serde(default = "default_in_scope")]
    pub in_scope: bool,
}

fn default_in_scope() -> bool {
    true
}

/// Cleaned problem text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedInput {
    pub text: String,
}

/// Structured problem produced by the parser
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedProblem {
    /// Canonical expression or equation to solve
    pub expression: String,
    /// Problem family (equation, derivative, probability, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,
    /// Unknowns referenced by the expression
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<String>,
    /// Domain restrictions stated in the problem
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
}

/// Worked solution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Solution {
    pub final_answer: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
    /// Tools the solver used (calculator, symbolic engine, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
}

/// Student-facing explanation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Explanation {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_concepts: Vec<String>,
    /// Sources from the retrieved context that the explanation relies on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,
}

/// Verifier judgement on a solution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    Incorrect,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationReport {
    pub verdict: Verdict,
    /// How the check was done (substitution, symbolic, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationReport {
    /// Overall quality in [0, 1]
    pub quality_score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub areas_for_improvement: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardrailReport {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

/// Stage specific agent output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", content = "output", rename_all = "snake_case")]
pub enum StagePayload {
    IntentRoute(IntentRoute),
    Normalize(NormalizedInput),
    Parse(ParsedProblem),
    Solve(Solution),
    Explain(Explanation),
    Verify(VerificationReport),
    Evaluate(EvaluationReport),
    Guardrail(GuardrailReport),
}

impl StagePayload {
    /// Stage that produces this kind of payload
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::IntentRoute(_) => Stage::IntentRoute,
            StagePayload::Normalize(_) => Stage::Normalize,
            StagePayload::Parse(_) => Stage::Parse,
            StagePayload::Solve(_) => Stage::Solve,
            StagePayload::Explain(_) => Stage::Explain,
            StagePayload::Verify(_) => Stage::Verify,
            StagePayload::Evaluate(_) => Stage::Evaluate,
            StagePayload::Guardrail(_) => Stage::Guardrail,
        }
    }
}

/// Uniform envelope returned by every agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,
    /// Normalized confidence in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Diagnostic text; on retryable errors it doubles as a hint for the next attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl AgentResult {
    pub fn ok(payload: StagePayload) -> Self {
        Self {
            status: AgentStatus::Ok,
            payload: Some(payload),
            confidence: None,
            notes: None,
        }
    }

    pub fn retryable(notes: impl Into<String>) -> Self {
        Self::without_payload(AgentStatus::RetryableError, notes)
    }

    pub fn fatal(notes: impl Into<String>) -> Self {
        Self::without_payload(AgentStatus::FatalError, notes)
    }

    pub fn needs_human(notes: impl Into<String>) -> Self {
        Self::without_payload(AgentStatus::NeedsHuman, notes)
    }

    fn without_payload(status: AgentStatus, notes: impl Into<String>) -> Self {
        Self {
            status,
            payload: None,
            confidence: None,
            notes: Some(notes.into()),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_payload(mut self, payload: StagePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Knowledge snippet attached for the explanation stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snippet {
    /// Document the snippet came from
    pub source: String,
    pub text: String,
    /// Relevance score, higher is better
    pub score: f64,
}

/// Original user input before text extraction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RawInput {
    Text(String),
    Image(PathBuf),
    Audio(PathBuf),
}

impl RawInput {
    pub fn kind(&self) -> &'static str {
        match self {
            RawInput::Text(_) => "text",
            RawInput::Image(_) => "image",
            RawInput::Audio(_) => "audio",
        }
    }
}

/// Reason for a trace entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    /// Run created
    Initial,
    /// Stage produced accepted output
    Advance,
    /// Same stage invoked again after a retryable error
    Retry,
    /// Verifier rejected the solution, rewound to solving
    Revision,
    /// Routed to human review
    Escalated,
    /// Retrieved knowledge attached before explaining
    ContextAttached,
    HumanAccepted,
    HumanCorrected,
    HumanRetry,
    HumanAborted,
    /// Agent reported an unrecoverable error
    Fatal,
    /// Orchestrator precondition failed
    InvariantViolation,
    /// Run cancelled by the caller
    Cancelled,
}

/// One entry of the append-only run trace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    /// Position in the trace, starting at 0
    pub sequence: u64,
    /// When the transition was applied
    pub timestamp: DateTime<Utc>,
    /// Stage before the transition (None for the initial entry)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_stage: Option<Stage>,
    /// Stage after the transition
    pub to_stage: Stage,
    pub transition_type: TransitionType,
    /// Agent status that caused the transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    /// Attempt number of the stage that just ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Time spent in the agent (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Stage output or decision details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Why a run was routed to human review
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    /// Output produced, but below the stage threshold
    LowConfidence { confidence: f64, threshold: f64 },
    /// Retryable errors used up every attempt
    RetriesExhausted { attempts: u32, max_attempts: u32 },
    /// The agent itself asked for a human
    AgentRequested,
    /// Verifier kept rejecting solutions
    RevisionsExhausted { revisions: u32 },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::LowConfidence {
                confidence,
                threshold,
            } => write!(
                f,
                "confidence {:.2} is below the threshold {:.2}",
                confidence, threshold
            ),
            EscalationReason::RetriesExhausted {
                attempts,
                max_attempts,
            } => write!(f, "failed {} of {} attempts", attempts, max_attempts),
            EscalationReason::AgentRequested => f.write_str("the agent asked for human review"),
            EscalationReason::RevisionsExhausted { revisions } => write!(
                f,
                "the verifier rejected the solution after {} revisions",
                revisions
            ),
        }
    }
}

/// A solution rejected by the verifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevisionRecord {
    /// 1-based revision number
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Kinds of decision a reviewer may take
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Accept,
    Correct,
    Retry,
    Abort,
}

/// Decision supplied by a human reviewer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HumanDecision {
    /// Keep the agent's output as-is
    Accept,
    /// Replace the stage output with a corrected value
    Correct { value: StagePayload },
    /// Run the stage again, optionally with a hint for the agent
    Retry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    /// Stop the run
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl HumanDecision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            HumanDecision::Accept => DecisionKind::Accept,
            HumanDecision::Correct { .. } => DecisionKind::Correct,
            HumanDecision::Retry { .. } => DecisionKind::Retry,
            HumanDecision::Abort { .. } => DecisionKind::Abort,
        }
    }
}

/// What a reviewer needs to look at, set only while the run is in HITL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewRequest {
    /// Stage whose output is under review
    pub stage: Stage,
    pub reason: EscalationReason,
    /// Offending output, if the agent produced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Rejected solutions, attached when revisions ran out
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revision_history: Vec<RevisionRecord>,
    /// Minimal set of decisions that make sense for this review
    pub allowed_decisions: Vec<DecisionKind>,
    pub requested_at: DateTime<Utc>,
}

/// Why a run ended in FAILED
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Agent reported a fatal error
    FatalStage,
    /// Orchestrator or agent bug
    InvariantViolation,
    /// Reviewer aborted the run
    HumanAborted,
    /// Caller cancelled the run
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub kind: FailureKind,
    /// Last stage reached before failing
    pub stage: Stage,
    pub reason: String,
}

/// Record threaded through one problem-solving attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Session this run belongs to
    pub session_id: String,
    /// Input as the user supplied it
    pub raw_input: RawInput,
    /// Input after text extraction
    pub input_text: String,
    /// Current position in the state machine
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_input: Option<NormalizedInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_expression: Option<ParsedProblem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<Solution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<Explanation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<VerificationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_result: Option<EvaluationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail_result: Option<GuardrailReport>,
    /// Knowledge snippets for the explanation stage
    #[serde(default)]
    pub retrieved_context: Vec<Snippet>,
    /// Agent invocations per stage
    #[serde(default)]
    pub attempt_counts: BTreeMap<Stage, u32>,
    /// Solve/verify rewinds so far
    #[serde(default)]
    pub revision_count: u32,
    /// Solutions rejected by the verifier
    #[serde(default)]
    pub revision_history: Vec<RevisionRecord>,
    /// Set only while `stage` is HITL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_human_review: Option<ReviewRequest>,
    /// Hint handed to the next agent invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_hint: Option<String>,
    /// Set once the run reaches FAILED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// Append-only transition log
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted run status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Agents are executing
    Running,
    /// Suspended at the HITL gate
    AwaitingReview,
    /// Reached DONE
    Completed,
    /// Reached FAILED
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Latest persisted snapshot of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub session_id: String,
    pub status: RunStatus,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of HITL suspensions during the run
    #[serde(default)]
    pub escalations: u32,
    pub state: WorkflowState,
}

/// Lifecycle of a pending review
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting for a human decision
    Pending,
    /// A decision was applied
    Resolved,
    /// The run was cancelled before anyone answered
    Cancelled,
}

/// Persisted HITL review, holding the suspended state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    /// Opaque handle given to the presentation layer
    pub handle: Uuid,
    pub run_id: Uuid,
    pub session_id: String,
    /// Stage under review
    pub stage: Stage,
    /// Identity of the suspended state, used to deduplicate suspends
    pub fingerprint: String,
    pub status: ReviewStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    /// State as it was suspended
    pub state: WorkflowState,
}

/// One user's interaction history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSession {
    pub session_id: String,
    /// Input that opened the session
    pub raw_input: RawInput,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Finished runs, oldest first
    #[serde(default)]
    pub history: Vec<WorkflowState>,
}
