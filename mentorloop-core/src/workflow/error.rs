//! Workflow error taxonomy

use crate::models::workflow::{RunStatus, Stage};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the orchestration engine
///
/// Stage failures are not errors here: agents report them through
/// `AgentResult::status` and the policy turns them into transitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Resume called with an unknown or already resolved handle
    #[error("Invalid review handle: {0}")]
    InvalidHandle(Uuid),

    /// A required field was missing or an agent broke the contract
    #[error("Invariant violation at stage '{stage}': {message}")]
    InvariantViolation { stage: Stage, message: String },

    /// Human decision does not fit the pending review
    #[error("Invalid decision for review at stage '{stage}': {message}")]
    InvalidDecision { stage: Stage, message: String },

    /// Raw input could not be turned into text
    #[error(transparent)]
    UnrecognizedInput(#[from] UnrecognizedInputError),

    /// Session ids name files, so only `[A-Za-z0-9._-]` without a leading dot
    #[error("Invalid session id '{0}'")]
    InvalidSessionId(String),

    /// The stored run already reached a different final status, for
    /// example after a cancel from another process
    #[error("Run {run_id} already finished as {status:?}")]
    RunFinished { run_id: Uuid, status: RunStatus },

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    /// Run store or session store failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

/// Raised by input normalizers when conversion to text is impossible
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unrecognized {kind} input: {reason}")]
pub struct UnrecognizedInputError {
    pub kind: String,
    pub reason: String,
}

impl UnrecognizedInputError {
    pub fn new(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}
