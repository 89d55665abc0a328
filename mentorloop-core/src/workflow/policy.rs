//! Retry / escalation policy
//!
//! Decides what happens after every agent invocation. The decision depends
//! only on the stage, the agent result, the attempt counters and the
//! revision count, so identical inputs always give identical transitions.

use crate::models::configuration::PolicyConfig;
use crate::models::workflow::{
    AgentResult, AgentStatus, EscalationReason, Stage, StagePayload, Verdict,
};
use std::collections::BTreeMap;

/// Next step chosen by the policy
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Output accepted, move on
    Advance { next: Stage },
    /// Invoke the same stage again
    Retry { hint: Option<String> },
    /// Verifier rejected the solution, rewind to solving
    Revise,
    /// Suspend for human review
    Escalate(EscalationReason),
    /// Terminate the run
    Fail { reason: String },
}

/// Retry / escalation policy with deployment-wide limits
#[derive(Debug, Clone, Default)]
pub struct EscalationPolicy {
    config: PolicyConfig,
}

impl EscalationPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn max_attempts(&self, stage: Stage) -> u32 {
        self.config.max_attempts(stage)
    }

    pub fn max_revisions(&self) -> u32 {
        self.config.max_revisions
    }

    /// Decide the transition for `result`, produced at `stage`
    ///
    /// `attempt_counts` must already include the attempt that produced
    /// `result`.
    pub fn decide(
        &self,
        stage: Stage,
        result: &AgentResult,
        attempt_counts: &BTreeMap<Stage, u32>,
        revision_count: u32,
    ) -> Transition {
        match result.status {
            AgentStatus::FatalError => Transition::Fail {
                reason: result
                    .notes
                    .clone()
                    .unwrap_or_else(|| format!("stage '{}' reported a fatal error", stage)),
            },
            AgentStatus::NeedsHuman => Transition::Escalate(EscalationReason::AgentRequested),
            AgentStatus::RetryableError => {
                let attempts = attempt_counts.get(&stage).copied().unwrap_or(0);
                let max_attempts = self.max_attempts(stage);
                if attempts < max_attempts {
                    Transition::Retry {
                        hint: result.notes.clone(),
                    }
                } else {
                    Transition::Escalate(EscalationReason::RetriesExhausted {
                        attempts,
                        max_attempts,
                    })
                }
            }
            AgentStatus::Ok => {
                if rejects_solution(stage, result) {
                    return if revision_count < self.max_revisions() {
                        Transition::Revise
                    } else {
                        Transition::Escalate(EscalationReason::RevisionsExhausted {
                            revisions: revision_count,
                        })
                    };
                }

                if let (Some(confidence), Some(threshold)) =
                    (result.confidence, self.config.confidence_threshold(stage))
                {
                    if confidence < threshold {
                        return Transition::Escalate(EscalationReason::LowConfidence {
                            confidence,
                            threshold,
                        });
                    }
                }

                Transition::Advance { next: stage.next() }
            }
        }
    }
}

/// Verifier output that marks the solution incorrect
fn rejects_solution(stage: Stage, result: &AgentResult) -> bool {
    stage == Stage::Verify
        && matches!(
            &result.payload,
            Some(StagePayload::Verify(report)) if report.verdict == Verdict::Incorrect
        )
}
