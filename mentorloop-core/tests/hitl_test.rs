//! Suspend / resume behaviour of the human review gate

mod common;

use common::{harness, parsed, ScriptedAgent};
use mentorloop_core::models::workflow::{
    AgentResult, DecisionKind, HumanDecision, RawInput, ReviewStatus, Stage, TransitionType,
};
use mentorloop_core::workflow::{HitlGate, WorkflowError, WorkflowPersistence};
use std::sync::Arc;
use tempfile::tempdir;

fn low_confidence_parse(agent: &ScriptedAgent) {
    agent.script(
        Stage::Parse,
        [AgentResult::ok(parsed("x + 1 = 2")).with_confidence(0.3)],
    );
}

/// Suspending the same state twice yields one pending review
#[tokio::test]
async fn test_suspend_is_idempotent() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    low_confidence_parse(&agent);
    let h = harness(dir.path(), agent);

    let outcome = h
        .orchestrator
        .start(None, RawInput::Text("x + 1 = 2".to_string()))
        .await
        .unwrap();
    let first = outcome.handle().unwrap();
    let state = outcome.into_state();

    let gate = HitlGate::new(h.persistence.clone());
    let second = gate.suspend(&state).unwrap();
    let third = gate.suspend(&state).unwrap();

    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(h.orchestrator.pending_reviews(Some(state.run_id)).len(), 1);
    assert_eq!(
        h.orchestrator.get_run(state.run_id).unwrap().escalations,
        1
    );
}

/// A handle is consumed by its first successful resume
#[tokio::test]
async fn test_second_resume_rejected() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    low_confidence_parse(&agent);
    let h = harness(dir.path(), agent);

    let handle = h
        .orchestrator
        .start(None, RawInput::Text("x + 1 = 2".to_string()))
        .await
        .unwrap()
        .handle()
        .unwrap();

    let done = h
        .orchestrator
        .resume(handle, HumanDecision::Accept, Some("ms-lee".to_string()))
        .await
        .unwrap();
    assert_eq!(done.state().stage, Stage::Done);
    assert_eq!(
        done.state().parsed_expression.as_ref().unwrap().expression,
        "x + 1 = 2"
    );

    let again = h
        .orchestrator
        .resume(handle, HumanDecision::Accept, None)
        .await;
    assert!(matches!(again, Err(WorkflowError::InvalidHandle(id)) if id == handle.as_uuid()));

    let review = h.orchestrator.gate().get(handle).unwrap();
    assert_eq!(review.status, ReviewStatus::Resolved);
    assert_eq!(review.decision, Some(DecisionKind::Accept));
    assert_eq!(review.reviewer.as_deref(), Some("ms-lee"));
}

/// An invalid decision leaves the review open
#[tokio::test]
async fn test_invalid_decision_keeps_review_pending() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    low_confidence_parse(&agent);
    let h = harness(dir.path(), agent.clone());

    let handle = h
        .orchestrator
        .start(None, RawInput::Text("x + 1 = 2".to_string()))
        .await
        .unwrap()
        .handle()
        .unwrap();

    let wrong = h
        .orchestrator
        .resume(
            handle,
            HumanDecision::Correct {
                value: common::solved("x = 1"),
            },
            None,
        )
        .await;
    assert!(matches!(wrong, Err(WorkflowError::InvalidDecision { .. })));
    assert_eq!(h.orchestrator.pending_reviews(None).len(), 1);

    let outcome = h
        .orchestrator
        .resume(
            handle,
            HumanDecision::Retry {
                hint: Some("the equation has a single unknown".to_string()),
            },
            None,
        )
        .await
        .unwrap();

    let state = outcome.into_state();
    assert_eq!(state.stage, Stage::Done);
    assert_eq!(
        state
            .trace
            .iter()
            .filter(|e| e.transition_type == TransitionType::HumanRetry)
            .count(),
        1
    );
    let parses = agent.calls(Stage::Parse);
    assert_eq!(parses.len(), 2);
    assert_eq!(parses[1].config.attempt, 1);
    assert_eq!(
        parses[1].config.retry_hint.as_deref(),
        Some("the equation has a single unknown")
    );
}

/// Unknown handles are rejected
#[tokio::test]
async fn test_unknown_handle() {
    let dir = tempdir().unwrap();
    let persistence = Arc::new(WorkflowPersistence::new(dir.path().join("runs.json")).unwrap());
    let gate = HitlGate::new(persistence);

    let handle = uuid::Uuid::new_v4().into();
    let result = gate.resume(handle, HumanDecision::Accept, None);
    assert!(matches!(result, Err(WorkflowError::InvalidHandle(_))));
}

/// A run suspended by one process is resumed through a fresh store instance
#[tokio::test]
async fn test_resume_survives_restart() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    low_confidence_parse(&agent);

    let handle = {
        let h = harness(dir.path(), agent.clone());
        h.orchestrator
            .start(None, RawInput::Text("x + 1 = 2".to_string()))
            .await
            .unwrap()
            .handle()
            .unwrap()
    };

    let restarted = harness(dir.path(), agent);
    let pending = restarted.orchestrator.pending_reviews(None);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].handle, handle.as_uuid());

    let handle: mentorloop_core::workflow::PendingReviewHandle =
        handle.to_string().parse().unwrap();
    let outcome = restarted
        .orchestrator
        .resume(handle, HumanDecision::Accept, None)
        .await
        .unwrap();
    assert_eq!(outcome.state().stage, Stage::Done);
}
