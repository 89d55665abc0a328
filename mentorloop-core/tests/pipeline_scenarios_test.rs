//! End-to-end pipeline runs driven by scripted agents

mod common;

use common::{
    good_payload, harness, harness_with_policy, ok, parsed, solved, verdict, ScriptedAgent,
};
use mentorloop_core::memory::{InMemorySessionMemory, SessionMemory};
use mentorloop_core::models::configuration::PolicyConfig;
use mentorloop_core::models::workflow::{
    AgentResult, DecisionKind, EscalationReason, FailureKind, HumanDecision, RawInput, RunStatus,
    Snippet, Stage, TransitionType, Verdict, WorkflowState,
};
use mentorloop_core::services::retrieval::Retriever;
use mentorloop_core::workflow::{
    Agent, EscalationPolicy, HitlGate, PipelineEngine, RunOutcome, StageConfig, WorkflowError,
    WorkflowOrchestrator, WorkflowPersistence,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::tempdir;

fn problem() -> RawInput {
    RawInput::Text("Solve x^2 - 5x + 6 = 0".to_string())
}

fn count(state: &WorkflowState, kind: TransitionType) -> usize {
    state
        .trace
        .iter()
        .filter(|e| e.transition_type == kind)
        .count()
}

/// Every stage succeeds on the first try
#[tokio::test]
async fn test_happy_path_reaches_done() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let h = harness(dir.path(), agent.clone());

    let outcome = h
        .orchestrator
        .start(Some("s-1".to_string()), problem())
        .await
        .unwrap();

    let RunOutcome::Completed(state) = outcome else {
        panic!("expected completion, got {:?}", outcome.status());
    };
    assert_eq!(state.stage, Stage::Done);
    assert!(state.completed_at.is_some());
    assert!(state.pending_human_review.is_none());
    assert_eq!(state.solution.as_ref().unwrap().final_answer, "x = 2 or x = 3");
    for stage in Stage::PIPELINE {
        assert!(state.has_output(stage), "missing output for {}", stage);
        assert!(state.attempts(stage) <= 1);
    }
    assert_eq!(count(&state, TransitionType::Escalated), 0);
    assert_eq!(agent.invocations().len(), 8);

    let stages: Vec<_> = agent.invocations().iter().map(|i| i.config.stage).collect();
    assert_eq!(stages, Stage::PIPELINE.to_vec());

    let record = h.orchestrator.get_run(state.run_id).unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(h.orchestrator.pending_reviews(None).is_empty());
}

/// Verifier rejects twice, accepts the third solution
#[tokio::test]
async fn test_rejected_solutions_are_revised() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(
        Stage::Solve,
        [ok(solved("x = 1")), ok(solved("x = 6")), ok(solved("x = 2 or x = 3"))],
    );
    agent.script(
        Stage::Verify,
        [
            ok(verdict(Verdict::Incorrect)),
            ok(verdict(Verdict::Incorrect)),
            ok(verdict(Verdict::Correct)),
        ],
    );
    let h = harness(dir.path(), agent.clone());

    let state = h
        .orchestrator
        .start(None, problem())
        .await
        .unwrap()
        .into_state();

    assert_eq!(state.stage, Stage::Done);
    assert_eq!(state.revision_count, 2);
    assert_eq!(state.revision_history.len(), 2);
    assert_eq!(
        state.revision_history[0].rejected_answer.as_deref(),
        Some("x = 1")
    );
    assert_eq!(count(&state, TransitionType::Revision), 2);

    let solves = agent.calls(Stage::Solve);
    assert_eq!(solves.len(), 3);
    assert!(solves[0].config.retry_hint.is_none());
    assert!(solves[1]
        .config
        .retry_hint
        .as_deref()
        .unwrap()
        .starts_with("Verifier rejected the solution"));
    // Each revision starts solving from a clean slate
    assert!(solves[2].state.solution.is_none());
    assert_eq!(solves[2].config.attempt, 1);
}

/// Parsing fails on every attempt and the run waits for a reviewer
#[tokio::test]
async fn test_exhausted_retries_escalate() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let max_attempts = PolicyConfig::default().max_attempts(Stage::Parse);
    agent.script(
        Stage::Parse,
        (0..=max_attempts).map(|_| AgentResult::retryable("unbalanced parentheses")),
    );
    let h = harness(dir.path(), agent.clone());

    let outcome = h.orchestrator.start(None, problem()).await.unwrap();

    let RunOutcome::Suspended { handle, state } = outcome else {
        panic!("expected suspension, got {:?}", outcome.status());
    };
    assert_eq!(state.stage, Stage::Hitl);
    assert_eq!(state.attempts(Stage::Parse), max_attempts);
    assert_eq!(agent.calls(Stage::Parse).len() as u32, max_attempts);
    assert_eq!(count(&state, TransitionType::Retry) as u32, max_attempts - 1);

    let review = state.pending_human_review.as_ref().unwrap();
    assert_eq!(review.stage, Stage::Parse);
    assert_eq!(
        review.reason,
        EscalationReason::RetriesExhausted {
            attempts: max_attempts,
            max_attempts,
        }
    );

    let attempts: Vec<_> = agent
        .calls(Stage::Parse)
        .iter()
        .map(|i| i.config.attempt)
        .collect();
    assert_eq!(attempts, (1..=max_attempts).collect::<Vec<_>>());

    let pending = h.orchestrator.pending_reviews(Some(state.run_id));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].handle, handle.as_uuid());
    let record = h.orchestrator.get_run(state.run_id).unwrap();
    assert_eq!(record.status, RunStatus::AwaitingReview);
    assert_eq!(record.escalations, 1);
}

/// A fatal guardrail result fails the run without review
#[tokio::test]
async fn test_fatal_guardrail_fails_run() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(
        Stage::Guardrail,
        [AgentResult::fatal("explanation contains unsafe content")],
    );
    let h = harness(dir.path(), agent.clone());

    let outcome = h
        .orchestrator
        .start(Some("s-2".to_string()), problem())
        .await
        .unwrap();

    let RunOutcome::Failed(state) = outcome else {
        panic!("expected failure, got {:?}", outcome.status());
    };
    let failure = state.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::FatalStage);
    assert_eq!(failure.stage, Stage::Guardrail);
    assert_eq!(failure.reason, "explanation contains unsafe content");
    assert!(state.pending_human_review.is_none());
    assert!(h.orchestrator.pending_reviews(None).is_empty());
    assert_eq!(count(&state, TransitionType::Fatal), 1);

    let record = h.orchestrator.get_run(state.run_id).unwrap();
    assert_eq!(record.status, RunStatus::Failed);
}

/// A reviewer corrects a low-confidence parse and solving uses the correction
#[tokio::test]
async fn test_corrected_parse_reaches_solver() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(
        Stage::Parse,
        [AgentResult::ok(parsed("x^2 - 5x - 6 = 0")).with_confidence(0.4)],
    );
    let h = harness(dir.path(), agent.clone());

    let outcome = h.orchestrator.start(None, problem()).await.unwrap();
    let handle = outcome.handle().expect("run should wait for review");
    let state = outcome.state();
    assert!(state.parsed_expression.is_none());
    assert_eq!(state.attempts(Stage::Parse), 0);
    assert!(matches!(
        state.pending_human_review.as_ref().unwrap().reason,
        EscalationReason::LowConfidence { .. }
    ));

    let outcome = h
        .orchestrator
        .resume(
            handle,
            HumanDecision::Correct {
                value: parsed("x^2 - 5x + 6 = 0"),
            },
            Some("ms-lee".to_string()),
        )
        .await
        .unwrap();

    let state = outcome.into_state();
    assert_eq!(state.stage, Stage::Done);
    assert_eq!(count(&state, TransitionType::HumanCorrected), 1);

    let solves = agent.calls(Stage::Solve);
    assert_eq!(solves.len(), 1);
    assert_eq!(
        solves[0].state.parsed_expression.as_ref().unwrap().expression,
        "x^2 - 5x + 6 = 0"
    );
    assert!(h.orchestrator.pending_reviews(None).is_empty());
}

/// A parse hint from a failed attempt does not follow the run into solving
#[tokio::test]
async fn test_accepted_parse_does_not_leak_hint() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(
        Stage::Parse,
        [
            AgentResult::retryable("treat ^ as power"),
            AgentResult::ok(parsed("x^2 - 5x + 6 = 0")).with_confidence(0.3),
        ],
    );
    let h = harness(dir.path(), agent.clone());

    let outcome = h.orchestrator.start(None, problem()).await.unwrap();
    let handle = outcome.handle().expect("run should wait for review");
    assert_eq!(
        agent.calls(Stage::Parse)[1].config.retry_hint.as_deref(),
        Some("treat ^ as power")
    );

    let state = h
        .orchestrator
        .resume(handle, HumanDecision::Accept, Some("ms-lee".to_string()))
        .await
        .unwrap()
        .into_state();

    assert_eq!(state.stage, Stage::Done);
    assert_eq!(state.attempts(Stage::Parse), 1);
    let solves = agent.calls(Stage::Solve);
    assert_eq!(solves.len(), 1);
    assert_eq!(solves[0].config.retry_hint, None);
    assert_eq!(solves[0].state.retry_hint, None);
}

/// Verifier keeps rejecting past the revision limit
#[tokio::test]
async fn test_exhausted_revisions_carry_history_to_review() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let policy = PolicyConfig {
        max_revisions: 2,
        ..PolicyConfig::default()
    };
    agent.script(Stage::Verify, (0..3).map(|_| ok(verdict(Verdict::Incorrect))));
    let h = harness_with_policy(dir.path(), agent.clone(), policy);

    let outcome = h.orchestrator.start(None, problem()).await.unwrap();

    let RunOutcome::Suspended { handle, state } = outcome else {
        panic!("expected suspension, got {:?}", outcome.status());
    };
    let review = state.pending_human_review.as_ref().unwrap();
    assert_eq!(review.stage, Stage::Verify);
    assert_eq!(
        review.reason,
        EscalationReason::RevisionsExhausted { revisions: 2 }
    );
    assert_eq!(review.revision_history.len(), 2);
    assert_eq!(agent.calls(Stage::Solve).len(), 3);

    // The rejected solution cannot be waved through
    assert!(!review.allowed_decisions.contains(&DecisionKind::Accept));
    let accepted = h
        .orchestrator
        .resume(handle, HumanDecision::Accept, None)
        .await;
    assert!(matches!(accepted, Err(WorkflowError::InvalidDecision { .. })));
    assert_eq!(h.orchestrator.pending_reviews(Some(state.run_id)).len(), 1);

    // Abort ends the run at the reviewed stage
    let outcome = h
        .orchestrator
        .resume(
            handle,
            HumanDecision::Abort {
                reason: Some("problem statement is wrong".to_string()),
            },
            None,
        )
        .await
        .unwrap();
    let state = outcome.into_state();
    assert_eq!(state.stage, Stage::Failed);
    let failure = state.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::HumanAborted);
    assert_eq!(failure.stage, Stage::Verify);
}

/// Agent output for the wrong stage is an invariant violation, not a stage failure
#[tokio::test]
async fn test_wrong_stage_payload_is_invariant_violation() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(Stage::Solve, [ok(parsed("x = 1"))]);
    let h = harness(dir.path(), agent.clone());

    let state = h
        .orchestrator
        .start(None, problem())
        .await
        .unwrap()
        .into_state();

    assert_eq!(state.stage, Stage::Failed);
    let failure = state.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::InvariantViolation);
    assert_eq!(failure.stage, Stage::Solve);
    assert_eq!(count(&state, TransitionType::InvariantViolation), 1);
    assert!(agent.calls(Stage::Explain).is_empty());
}

/// Finished runs land in session memory in order
#[tokio::test]
async fn test_finished_runs_appended_to_session() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(Stage::IntentRoute, [AgentResult::fatal("not a math question")]);
    let h = harness(dir.path(), agent);

    let first = h
        .orchestrator
        .start(Some("student-7".to_string()), problem())
        .await
        .unwrap()
        .into_state();
    let second = h
        .orchestrator
        .start(Some("student-7".to_string()), problem())
        .await
        .unwrap()
        .into_state();

    let history = h.memory.load_history("student-7").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].run_id, first.run_id);
    assert_eq!(history[0].stage, Stage::Failed);
    assert_eq!(history[1].run_id, second.run_id);
    assert_eq!(history[1].stage, Stage::Done);

    let metrics = h.orchestrator.metrics(Some("student-7"));
    assert_eq!(metrics.run_count, 2);
    assert_eq!(metrics.completed_count, 1);
    assert_eq!(metrics.failed_count, 1);
}

/// Empty text never creates a run
#[tokio::test]
async fn test_blank_input_rejected() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), ScriptedAgent::new());

    let result = h
        .orchestrator
        .start(None, RawInput::Text("   \n ".to_string()))
        .await;

    assert!(matches!(result, Err(WorkflowError::UnrecognizedInput(_))));
    assert!(h.persistence.list_runs(None).is_empty());
}

/// A session id that cannot be stored is refused before any agent runs
#[tokio::test]
async fn test_unstorable_session_id_rejected() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let h = harness(dir.path(), agent.clone());

    let result = h
        .orchestrator
        .start(Some("class/7".to_string()), problem())
        .await;

    assert!(matches!(result, Err(WorkflowError::InvalidSessionId(ref id)) if id == "class/7"));
    assert!(agent.invocations().is_empty());
    assert!(h.persistence.list_runs(None).is_empty());
}

struct FixedRetriever;

#[async_trait::async_trait]
impl Retriever for FixedRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<Snippet>> {
        assert!(query.contains("quadratic"));
        Ok((0..top_k)
            .map(|i| Snippet {
                source: format!("factoring.md#{}", i),
                text: "A product is zero when one factor is zero.".to_string(),
                score: 1.0,
            })
            .collect())
    }
}

/// Knowledge snippets are attached before the explanation stage
#[tokio::test]
async fn test_context_attached_before_explain() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let persistence = Arc::new(WorkflowPersistence::new(dir.path().join("runs.json")).unwrap());
    let gate = Arc::new(HitlGate::new(persistence.clone()));
    let engine = PipelineEngine::new(
        common::registry(agent.clone()),
        EscalationPolicy::new(PolicyConfig::default()),
        gate,
        persistence,
    )
    .with_retriever(Arc::new(FixedRetriever), 2);

    let state = WorkflowState::new(
        "s-1",
        problem(),
        "Solve x^2 - 5x + 6 = 0",
    );
    let state = engine.drive(state).await.unwrap().into_state();

    assert_eq!(state.stage, Stage::Done);
    assert_eq!(state.retrieved_context.len(), 2);
    assert_eq!(count(&state, TransitionType::ContextAttached), 1);

    let explain = agent.calls(Stage::Explain);
    assert_eq!(explain[0].state.retrieved_context.len(), 2);
    assert!(agent.calls(Stage::Solve)[0].state.retrieved_context.is_empty());
}

/// Cancelling a suspended run withdraws its review
#[tokio::test]
async fn test_cancel_suspended_run() {
    let dir = tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(Stage::Explain, [AgentResult::needs_human("diagram required")]);
    let h = harness(dir.path(), agent);

    let outcome = h
        .orchestrator
        .start(Some("s-3".to_string()), problem())
        .await
        .unwrap();
    let handle = outcome.handle().unwrap();
    let run_id = outcome.state().run_id;

    let state = h
        .orchestrator
        .cancel(run_id, Some("student left".to_string()))
        .await
        .unwrap();

    assert_eq!(state.stage, Stage::Failed);
    assert_eq!(state.failure.as_ref().unwrap().kind, FailureKind::Cancelled);
    assert_eq!(state.failure.as_ref().unwrap().stage, Stage::Explain);
    assert!(h.orchestrator.pending_reviews(None).is_empty());
    assert_eq!(
        h.orchestrator.get_run(run_id).unwrap().status,
        RunStatus::Cancelled
    );

    let resumed = h
        .orchestrator
        .resume(handle, HumanDecision::Abort { reason: None }, None)
        .await;
    assert!(matches!(resumed, Err(WorkflowError::InvalidHandle(_))));

    let again = h.orchestrator.cancel(run_id, None).await.unwrap();
    assert_eq!(again.trace.len(), state.trace.len());
}

/// Solver that cancels its own run through a second orchestrator on the same store
struct CancelledWhileSolving {
    store_dir: PathBuf,
}

#[async_trait::async_trait]
impl Agent for CancelledWhileSolving {
    async fn run(&self, state: &WorkflowState, config: &StageConfig) -> AgentResult {
        if config.stage == Stage::Solve {
            let other = harness(&self.store_dir, ScriptedAgent::new());
            other
                .orchestrator
                .cancel(state.run_id, Some("class ended early".to_string()))
                .await
                .unwrap();
        }
        ok(good_payload(config.stage))
    }
}

/// A cancel written by another process is not overwritten by the running pipeline
#[tokio::test]
async fn test_cancel_from_other_process_stops_run() {
    let dir = tempdir().unwrap();
    let persistence = Arc::new(WorkflowPersistence::new(dir.path().join("runs.json")).unwrap());
    let gate = Arc::new(HitlGate::new(persistence.clone()));
    let engine = PipelineEngine::new(
        common::registry(Arc::new(CancelledWhileSolving {
            store_dir: dir.path().to_path_buf(),
        })),
        EscalationPolicy::new(PolicyConfig::default()),
        gate.clone(),
        persistence.clone(),
    );
    let memory = Arc::new(InMemorySessionMemory::new());
    let orchestrator = WorkflowOrchestrator::new(engine, gate, persistence.clone(), memory.clone());

    let result = orchestrator.start(Some("s-9".to_string()), problem()).await;

    assert!(matches!(
        result,
        Err(WorkflowError::RunFinished {
            status: RunStatus::Cancelled,
            ..
        })
    ));
    let runs = persistence.list_runs(None);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Cancelled);
    assert_eq!(runs[0].state.failure.as_ref().unwrap().kind, FailureKind::Cancelled);
    assert!(runs[0].state.solution.is_none());
    assert!(memory.load_history("s-9").await.unwrap().is_empty());
}
