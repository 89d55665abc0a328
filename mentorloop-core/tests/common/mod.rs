//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use mentorloop_core::memory::InMemorySessionMemory;
use mentorloop_core::models::configuration::PolicyConfig;
use mentorloop_core::models::workflow::{
    AgentResult, EvaluationReport, Explanation, GuardrailReport, IntentRoute, NormalizedInput,
    ParsedProblem, Solution, Stage, StagePayload, Verdict, VerificationReport, WorkflowState,
};
use mentorloop_core::workflow::{
    Agent, AgentRegistry, EscalationPolicy, HitlGate, PipelineEngine, StageConfig,
    WorkflowOrchestrator, WorkflowPersistence,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One recorded agent invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub config: StageConfig,
    pub state: WorkflowState,
}

/// Agent that replays queued results per stage
///
/// When a stage has nothing queued it answers with a confident, valid output.
#[derive(Default)]
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<Stage, VecDeque<AgentResult>>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue results for a stage, returned in order
    pub fn script(&self, stage: Stage, results: impl IntoIterator<Item = AgentResult>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .extend(results);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn calls(&self, stage: Stage) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.config.stage == stage)
            .collect()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn run(&self, state: &WorkflowState, config: &StageConfig) -> AgentResult {
        self.invocations.lock().unwrap().push(Invocation {
            config: config.clone(),
            state: state.clone(),
        });

        let queued = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&config.stage)
            .and_then(|queue| queue.pop_front());

        queued.unwrap_or_else(|| ok(good_payload(config.stage)))
    }
}

/// Confident ok result
pub fn ok(payload: StagePayload) -> AgentResult {
    AgentResult::ok(payload).with_confidence(0.95)
}

pub fn parsed(expression: &str) -> StagePayload {
    StagePayload::Parse(ParsedProblem {
        expression: expression.to_string(),
        problem_type: Some("quadratic".to_string()),
        variables: vec!["x".to_string()],
        constraints: vec![],
    })
}

pub fn solved(answer: &str) -> StagePayload {
    StagePayload::Solve(Solution {
        final_answer: answer.to_string(),
        steps: vec!["factor".to_string(), "solve each factor".to_string()],
        tools_used: vec![],
    })
}

pub fn verdict(verdict: Verdict) -> StagePayload {
    StagePayload::Verify(VerificationReport {
        verdict,
        method: Some("substitution".to_string()),
        issues: match verdict {
            Verdict::Correct => vec![],
            Verdict::Incorrect => vec!["substituting the answer does not give 0".to_string()],
        },
    })
}

/// Valid output for each agent stage
pub fn good_payload(stage: Stage) -> StagePayload {
    match stage {
        Stage::IntentRoute => StagePayload::IntentRoute(IntentRoute {
            topic: "algebra".to_string(),
            subtopic: Some("quadratics".to_string()),
            in_scope: true,
        }),
        Stage::Normalize => StagePayload::Normalize(NormalizedInput {
            text: "x^2 - 5x + 6 = 0".to_string(),
        }),
        Stage::Parse => parsed("x^2 - 5x + 6 = 0"),
        Stage::Solve => solved("x = 2 or x = 3"),
        Stage::Explain => StagePayload::Explain(Explanation {
            text: "Factor into (x - 2)(x - 3) = 0.".to_string(),
            key_concepts: vec!["factoring".to_string()],
            citations: vec![],
        }),
        Stage::Verify => verdict(Verdict::Correct),
        Stage::Evaluate => StagePayload::Evaluate(EvaluationReport {
            quality_score: 0.9,
            areas_for_improvement: vec![],
        }),
        Stage::Guardrail => StagePayload::Guardrail(GuardrailReport {
            passed: true,
            issues: vec![],
        }),
        other => panic!("no payload for control stage {}", other),
    }
}

/// Registry routing every agent stage to the same agent
pub fn registry(agent: Arc<dyn Agent>) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for stage in Stage::PIPELINE {
        registry.register(stage, agent.clone()).unwrap();
    }
    registry
}

/// Orchestrator wired with in-memory session memory and a run store in `dir`
pub struct Harness {
    pub orchestrator: WorkflowOrchestrator,
    pub persistence: Arc<WorkflowPersistence>,
    pub memory: Arc<InMemorySessionMemory>,
}

pub fn harness(dir: &Path, agent: Arc<ScriptedAgent>) -> Harness {
    harness_with_policy(dir, agent, PolicyConfig::default())
}

pub fn harness_with_policy(dir: &Path, agent: Arc<ScriptedAgent>, policy: PolicyConfig) -> Harness {
    let persistence = Arc::new(WorkflowPersistence::new(dir.join("runs.json")).unwrap());
    let memory = Arc::new(InMemorySessionMemory::new());
    let gate = Arc::new(HitlGate::new(persistence.clone()));
    let engine = PipelineEngine::new(
        registry(agent),
        EscalationPolicy::new(policy),
        gate.clone(),
        persistence.clone(),
    );
    let orchestrator = WorkflowOrchestrator::new(engine, gate, persistence.clone(), memory.clone());

    Harness {
        orchestrator,
        persistence,
        memory,
    }
}
