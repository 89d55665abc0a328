//! Agent contract and stage dispatch table

use crate::models::workflow::{AgentResult, Stage, WorkflowState};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-invocation settings handed to an agent
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    /// Stage being executed
    pub stage: Stage,
    /// 1-based attempt number of this invocation
    pub attempt: u32,
    /// Invocations allowed before the run is escalated
    pub max_attempts: u32,
    /// Hint from the previous attempt's notes or from a reviewer
    pub retry_hint: Option<String>,
    /// Confidence under which the output will be sent to review
    pub confidence_threshold: Option<f64>,
}

/// Uniform interface implemented by every pipeline stage
///
/// Agents receive a read-only snapshot and never fail across this boundary:
/// every failure is reported through [`AgentResult::status`].
#[async_trait]
pub trait Agent: Send + Sync {
    /// Compute a result for the stage described by `config`
    async fn run(&self, state: &WorkflowState, config: &StageConfig) -> AgentResult;
}

/// Dispatch table selecting an agent by stage
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<Stage, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the agent for an agent stage, replacing any previous one
    pub fn register(&mut self, stage: Stage, agent: Arc<dyn Agent>) -> Result<()> {
        if !stage.is_agent_stage() {
            bail!("No agent can be registered for control stage '{}'", stage);
        }
        self.agents.insert(stage, agent);
        Ok(())
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn Agent>> {
        self.agents.get(&stage).cloned()
    }

    /// Agent stages without a registered agent
    pub fn missing_stages(&self) -> Vec<Stage> {
        Stage::PIPELINE
            .iter()
            .copied()
            .filter(|s| !self.agents.contains_key(s))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_stages().is_empty()
    }
}
