//! Pipeline definitions: which command implements each stage agent

use crate::agents::command::CommandAgent;
use crate::models::workflow::Stage;
use crate::workflow::agent::AgentRegistry;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default per-invocation timeout for stage commands
pub const DEFAULT_STAGE_TIMEOUT_SECONDS: u64 = 120;

/// Settings shared by every stage command
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StageDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// External command run for one stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageCommand {
    /// Shell command line
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Extra environment, merged over the defaults
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// YAML pipeline definition
///
/// ```yaml
/// name: tutor
/// defaults:
///   timeout_seconds: 60
/// stages:
///   intent_route:
///     command: ./agents/intent.py
///   parse:
///     command: ./agents/parse.py
///     timeout_seconds: 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub defaults: StageDefaults,
    /// Commands keyed by stage name
    #[serde(default)]
    pub stages: BTreeMap<String, StageCommand>,
}

impl PipelineDefinition {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline definition YAML")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// Command configured for `stage`
    pub fn stage_command(&self, stage: Stage) -> Option<&StageCommand> {
        self.stages
            .iter()
            .find(|(name, _)| name.parse::<Stage>().ok() == Some(stage))
            .map(|(_, command)| command)
    }

    /// Effective timeout for a stage command
    pub fn timeout_for(&self, command: &StageCommand) -> Duration {
        Duration::from_secs(
            command
                .timeout_seconds
                .or(self.defaults.timeout_seconds)
                .unwrap_or(DEFAULT_STAGE_TIMEOUT_SECONDS),
        )
    }

    /// Create one [`CommandAgent`] per configured stage
    ///
    /// Stage names must parse; completeness is checked by the validator.
    pub fn build_registry(&self) -> Result<AgentRegistry> {
        let mut registry = AgentRegistry::new();

        for (name, command) in &self.stages {
            let stage: Stage = name
                .parse()
                .map_err(|e| anyhow!("Pipeline '{}': {}", self.name, e))?;

            let mut env = self.defaults.env.clone();
            env.extend(command.env.clone());

            let agent = CommandAgent::new(stage, command.command.clone())
                .with_timeout(self.timeout_for(command))
                .with_env(env)
                .with_working_dir(
                    command
                        .working_dir
                        .clone()
                        .or_else(|| self.defaults.working_dir.clone()),
                );

            registry
                .register(stage, Arc::new(agent))
                .with_context(|| format!("Pipeline '{}'", self.name))?;
        }

        Ok(registry)
    }
}
