//! Configuration data structures

use crate::models::workflow::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Logging level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// Per-stage overrides of the policy limits
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StageLimits {
    /// Maximum agent invocations before escalating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Minimum confidence for output to be accepted without review
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
}

/// Retry / escalation limits, constant for a deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Agent invocations allowed per stage (one initial attempt plus retries)
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Solve/verify rewinds allowed before escalating
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    /// Overrides keyed by stage name (`parse`, `verify`, ...)
    #[serde(default)]
    pub stages: BTreeMap<String, StageLimits>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_revisions() -> u32 {
    3
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut stages = BTreeMap::new();
        stages.insert(
            Stage::Parse.as_str().to_string(),
            StageLimits {
                max_attempts: None,
                confidence_threshold: Some(0.8),
            },
        );
        stages.insert(
            Stage::Verify.as_str().to_string(),
            StageLimits {
                max_attempts: None,
                confidence_threshold: Some(0.85),
            },
        );

        Self {
            default_max_attempts: default_max_attempts(),
            max_revisions: default_max_revisions(),
            stages,
        }
    }
}

impl PolicyConfig {
    fn limits(&self, stage: Stage) -> Option<&StageLimits> {
        self.stages.get(stage.as_str())
    }

    /// Maximum agent invocations for a stage
    pub fn max_attempts(&self, stage: Stage) -> u32 {
        self.limits(stage)
            .and_then(|l| l.max_attempts)
            .unwrap_or(self.default_max_attempts)
    }

    /// Confidence threshold for a stage, `None` when the stage is not gated
    pub fn confidence_threshold(&self, stage: Stage) -> Option<f64> {
        self.limits(stage).and_then(|l| l.confidence_threshold)
    }

    /// Builder-style override used by embedders and tests
    pub fn with_stage(mut self, stage: Stage, limits: StageLimits) -> Self {
        self.stages.insert(stage.as_str().to_string(), limits);
        self
    }

    /// Validate limits, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !(1..=10).contains(&self.default_max_attempts) {
            errors.push("policy.default_max_attempts must be between 1 and 10".to_string());
        }
        if self.max_revisions > 10 {
            errors.push("policy.max_revisions cannot exceed 10".to_string());
        }

        for (name, limits) in &self.stages {
            match name.parse::<Stage>() {
                Ok(stage) if stage.is_agent_stage() => {}
                _ => {
                    errors.push(format!("policy.stages.{} is not an agent stage", name));
                    continue;
                }
            }
            if let Some(max) = limits.max_attempts {
                if !(1..=10).contains(&max) {
                    errors.push(format!(
                        "policy.stages.{}.max_attempts must be between 1 and 10",
                        name
                    ));
                }
            }
            if let Some(threshold) = limits.confidence_threshold {
                if !(0.0..=1.0).contains(&threshold) {
                    errors.push(format!(
                        "policy.stages.{}.confidence_threshold must be within [0, 1]",
                        name
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Knowledge retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Directory of markdown / text knowledge documents (retrieval disabled when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_dir: Option<PathBuf>,
    /// Maximum snippets attached to a run
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum relevance score in [0, 1]
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

fn default_top_k() -> usize {
    5
}

fn default_min_score() -> f64 {
    0.2
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            knowledge_dir: None,
            top_k: default_top_k(),
            min_score: default_min_score(),
        }
    }
}

/// Text extraction commands for non-text input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputConfig {
    /// Command that prints the text found in an image; the path is appended as argument
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_command: Option<String>,
    /// Command that prints the transcript of an audio file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_command: Option<String>,
    /// Extraction timeout in seconds
    #[serde(default = "default_input_timeout")]
    pub timeout_seconds: u32,
}

fn default_input_timeout() -> u32 {
    60
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            ocr_command: None,
            speech_command: None,
            timeout_seconds: default_input_timeout(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Logging verbosity level
    #[serde(default)]
    pub log_level: LogLevel,
    /// Directory for the run store and session files (defaults to ~/.mentorloop)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Default pipeline definition file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_file: Option<PathBuf>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub input: InputConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            data_dir: None,
            pipeline_file: None,
            policy: PolicyConfig::default(),
            retrieval: RetrievalConfig::default(),
            input: InputConfig::default(),
        }
    }
}

impl Configuration {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Configuration = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Return default configuration if file doesn't exist
            Ok(Configuration::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_dir = dirs::config_dir().ok_or("Could not determine config directory")?;
        Ok(config_dir.join("mentorloop").join("config.toml"))
    }

    /// Directory holding the run store and session files
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mentorloop")
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(policy_errors) = self.policy.validate() {
            errors.extend(policy_errors);
        }

        if self.retrieval.top_k == 0 || self.retrieval.top_k > 50 {
            errors.push("retrieval.top_k must be between 1 and 50".to_string());
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_score) {
            errors.push("retrieval.min_score must be within [0, 1]".to_string());
        }

        if self.input.timeout_seconds == 0 || self.input.timeout_seconds > 3600 {
            errors.push("input.timeout_seconds must be between 1 and 3600".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
