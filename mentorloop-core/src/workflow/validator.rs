//! Pipeline and configuration validation

use crate::agents::pipeline::PipelineDefinition;
use crate::models::configuration::Configuration;
use crate::models::workflow::Stage;
use std::collections::HashMap;

/// Validation error type
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Validation result
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: String, message: String) {
        self.errors.push(ValidationError { field, message });
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline definition
    ///
    /// Every agent stage needs exactly one non-empty command.
    pub fn validate_pipeline(pipeline: &PipelineDefinition) -> ValidationResult {
        let mut result = ValidationResult::new();

        if pipeline.name.trim().is_empty() {
            result.add_error(
                "name".to_string(),
                "Pipeline name cannot be empty".to_string(),
            );
        }

        if let Some(timeout) = pipeline.defaults.timeout_seconds {
            Self::check_timeout(&mut result, "defaults.timeout_seconds", timeout);
        }

        let mut seen: HashMap<Stage, &str> = HashMap::new();
        for (name, command) in &pipeline.stages {
            let stage = match name.parse::<Stage>() {
                Ok(stage) if stage.is_agent_stage() => stage,
                Ok(stage) => {
                    result.add_error(
                        format!("stages.{}", name),
                        format!("'{}' is a control stage and cannot run an agent", stage),
                    );
                    continue;
                }
                Err(e) => {
                    result.add_error(format!("stages.{}", name), e);
                    continue;
                }
            };

            if let Some(previous) = seen.insert(stage, name) {
                result.add_error(
                    format!("stages.{}", name),
                    format!("Stage '{}' is already configured as '{}'", stage, previous),
                );
            }

            if command.command.trim().is_empty() {
                result.add_error(
                    format!("stages.{}.command", name),
                    "Command cannot be empty".to_string(),
                );
            }

            if let Some(timeout) = command.timeout_seconds {
                Self::check_timeout(&mut result, &format!("stages.{}.timeout_seconds", name), timeout);
            }

            if let Some(dir) = command
                .working_dir
                .as_ref()
                .or(pipeline.defaults.working_dir.as_ref())
            {
                if !dir.is_dir() {
                    result.add_warning(format!(
                        "Working directory '{}' for stage '{}' does not exist",
                        dir.display(),
                        stage
                    ));
                }
            }
        }

        for stage in Stage::PIPELINE {
            if !seen.contains_key(&stage) {
                result.add_error(
                    format!("stages.{}", stage),
                    format!("No command configured for stage '{}'", stage),
                );
            }
        }

        result
    }

    /// Validate configuration limits
    pub fn validate_configuration(config: &Configuration) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(errors) = config.validate() {
            for message in errors {
                let field = message
                    .split_whitespace()
                    .next()
                    .unwrap_or("configuration")
                    .to_string();
                result.add_error(field, message);
            }
        }

        if config.policy.max_revisions == 0 {
            result.add_warning(
                "policy.max_revisions is 0: every rejected solution goes straight to review"
                    .to_string(),
            );
        }
        for stage in [Stage::Parse, Stage::Verify] {
            if config.policy.confidence_threshold(stage).is_none() {
                result.add_warning(format!(
                    "Stage '{}' has no confidence threshold and is never sent to review for low confidence",
                    stage
                ));
            }
        }

        if let Some(dir) = &config.retrieval.knowledge_dir {
            if !dir.is_dir() {
                result.add_error(
                    "retrieval.knowledge_dir".to_string(),
                    format!("Knowledge directory '{}' does not exist", dir.display()),
                );
            }
        }

        result
    }

    /// Validate configuration and pipeline together
    pub fn validate_all(config: &Configuration, pipeline: &PipelineDefinition) -> ValidationResult {
        let mut result = Self::validate_configuration(config);
        result.merge(Self::validate_pipeline(pipeline));
        result
    }

    fn check_timeout(result: &mut ValidationResult, field: &str, timeout: u64) {
        if timeout == 0 {
            result.add_error(field.to_string(), "Timeout must be at least 1 second".to_string());
        } else if timeout > 3600 {
            result.add_error(field.to_string(), "Timeout cannot exceed 3600 seconds".to_string());
        } else if timeout > 600 {
            result.add_warning(format!(
                "{} of {}s may hold a run for a long time",
                field, timeout
            ));
        }
    }
}
