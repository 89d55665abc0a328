//! Raw input normalization
//!
//! Turns text, image or audio submissions into the problem text a run
//! starts from. Failures surface before any run state exists.

use crate::models::configuration::InputConfig;
use crate::models::workflow::RawInput;
use crate::workflow::error::UnrecognizedInputError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Converts a raw submission into problem text
#[async_trait]
pub trait InputNormalizer: Send + Sync {
    async fn normalize(&self, input: &RawInput) -> Result<String, UnrecognizedInputError>;
}

/// Accepts typed text only
#[derive(Debug, Clone, Copy, Default)]
pub struct TextInputNormalizer;

#[async_trait]
impl InputNormalizer for TextInputNormalizer {
    async fn normalize(&self, input: &RawInput) -> Result<String, UnrecognizedInputError> {
        match input {
            RawInput::Text(text) => normalize_text(input.kind(), text),
            RawInput::Image(_) | RawInput::Audio(_) => Err(UnrecognizedInputError::new(
                input.kind(),
                "no converter is configured for this input type",
            )),
        }
    }
}

/// Text normalizer that delegates images and audio to external commands
///
/// Each command receives the file path as its last argument and must print
/// the extracted text on stdout.
#[derive(Debug, Clone)]
pub struct ExternalInputNormalizer {
    ocr_command: Option<String>,
    speech_command: Option<String>,
    timeout: Duration,
}

impl ExternalInputNormalizer {
    pub fn new(config: &InputConfig) -> Self {
        Self {
            ocr_command: config.ocr_command.clone(),
            speech_command: config.speech_command.clone(),
            timeout: Duration::from_secs(config.timeout_seconds as u64),
        }
    }

    async fn extract(
        &self,
        kind: &str,
        command: Option<&String>,
        path: &Path,
    ) -> Result<String, UnrecognizedInputError> {
        let command = command.ok_or_else(|| {
            UnrecognizedInputError::new(kind, "no converter is configured for this input type")
        })?;

        if !path.is_file() {
            return Err(UnrecognizedInputError::new(
                kind,
                format!("file not found: {}", path.display()),
            ));
        }

        tracing::debug!("Extracting {} text from {} with '{}'", kind, path.display(), command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$1\"", command))
            .arg("mentorloop-input")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(UnrecognizedInputError::new(
                    kind,
                    format!("failed to run converter: {}", e),
                ))
            }
            Err(_) => {
                return Err(UnrecognizedInputError::new(
                    kind,
                    format!("converter timed out after {}s", self.timeout.as_secs()),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UnrecognizedInputError::new(
                kind,
                format!(
                    "converter exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            ));
        }

        normalize_text(kind, &String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl InputNormalizer for ExternalInputNormalizer {
    async fn normalize(&self, input: &RawInput) -> Result<String, UnrecognizedInputError> {
        match input {
            RawInput::Text(text) => normalize_text(input.kind(), text),
            RawInput::Image(path) => {
                self.extract(input.kind(), self.ocr_command.as_ref(), path)
                    .await
            }
            RawInput::Audio(path) => {
                self.extract(input.kind(), self.speech_command.as_ref(), path)
                    .await
            }
        }
    }
}

/// Trim surrounding whitespace and collapse blank lines
fn normalize_text(kind: &str, text: &str) -> Result<String, UnrecognizedInputError> {
    let normalized = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let normalized = normalized.trim().to_string();

    if normalized.is_empty() {
        return Err(UnrecognizedInputError::new(kind, "no text found"));
    }
    Ok(normalized)
}
