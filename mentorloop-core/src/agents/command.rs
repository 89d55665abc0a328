//! Stage agent backed by an external command
//!
//! The command receives a JSON [`AgentRequest`] on stdin and must print an
//! `AgentResult` as JSON on stdout. Whatever goes wrong with the process is
//! reported through the result status, never as an error.

use crate::agents::tail::OutputTail;
use crate::models::workflow::{AgentResult, Stage, WorkflowState};
use crate::workflow::agent::{Agent, StageConfig};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout_at;

/// Stderr lines kept for the result notes
const STDERR_TAIL_LINES: usize = 20;

/// Document written to the command's stdin
#[derive(Debug, Serialize)]
pub struct AgentRequest<'a> {
    pub stage: Stage,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_hint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    pub state: &'a WorkflowState,
}

/// Agent that runs a shell command per invocation
#[derive(Debug, Clone)]
pub struct CommandAgent {
    stage: Stage,
    command: String,
    timeout: Duration,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl CommandAgent {
    pub fn new(stage: Stage, command: impl Into<String>) -> Self {
        Self {
            stage,
            command: command.into(),
            timeout: Duration::from_secs(120),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, working_dir: Option<PathBuf>) -> Self {
        self.working_dir = working_dir;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Exit codes 1-10 and SIGTERM are worth another attempt
    fn is_transient_failure(exit_code: Option<i32>) -> bool {
        matches!(exit_code, Some(1..=10) | Some(143))
    }

    fn with_stderr(notes: String, tail: &OutputTail) -> String {
        let stderr = tail.take();
        if stderr.is_empty() {
            notes
        } else {
            format!("{}\n{}", notes, stderr)
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn run(&self, state: &WorkflowState, config: &StageConfig) -> AgentResult {
        let request = AgentRequest {
            stage: config.stage,
            attempt: config.attempt,
            max_attempts: config.max_attempts,
            retry_hint: config.retry_hint.as_deref(),
            confidence_threshold: config.confidence_threshold,
            state,
        };
        let input = match serde_json::to_vec(&request) {
            Ok(input) => input,
            Err(e) => return AgentResult::fatal(format!("Failed to encode agent request: {}", e)),
        };

        let start_time = Instant::now();

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .envs(&self.env)
            .env("MENTORLOOP_STAGE", config.stage.as_str())
            .env("MENTORLOOP_RUN_ID", state.run_id.to_string())
            .env("MENTORLOOP_ATTEMPT", config.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AgentResult::fatal(format!(
                    "Failed to spawn '{}' agent: {}",
                    config.stage, e
                ))
            }
        };

        drop(command);

        let (Some(mut stdin), Some(mut stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return AgentResult::fatal("Agent process pipes unavailable");
        };

        // Feed stdin while output is drained so large states cannot deadlock
        let mut stdin_task = tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });

        let mut stdout_task = tokio::spawn(async move {
            let mut output = String::new();
            let _ = stdout.read_to_string(&mut output).await;
            output
        });

        let tail = OutputTail::new(STDERR_TAIL_LINES);
        let stderr_tail = tail.clone();
        let mut stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("agent stderr: {}", line);
                stderr_tail.push(line);
            }
        });

        // Waiting for the process and draining its pipes share one budget
        let deadline = tokio::time::Instant::now() + self.timeout;
        let waited = timeout_at(deadline, child.wait()).await;
        let finished = match waited {
            Ok(Ok(status)) => timeout_at(deadline, async {
                let _ = (&mut stdin_task).await;
                let _ = (&mut stderr_task).await;
                (&mut stdout_task).await.unwrap_or_default()
            })
            .await
            .ok()
            .map(|stdout| (status, stdout)),
            Ok(Err(e)) => {
                stdin_task.abort();
                stdout_task.abort();
                stderr_task.abort();
                return AgentResult::fatal(format!("Failed to wait for agent process: {}", e));
            }
            Err(_) => {
                let _ = child.kill().await;
                None
            }
        };

        if finished.is_none() {
            // Background children may still hold the pipes open
            stdin_task.abort();
            stdout_task.abort();
            stderr_task.abort();
        }

        let duration_ms = start_time.elapsed().as_millis() as u64;
        tracing::debug!(
            "'{}' agent process finished in {}ms",
            config.stage,
            duration_ms
        );

        let Some((status, stdout)) = finished else {
            return AgentResult::retryable(Self::with_stderr(
                format!(
                    "'{}' agent timed out after {} ms",
                    config.stage,
                    self.timeout.as_millis()
                ),
                &tail,
            ));
        };

        if status.success() {
            return match serde_json::from_str::<AgentResult>(stdout.trim()) {
                Ok(result) => result,
                // Malformed output is treated like a flaky run
                Err(e) => AgentResult::retryable(Self::with_stderr(
                    format!("'{}' agent printed an invalid result: {}", config.stage, e),
                    &tail,
                )),
            };
        }

        let exit_code = status.code();
        let notes = Self::with_stderr(
            format!(
                "'{}' agent exited with code {:?}",
                config.stage, exit_code
            ),
            &tail,
        );
        if Self::is_transient_failure(exit_code) {
            AgentResult::retryable(notes)
        } else {
            tracing::warn!(
                "Permanent failure detected (exit code {:?}) for '{}' agent",
                exit_code,
                config.stage
            );
            AgentResult::fatal(notes)
        }
    }
}
