//! Logging service

use crate::models::workflow::{EscalationReason, Stage, TransitionType};
use crate::models::LogLevel;
use uuid::Uuid;

/// Initialize logging with the specified level
///
/// `RUST_LOG` takes precedence over `level` when it is set. Fails when a
/// global subscriber is already installed.
pub fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let directive = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "mentorloop_core={},mentorloop={}",
            directive, directive
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()?;

    Ok(())
}

/// Log a stage transition
pub fn log_stage_event(
    run_id: Uuid,
    from: Stage,
    to: Stage,
    transition: TransitionType,
    details: Option<&str>,
) {
    tracing::info!(
        run_id = %run_id,
        from = from.as_str(),
        to = to.as_str(),
        transition = ?transition,
        details = details.unwrap_or(""),
        "Stage transition"
    );
}

/// Log a run routed to human review
pub fn log_escalation(run_id: Uuid, stage: Stage, reason: &EscalationReason) {
    tracing::warn!(
        run_id = %run_id,
        stage = stage.as_str(),
        reason = %reason,
        "Escalated to human review"
    );
}

/// Log a broken precondition; kept apart from user-facing failures
pub fn log_invariant_violation(run_id: Uuid, stage: Stage, message: &str) {
    tracing::error!(
        target: "mentorloop_core::invariant",
        run_id = %run_id,
        stage = stage.as_str(),
        message = message,
        "Invariant violation"
    );
}
