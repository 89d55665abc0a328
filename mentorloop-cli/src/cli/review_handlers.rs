//! Review command handlers

use crate::cli::handlers::{
    create_agentless_orchestrator, create_orchestrator, load_config, open_persistence,
    parse_uuid, report_outcome,
};
use crate::cli::output;
use crate::cli::review::ReviewCommands;
use anyhow::{anyhow, Context, Result};
use mentorloop_core::models::workflow::{HumanDecision, StagePayload};
use mentorloop_core::workflow::{PendingReviewHandle, WorkflowError, WorkflowOrchestrator};
use std::path::PathBuf;

/// Handle the 'reviews' command
pub async fn handle_reviews(
    config_path: Option<PathBuf>,
    run: Option<String>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let persistence = open_persistence(&config)?;

    let run_id = match run {
        Some(run) => Some(parse_uuid(&run, "run ID")?),
        None => None,
    };
    let pending = persistence.pending_reviews(run_id);

    if json {
        let values: Vec<_> = pending.iter().map(output::review_json).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!("No pending reviews");
        return Ok(());
    }

    println!("Pending reviews ({}):", pending.len());
    println!();
    for review in &pending {
        let reason = review
            .state
            .pending_human_review
            .as_ref()
            .map(|r| r.reason.to_string())
            .unwrap_or_default();
        println!(
            "  {}  stage '{}'  run {}  {}",
            review.handle, review.stage, review.run_id, reason
        );
        println!(
            "      requested {}",
            review.requested_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Dispatch a review subcommand
pub async fn handle_review_command(
    config_path: Option<PathBuf>,
    command: ReviewCommands,
) -> Result<()> {
    match command {
        ReviewCommands::Accept {
            handle,
            reviewer,
            pipeline,
            json,
        } => {
            let config = load_config(config_path)?;
            let orchestrator = create_orchestrator(&config, pipeline)?;
            decide(&orchestrator, &handle, HumanDecision::Accept, reviewer, json).await
        }
        ReviewCommands::Correct {
            handle,
            value,
            reviewer,
            pipeline,
            json,
        } => {
            let config = load_config(config_path)?;
            let orchestrator = create_orchestrator(&config, pipeline)?;
            let value = corrected_payload(&orchestrator, &handle, &value)?;
            decide(
                &orchestrator,
                &handle,
                HumanDecision::Correct { value },
                reviewer,
                json,
            )
            .await
        }
        ReviewCommands::Retry {
            handle,
            hint,
            reviewer,
            pipeline,
            json,
        } => {
            let config = load_config(config_path)?;
            let orchestrator = create_orchestrator(&config, pipeline)?;
            decide(
                &orchestrator,
                &handle,
                HumanDecision::Retry { hint },
                reviewer,
                json,
            )
            .await
        }
        ReviewCommands::Abort {
            handle,
            reason,
            reviewer,
            json,
        } => {
            let config = load_config(config_path)?;
            let orchestrator = create_agentless_orchestrator(&config)?;
            decide(
                &orchestrator,
                &handle,
                HumanDecision::Abort { reason },
                reviewer,
                json,
            )
            .await
        }
        ReviewCommands::Show { handle, json } => {
            let config = load_config(config_path)?;
            let orchestrator = create_agentless_orchestrator(&config)?;
            let handle = parse_handle(&handle)?;
            let review = orchestrator
                .gate()
                .get(handle)
                .ok_or_else(|| anyhow!("Review '{}' not found", handle))?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&output::review_json(&review))?
                );
                return Ok(());
            }

            println!("Review {}", review.handle);
            println!("Run:      {}", review.run_id);
            println!("Session:  {}", review.session_id);
            println!("Status:   {:?}", review.status);
            if let Some(decision) = review.decision {
                println!("Decision: {:?}", decision);
            }
            if let Some(request) = &review.state.pending_human_review {
                println!();
                println!("{}", request.summary());
            }
            Ok(())
        }
    }
}

fn parse_handle(handle: &str) -> Result<PendingReviewHandle> {
    handle
        .trim()
        .parse::<PendingReviewHandle>()
        .context("Invalid review handle format (expected UUID)")
}

/// Build the corrected output for the stage under review
fn corrected_payload(
    orchestrator: &WorkflowOrchestrator,
    handle: &str,
    value: &str,
) -> Result<StagePayload> {
    let handle = parse_handle(handle)?;
    let review = orchestrator
        .gate()
        .get(handle)
        .ok_or_else(|| anyhow!("Review '{}' not found", handle))?;

    let output: serde_json::Value =
        serde_json::from_str(value).context("Corrected value is not valid JSON")?;
    serde_json::from_value(serde_json::json!({
        "stage": review.stage,
        "output": output,
    }))
    .with_context(|| format!("Corrected value does not fit stage '{}'", review.stage))
}

async fn decide(
    orchestrator: &WorkflowOrchestrator,
    handle: &str,
    decision: HumanDecision,
    reviewer: String,
    json: bool,
) -> Result<()> {
    let handle = parse_handle(handle)?;
    let kind = decision.kind();

    let outcome = match orchestrator.resume(handle, decision, Some(reviewer)).await {
        Ok(outcome) => outcome,
        Err(WorkflowError::InvalidHandle(_)) => {
            return Err(anyhow!(
                "Review '{}' is not pending. Use 'mentorloop reviews' to list open reviews.",
                handle
            ))
        }
        Err(e) => return Err(e).context("Failed to apply decision"),
    };

    if !json {
        println!("📝 Applied {:?} to review {}", kind, handle);
        println!();
    }
    report_outcome(&outcome, json)
}
