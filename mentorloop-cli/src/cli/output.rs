//! Rendering of runs, reviews and traces

use mentorloop_core::models::workflow::{ReviewRecord, TraceEntry, WorkflowState};
use mentorloop_core::workflow::RunOutcome;
use serde_json::{json, Value};

/// JSON document describing a run outcome
pub fn outcome_json(outcome: &RunOutcome) -> Value {
    let state = outcome.state();
    let mut value = state_json(state);
    value["status"] = json!(outcome.status());
    if let Some(handle) = outcome.handle() {
        value["review_handle"] = json!(handle.to_string());
    }
    value
}

/// JSON summary of a run state
pub fn state_json(state: &WorkflowState) -> Value {
    json!({
        "run_id": state.run_id.to_string(),
        "session_id": state.session_id,
        "stage": state.stage,
        "message": state.outcome_message(),
        "answer": state.solution.as_ref().map(|s| s.final_answer.clone()),
        "explanation": state.explanation.as_ref().map(|e| e.text.clone()),
        "revision_count": state.revision_count,
        "attempt_counts": state.attempt_counts,
        "review": state.pending_human_review,
        "failure": state.failure,
        "started_at": state.started_at.to_rfc3339(),
        "completed_at": state.completed_at.map(|t| t.to_rfc3339()),
    })
}

pub fn review_json(review: &ReviewRecord) -> Value {
    json!({
        "handle": review.handle.to_string(),
        "run_id": review.run_id.to_string(),
        "session_id": review.session_id,
        "stage": review.stage,
        "status": review.status,
        "requested_at": review.requested_at.to_rfc3339(),
        "request": review.state.pending_human_review,
    })
}

/// Print a run outcome for humans
pub fn print_outcome(outcome: &RunOutcome) {
    let state = outcome.state();
    match outcome {
        RunOutcome::Completed(_) => {
            println!("✅ Run {} completed", state.run_id);
            if let Some(solution) = &state.solution {
                println!();
                println!("Answer: {}", solution.final_answer);
                if !solution.steps.is_empty() {
                    println!();
                    println!("Steps:");
                    for (i, step) in solution.steps.iter().enumerate() {
                        println!("  {}. {}", i + 1, step);
                    }
                }
            }
            if let Some(explanation) = &state.explanation {
                println!();
                println!("{}", explanation.text);
            }
            if state.revision_count > 0 {
                println!();
                println!("   Revisions: {}", state.revision_count);
            }
        }
        RunOutcome::Suspended { handle, .. } => {
            println!("⏸  Run {} is waiting for human review", state.run_id);
            println!("   Review handle: {}", handle);
            if let Some(review) = &state.pending_human_review {
                println!();
                for line in review.summary().lines() {
                    println!("   {}", line);
                }
            }
            println!();
            println!("Use 'mentorloop review accept|correct|retry|abort {}' to continue", handle);
        }
        RunOutcome::Failed(_) => {
            println!("❌ Run {} failed", state.run_id);
            println!("   {}", state.outcome_message());
        }
    }
    println!();
    println!("   Session: {}", state.session_id);
}

/// One line per trace entry
pub fn print_trace(trace: &[TraceEntry], verbose: bool) {
    for entry in trace {
        let from = entry
            .from_stage
            .map(|s| s.to_string())
            .unwrap_or_else(|| "<start>".to_string());
        let mut line = format!(
            "  #{:<3} {} {} -> {} ({:?})",
            entry.sequence,
            entry.timestamp.format("%H:%M:%S%.3f"),
            from,
            entry.to_stage,
            entry.transition_type
        );
        if let Some(attempt) = entry.attempt {
            line.push_str(&format!(" attempt {}", attempt));
        }
        if let Some(confidence) = entry.confidence {
            line.push_str(&format!(" confidence {:.2}", confidence));
        }
        if let Some(duration_ms) = entry.duration_ms {
            line.push_str(&format!(" {}ms", duration_ms));
        }
        println!("{}", line);

        if let Some(notes) = &entry.notes {
            println!("        notes: {}", notes);
        }
        if verbose {
            if let Some(output) = &entry.output {
                println!("        output: {}", output);
            }
        }
    }
}
