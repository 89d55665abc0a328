//! CLI command handlers

use crate::cli::output;
use anyhow::{anyhow, bail, Context, Result};
use mentorloop_core::agents::PipelineDefinition;
use mentorloop_core::memory::{summarize_history, JsonSessionStore, SessionMemory};
use mentorloop_core::models::{Configuration, LogLevel, RawInput};
use mentorloop_core::services::logging::init_logging;
use mentorloop_core::workflow::{
    AgentRegistry, PipelineValidator, RunOutcome, ValidationResult, WorkflowError,
    WorkflowOrchestrator, WorkflowPersistence,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Load configuration and install the log subscriber
pub(crate) fn load_config(config_path: Option<PathBuf>) -> Result<Configuration> {
    let path = match config_path {
        Some(path) => path,
        None => Configuration::default_config_path()
            .map_err(|e| anyhow!("Failed to get default config path: {}", e))?,
    };
    let config = Configuration::load_from_file(&path)
        .map_err(|e| anyhow!("Failed to load config {}: {}", path.display(), e))?;

    if let Err(errors) = config.validate() {
        bail!(
            "Invalid configuration in {}:\n  {}",
            path.display(),
            errors.join("\n  ")
        );
    }

    // A subscriber may already be installed when handlers run in-process
    let _ = init_logging(config.log_level.clone());
    Ok(config)
}

/// Open the run store under the configured data directory
pub(crate) fn open_persistence(config: &Configuration) -> Result<WorkflowPersistence> {
    WorkflowPersistence::new(config.data_dir().join("runs.json"))
        .context("Failed to initialize run store")
}

/// Load the pipeline given on the command line or configured
pub(crate) fn load_pipeline(
    config: &Configuration,
    pipeline: Option<PathBuf>,
) -> Result<PipelineDefinition> {
    let path = pipeline.or_else(|| config.pipeline_file.clone()).ok_or_else(|| {
        anyhow!("No pipeline definition given. Pass --pipeline or set pipeline_file in the config")
    })?;
    PipelineDefinition::load_from_file(&path)
}

/// Build an orchestrator whose agents come from a validated pipeline
pub(crate) fn create_orchestrator(
    config: &Configuration,
    pipeline: Option<PathBuf>,
) -> Result<WorkflowOrchestrator> {
    let definition = load_pipeline(config, pipeline)?;
    let validation = PipelineValidator::validate_pipeline(&definition);
    if !validation.is_valid() {
        bail!(
            "Pipeline '{}' is invalid:\n  {}",
            definition.name,
            validation
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect::<Vec<_>>()
                .join("\n  ")
        );
    }
    for warning in &validation.warnings {
        tracing::warn!("{}", warning);
    }

    let registry = definition.build_registry()?;
    WorkflowOrchestrator::from_config(config, registry)
}

/// Orchestrator without agents, for operations that never invoke a stage
pub(crate) fn create_agentless_orchestrator(
    config: &Configuration,
) -> Result<WorkflowOrchestrator> {
    WorkflowOrchestrator::from_config(config, AgentRegistry::new())
}

pub(crate) fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value.trim()).with_context(|| format!("Invalid {} format (expected UUID)", what))
}

pub(crate) fn report_outcome(outcome: &RunOutcome, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output::outcome_json(outcome))?
        );
    } else {
        output::print_outcome(outcome);
    }
    Ok(())
}

/// Handle the 'solve' command
pub async fn handle_solve(
    config_path: Option<PathBuf>,
    problem: Option<String>,
    image: Option<PathBuf>,
    audio: Option<PathBuf>,
    session: Option<String>,
    pipeline: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let input = match (problem, image, audio) {
        (Some(text), None, None) => RawInput::Text(text),
        (None, Some(path), None) => RawInput::Image(path),
        (None, None, Some(path)) => RawInput::Audio(path),
        _ => bail!("Give exactly one of a problem text, --image or --audio"),
    };

    let config = load_config(config_path)?;
    let orchestrator = create_orchestrator(&config, pipeline)?;

    if !json {
        println!("🧮 Solving {} problem...", input.kind());
    }

    let outcome = match orchestrator.start(session, input).await {
        Ok(outcome) => outcome,
        Err(WorkflowError::UnrecognizedInput(e)) => {
            bail!("Could not read the problem: {}", e)
        }
        Err(e) => return Err(e).context("Run failed"),
    };

    report_outcome(&outcome, json)
}

/// Handle the 'status' command
pub async fn handle_status(config_path: Option<PathBuf>, run_id: String, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let persistence = open_persistence(&config)?;
    let run_uuid = parse_uuid(&run_id, "run ID")?;

    let record = persistence
        .get_run(run_uuid)
        .ok_or_else(|| anyhow!("Run '{}' not found", run_id))?;

    if json {
        let mut value = output::state_json(&record.state);
        value["status"] = serde_json::json!(record.status);
        value["escalations"] = serde_json::json!(record.escalations);
        value["updated_at"] = serde_json::json!(record.updated_at.to_rfc3339());
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Run Status");
    println!("==========");
    println!("Run ID:         {}", record.run_id);
    println!("Session:        {}", record.session_id);
    println!("Status:         {:?}", record.status);
    println!("Stage:          {}", record.stage);
    println!(
        "Started At:     {}",
        record.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(completed_at) = record.completed_at {
        println!(
            "Completed At:   {}",
            completed_at.format("%Y-%m-%d %H:%M:%S")
        );
        let duration = (completed_at - record.started_at).num_seconds();
        println!("Duration:       {} seconds", duration);
    }
    println!("Revisions:      {}", record.state.revision_count);
    println!("Escalations:    {}", record.escalations);
    println!();
    println!("{}", record.state.outcome_message());

    let pending = persistence.pending_reviews(Some(run_uuid));
    if !pending.is_empty() {
        println!();
        println!("Pending reviews:");
        for review in pending {
            println!("  {} (stage '{}')", review.handle, review.stage);
        }
    }

    Ok(())
}

/// Handle the 'trace' command
pub async fn handle_trace(
    config_path: Option<PathBuf>,
    run_id: String,
    verbose: bool,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let persistence = open_persistence(&config)?;
    let run_uuid = parse_uuid(&run_id, "run ID")?;

    let record = persistence
        .get_run(run_uuid)
        .ok_or_else(|| anyhow!("Run '{}' not found", run_id))?;
    let trace = &record.state.trace;

    if json {
        println!("{}", serde_json::to_string_pretty(trace)?);
    } else {
        println!("Trace of run {} ({} entries)", record.run_id, trace.len());
        println!();
        output::print_trace(trace, verbose);
    }

    Ok(())
}

/// Handle the 'history' command
pub async fn handle_history(config_path: Option<PathBuf>, session: String, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let store = JsonSessionStore::new(config.data_dir().join("sessions"))
        .context("Failed to open session store")?;

    let history = store.load_history(&session).await?;
    let summary = summarize_history(&session, &history);

    if json {
        let runs: Vec<_> = history.iter().map(output::state_json).collect();
        let value = serde_json::json!({
            "summary": summary,
            "runs": runs,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if history.is_empty() {
        println!("No finished runs in session '{}'", session);
        return Ok(());
    }

    println!("Session History: {}", session);
    println!();
    for state in &history {
        println!(
            "  {}  {}  {}",
            state.started_at.format("%Y-%m-%d %H:%M:%S"),
            state.run_id,
            state.outcome_message()
        );
    }
    println!();
    println!("Total Runs:      {}", summary.total_runs);
    println!("Completed:       {}", summary.completed);
    println!("Failed:          {}", summary.failed);
    println!("Verified Rate:   {:.0}%", summary.verified_rate * 100.0);
    if !summary.topics.is_empty() {
        let topics: Vec<_> = summary
            .topics
            .iter()
            .map(|(topic, count)| format!("{} ({})", topic, count))
            .collect();
        println!("Topics:          {}", topics.join(", "));
    }

    Ok(())
}

/// Handle the 'metrics' command
pub async fn handle_metrics(
    config_path: Option<PathBuf>,
    session: Option<String>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let persistence = open_persistence(&config)?;

    let metrics = persistence.query_metrics(session.as_deref());

    if json {
        let json_data = serde_json::json!({
            "run_count": metrics.run_count,
            "completed_count": metrics.completed_count,
            "failed_count": metrics.failed_count,
            "cancelled_count": metrics.cancelled_count,
            "awaiting_review_count": metrics.awaiting_review_count,
            "escalation_count": metrics.escalation_count,
            "success_rate": format!("{:.2}%", metrics.success_rate()),
            "failure_rate": format!("{:.2}%", metrics.failure_rate()),
            "avg_revisions": metrics.avg_revisions,
            "avg_duration_ms": metrics.avg_duration_ms,
        });
        println!("{}", serde_json::to_string_pretty(&json_data)?);
        return Ok(());
    }

    let scope = session.as_deref().unwrap_or("All sessions");
    println!("Run Metrics: {}", scope);
    println!();
    println!("Total Runs:          {}", metrics.run_count);
    println!(
        "Completed:           {} ({:.2}%)",
        metrics.completed_count,
        metrics.success_rate()
    );
    println!(
        "Failed:              {} ({:.2}%)",
        metrics.failed_count,
        metrics.failure_rate()
    );
    println!("Cancelled:           {}", metrics.cancelled_count);
    println!("Awaiting Review:     {}", metrics.awaiting_review_count);
    println!("Escalations:         {}", metrics.escalation_count);
    println!("Average Revisions:   {:.2}", metrics.avg_revisions);
    println!("Average Duration:    {} ms", metrics.avg_duration_ms);

    Ok(())
}

fn print_validation(result: &ValidationResult) {
    if result.is_valid() {
        println!("✓ Valid");
    } else {
        println!("✗ Validation failed");
        println!();
        println!("Errors:");
        for error in &result.errors {
            println!("  ✗ {}: {}", error.field, error.message);
        }
    }

    if !result.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &result.warnings {
            println!("  ⚠  {}", warning);
        }
    }
}

/// Handle the 'validate' command
pub async fn handle_validate(
    config_path: Option<PathBuf>,
    pipeline: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let definition = load_pipeline(&config, pipeline)?;
    let result = PipelineValidator::validate_all(&config, &definition);

    if json {
        let json_output = serde_json::json!({
            "valid": result.is_valid(),
            "pipeline": definition.name,
            "errors": result.errors.iter().map(|e| serde_json::json!({
                "field": e.field,
                "message": e.message,
            })).collect::<Vec<_>>(),
            "warnings": result.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&json_output)?);
    } else {
        println!("Validating pipeline: {}", definition.name);
        if let Some(description) = &definition.description {
            println!("  {}", description);
        }
        println!();
        print_validation(&result);
    }

    if !result.is_valid() {
        std::process::exit(1);
    }
    Ok(())
}

/// Handle the 'cancel' command
pub async fn handle_cancel(
    config_path: Option<PathBuf>,
    run_id: String,
    reason: Option<String>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let orchestrator = create_agentless_orchestrator(&config)?;
    let run_uuid = parse_uuid(&run_id, "run ID")?;

    let state = orchestrator
        .cancel(run_uuid, reason)
        .await
        .with_context(|| format!("Failed to cancel run '{}'", run_id))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output::state_json(&state))?
        );
    } else {
        println!("🛑 {}", state.outcome_message());
    }
    Ok(())
}

/// Handle the 'recover' command
pub async fn handle_recover(
    config_path: Option<PathBuf>,
    run_id: Option<String>,
    pipeline: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;

    let Some(run_id) = run_id else {
        let persistence = open_persistence(&config)?;
        let runs = persistence.find_incomplete_runs();
        if json {
            let values: Vec<_> = runs
                .iter()
                .map(|r| {
                    let mut value = output::state_json(&r.state);
                    value["status"] = serde_json::json!(r.status);
                    value
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        } else if runs.is_empty() {
            println!("No incomplete runs");
        } else {
            println!("Incomplete runs:");
            for record in runs {
                println!(
                    "  {}  {:?} at '{}' (session {})",
                    record.run_id, record.status, record.stage, record.session_id
                );
            }
        }
        return Ok(());
    };

    let orchestrator = create_orchestrator(&config, pipeline)?;
    let outcome = orchestrator
        .recover(parse_uuid(&run_id, "run ID")?)
        .await
        .with_context(|| format!("Failed to recover run '{}'", run_id))?;
    report_outcome(&outcome, json)
}

/// Read a line from stdin
fn read_user_input_sync() -> Result<String> {
    let mut buffer = String::new();
    io::stdin()
        .read_line(&mut buffer)
        .context("Failed to read from stdin")?;
    Ok(buffer)
}

fn prompt(question: &str, current: &str) -> Result<String> {
    print!("{} [{}]: ", question, current);
    io::stdout().flush()?;
    Ok(read_user_input_sync()?.trim().to_string())
}

fn path_or_none(path: &Option<PathBuf>) -> String {
    path.as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Handle the 'config --init' command
pub async fn handle_config_init(config_path: Option<PathBuf>) -> Result<()> {
    println!("⚙️  Initializing mentorloop configuration");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config_path = match config_path {
        Some(path) => path,
        None => Configuration::default_config_path()
            .map_err(|e| anyhow!("Failed to get default config path: {}", e))?,
    };

    println!("📄 Config file: {}", config_path.display());

    let mut config = if config_path.exists() {
        println!("⚠️  Configuration file already exists. Loading existing values...");
        Configuration::load_from_file(&config_path)
            .map_err(|e| anyhow!("Failed to load existing config: {}", e))?
    } else {
        println!("✨ Creating new configuration with defaults...");
        Configuration::default()
    };

    println!("\n📝 Please answer the following questions (press Enter to use default):\n");

    let level = prompt(
        "Log level (error/warn/info/debug/trace)",
        match config.log_level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        },
    )?;
    if !level.is_empty() {
        config.log_level = match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => {
                println!("⚠️  Invalid log level, using default");
                config.log_level.clone()
            }
        };
    }

    let data_dir = prompt("Data directory", &config.data_dir().display().to_string())?;
    if !data_dir.is_empty() {
        config.data_dir = Some(PathBuf::from(data_dir));
    }

    let pipeline = prompt("Pipeline definition file", &path_or_none(&config.pipeline_file))?;
    if !pipeline.is_empty() {
        config.pipeline_file = Some(PathBuf::from(pipeline));
    }

    let attempts = prompt(
        "Attempts per stage before review",
        &config.policy.default_max_attempts.to_string(),
    )?;
    if !attempts.is_empty() {
        match attempts.parse::<u32>() {
            Ok(n) => config.policy.default_max_attempts = n,
            Err(_) => println!("⚠️  Invalid number, using default"),
        }
    }

    let revisions = prompt(
        "Solution revisions before review",
        &config.policy.max_revisions.to_string(),
    )?;
    if !revisions.is_empty() {
        match revisions.parse::<u32>() {
            Ok(n) => config.policy.max_revisions = n,
            Err(_) => println!("⚠️  Invalid number, using default"),
        }
    }

    let knowledge = prompt(
        "Knowledge base directory",
        &path_or_none(&config.retrieval.knowledge_dir),
    )?;
    if !knowledge.is_empty() {
        config.retrieval.knowledge_dir = Some(PathBuf::from(knowledge));
    }

    let ocr = prompt(
        "OCR command for image input",
        config.input.ocr_command.as_deref().unwrap_or("none"),
    )?;
    if !ocr.is_empty() {
        config.input.ocr_command = Some(ocr);
    }

    println!("\n🔍 Validating configuration...");
    let result = PipelineValidator::validate_configuration(&config);
    print_validation(&result);
    if !result.is_valid() {
        bail!("Configuration not saved");
    }

    save_config(&config, &config_path)?;
    println!("\n💾 Configuration saved to {}", config_path.display());
    Ok(())
}

fn save_config(config: &Configuration, path: &Path) -> Result<()> {
    config
        .save_to_file(path)
        .map_err(|e| anyhow!("Failed to save configuration: {}", e))
}
