mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::handlers;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mentorloop")]
#[command(version = "0.1.0")]
#[command(about = "Multi-agent math tutor pipeline with human review")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    /// Path to configuration file (defaults to ~/.config/mentorloop/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a math problem through the agent pipeline
    ///
    /// The run stops early when a stage needs human review; the printed
    /// handle is used with `mentorloop review`.
    ///
    /// Examples:
    ///   mentorloop solve "Solve x^2 - 5x + 6 = 0"
    ///   mentorloop solve --image homework.png --session alice
    ///   mentorloop solve "d/dx sin(x)" --pipeline ./tutor.yaml --json
    Solve {
        /// Problem text
        #[arg(required_unless_present_any = ["image", "audio"])]
        problem: Option<String>,

        /// Image of the problem, converted with the configured OCR command
        #[arg(long, conflicts_with_all = ["problem", "audio"])]
        image: Option<PathBuf>,

        /// Recording of the problem, converted with the configured speech command
        #[arg(long, conflicts_with_all = ["problem", "image"])]
        audio: Option<PathBuf>,

        /// Session the run belongs to (a new one is created when omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Pipeline definition file (overrides the configured one)
        #[arg(short, long)]
        pipeline: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List reviews waiting for a decision
    Reviews {
        /// Only reviews of this run
        #[arg(short, long)]
        run: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Decide a pending review and continue the run
    Review {
        #[command(subcommand)]
        command: cli::review::ReviewCommands,
    },

    /// Show the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the full transition trace of a run
    Trace {
        /// Run ID (UUID)
        run_id: String,

        /// Include stage outputs
        #[arg(short, long)]
        verbose: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the finished runs of a session
    History {
        /// Session ID
        session: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show run metrics
    Metrics {
        /// Session ID (optional, all sessions if not specified)
        #[arg(short, long)]
        session: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration and a pipeline definition
    Validate {
        /// Pipeline definition file (defaults to the configured one)
        pipeline: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Cancel a run and withdraw its pending reviews
    Cancel {
        /// Run ID (UUID)
        run_id: String,

        /// Reason recorded in the trace
        #[arg(short, long)]
        reason: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Continue runs left running by an interrupted process
    Recover {
        /// Run ID (UUID); lists incomplete runs when omitted
        run_id: Option<String>,

        /// Pipeline definition file (overrides the configured one)
        #[arg(short, long)]
        pipeline: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Configure mentorloop settings interactively
    Config {
        /// Start interactive configuration setup
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command {
        Commands::Solve {
            problem,
            image,
            audio,
            session,
            pipeline,
            json,
        } => {
            handlers::handle_solve(
                config_path,
                problem,
                image,
                audio,
                session,
                pipeline,
                json,
            )
            .await?;
        }
        Commands::Reviews { run, json } => {
            cli::review_handlers::handle_reviews(config_path, run, json).await?;
        }
        Commands::Review { command } => {
            cli::review_handlers::handle_review_command(config_path, command).await?;
        }
        Commands::Status { run_id, json } => {
            handlers::handle_status(config_path, run_id, json).await?;
        }
        Commands::Trace {
            run_id,
            verbose,
            json,
        } => {
            handlers::handle_trace(config_path, run_id, verbose, json).await?;
        }
        Commands::History { session, json } => {
            handlers::handle_history(config_path, session, json).await?;
        }
        Commands::Metrics { session, json } => {
            handlers::handle_metrics(config_path, session, json).await?;
        }
        Commands::Validate { pipeline, json } => {
            handlers::handle_validate(config_path, pipeline, json).await?;
        }
        Commands::Cancel {
            run_id,
            reason,
            json,
        } => {
            handlers::handle_cancel(config_path, run_id, reason, json).await?;
        }
        Commands::Recover {
            run_id,
            pipeline,
            json,
        } => {
            handlers::handle_recover(config_path, run_id, pipeline, json).await?;
        }
        Commands::Config { init } => {
            if init {
                handlers::handle_config_init(config_path).await?;
            } else {
                println!("Config command requires --init flag");
                println!("Usage: mentorloop config --init [--config PATH]");
            }
        }
    }

    Ok(())
}
