//! Review CLI commands

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum ReviewCommands {
    /// Keep the agent output and continue with the next stage
    Accept {
        /// Review handle (UUID)
        handle: String,

        /// Reviewer identity
        #[arg(short, long, default_value = "cli-reviewer")]
        reviewer: String,

        /// Pipeline definition file (overrides the configured one)
        #[arg(short, long)]
        pipeline: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Replace the stage output and continue with the next stage
    ///
    /// The value is the stage output as JSON, for example
    /// '{"expression": "x^2 - 5x + 6 = 0"}' for the parse stage.
    Correct {
        /// Review handle (UUID)
        handle: String,

        /// Corrected stage output (JSON)
        value: String,

        /// Reviewer identity
        #[arg(short, long, default_value = "cli-reviewer")]
        reviewer: String,

        /// Pipeline definition file (overrides the configured one)
        #[arg(short, long)]
        pipeline: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run the reviewed stage again
    Retry {
        /// Review handle (UUID)
        handle: String,

        /// Hint passed to the agent
        #[arg(long)]
        hint: Option<String>,

        /// Reviewer identity
        #[arg(short, long, default_value = "cli-reviewer")]
        reviewer: String,

        /// Pipeline definition file (overrides the configured one)
        #[arg(short, long)]
        pipeline: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Stop the run
    Abort {
        /// Review handle (UUID)
        handle: String,

        /// Reason recorded with the failure
        #[arg(long)]
        reason: Option<String>,

        /// Reviewer identity
        #[arg(short, long, default_value = "cli-reviewer")]
        reviewer: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show a pending review in detail
    Show {
        /// Review handle (UUID)
        handle: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}
