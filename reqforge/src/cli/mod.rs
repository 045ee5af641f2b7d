//! Command-line interface definition

pub mod commands;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "reqforge", about = "Requirement-to-code pipeline", version)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker pool in the foreground
    Run(RunArgs),
    /// Submit a requirement for processing
    Submit(SubmitArgs),
    /// Show the status of one task
    Status(StatusArgs),
    /// List tasks, optionally filtered
    List(ListArgs),
    /// Show queue statistics
    Stats,
    /// Purge old terminal jobs from the queue
    Clean(CleanArgs),
    /// Re-queue a completed or failed task
    Requeue(StatusArgs),
    /// List configured LLM providers
    Providers(ProvidersArgs),
}

#[derive(Args, Debug)]
pub struct ProvidersArgs {
    /// Send a canary prompt to each provider and report liveness
    #[arg(long)]
    pub probe: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Override the worker count from MAX_CONCURRENT_TASKS
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Project identifier
    #[arg(long)]
    pub project: String,

    /// Remote repository URL
    #[arg(long)]
    pub repository: String,

    /// Target branch
    #[arg(long)]
    pub branch: String,

    /// Requirement text (or @path to read it from a file)
    pub requirement: String,

    /// Priority: low, medium, high, critical
    #[arg(long, default_value = "medium")]
    pub priority: String,

    /// Target language
    #[arg(long, default_value = "typescript")]
    pub language: String,

    /// Free-form additional context for generation
    #[arg(long)]
    pub context: Option<String>,

    /// Output sub-path inside the repository
    #[arg(long)]
    pub output_path: Option<String>,

    /// Template id to seed the analysis with
    #[arg(long)]
    pub template: Option<Uuid>,

    /// Generate with every local model and push comparison branches
    #[arg(long)]
    pub multi_model: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Task identifier
    pub task_id: Uuid,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Filter by project identifier
    #[arg(long)]
    pub project: Option<String>,

    /// Filter by status: pending, in_progress, completed, failed
    #[arg(long)]
    pub status: Option<String>,
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Grace period in seconds; terminal jobs older than this are removed
    #[arg(long, default_value_t = 3600)]
    pub grace: u64,
}
