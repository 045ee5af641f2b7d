use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Run(args) => runtime.block_on(cli::commands::run(args)),
        Commands::Submit(args) => runtime.block_on(cli::commands::submit(args)),
        Commands::Status(args) => runtime.block_on(cli::commands::status(args)),
        Commands::List(args) => runtime.block_on(cli::commands::list(args)),
        Commands::Stats => runtime.block_on(cli::commands::stats()),
        Commands::Clean(args) => runtime.block_on(cli::commands::clean(args)),
        Commands::Requeue(args) => runtime.block_on(cli::commands::requeue(args)),
        Commands::Providers(args) => runtime.block_on(cli::commands::providers(args)),
    }
}
