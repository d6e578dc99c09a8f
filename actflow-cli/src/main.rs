mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "actflow")]
#[command(about = "Run GitHub Actions style workflows locally")]
#[command(version)]
struct Cli {
    /// Log engine internals at debug level
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a workflow
    Run(commands::run::RunArgs),

    /// Validate a workflow file
    Validate(commands::validate::ValidateArgs),

    /// Print the expanded matrix of each job
    Matrix(commands::matrix::MatrixArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Matrix(args) => commands::matrix::execute(args),
    }
}
