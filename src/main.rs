use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use medimimes::{cli, config, server};

#[derive(Parser)]
#[command(name = "medimimes", version, about = "Medication adherence tracker with reminders and an assistant")]
struct Cli {
    /// Config file (default: ~/.medimimes/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server and the reminder scheduler
    Serve,
    /// Mark overdue pending doses as missed and exit
    CheckMissed,
    /// Print database totals, or one user's adherence
    Report {
        /// Username to report on
        #[arg(long)]
        user: Option<String>,
    },
    /// Manage the assistant's knowledge base
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum KbAction {
    /// Ingest text or markdown files (directories are expanded)
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Remove an ingested document by file name
    Remove { source: String },
    /// Show the passages retrieved for a question
    Search { query: String },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.medimimes/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::MediConfig::load_from(path)?,
        None => config::MediConfig::load()?,
    };

    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => server::serve(config).await?,
        Command::CheckMissed => cli::report::check_missed(&config)?,
        Command::Report { user } => cli::report::report(&config, user.as_deref())?,
        Command::Kb { action } => match action {
            KbAction::Ingest { paths } => cli::knowledge::ingest(&config, &paths).await?,
            KbAction::Remove { source } => cli::knowledge::remove(&config, &source)?,
            KbAction::Search { query } => cli::knowledge::search(&config, &query).await?,
        },
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.embedding).await?,
        },
    }

    Ok(())
}
