use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "fawkes-flow")]
#[command(version, about = "Value stream flow engine: stage transitions, WIP policy and flow metrics")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory containing `.fawkes/` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API, metrics aggregator and board sync worker
    Serve {
        /// Port to serve on (overrides flow.toml and FLOW_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides flow.toml and FLOW_DB_PATH)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create `.fawkes/` with a config template, stages file and database
    Init {
        /// Load the built-in stage catalog into the new database
        #[arg(long)]
        seed_defaults: bool,
    },
    /// Load a stages.yaml file into the database
    LoadStages {
        /// Path to the stages YAML file
        file: PathBuf,

        /// Update existing stages instead of skipping them
        #[arg(long)]
        update: bool,

        /// Show what would be done without making changes
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate flow.toml and, optionally, a stages file
    ValidateConfig {
        /// Stages YAML file to validate alongside the config
        #[arg(long)]
        stages: Option<PathBuf>,
    },
    /// Compare the stage projection with the transition log
    VerifyProjection {
        /// Replace the stored projection with the one rebuilt from the log
        #[arg(long)]
        repair: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // A missing .env is fine.
    let _ = dotenvy::from_path(project_dir.join(".env"));

    if let Commands::Init { seed_defaults } = &cli.command {
        return cmd::cmd_init(&project_dir, *seed_defaults);
    }

    let config = cmd::load_config(&project_dir)?;
    let _log_guard = fawkes_flow::telemetry::init_tracing(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Init { .. } => {}
        Commands::Serve { port, db_path, dev } => {
            let db_path = db_path.as_deref().map(|p| cmd::resolve(&project_dir, p));
            cmd::cmd_serve(config, *port, db_path, *dev).await?;
        }
        Commands::LoadStages {
            file,
            update,
            dry_run,
        } => {
            let file = cmd::resolve(&project_dir, file);
            cmd::cmd_load_stages(&config, &file, *update, *dry_run)?;
        }
        Commands::ValidateConfig { stages } => {
            let stages = stages.as_deref().map(|p| cmd::resolve(&project_dir, p));
            cmd::cmd_validate_config(&project_dir, &config, stages.as_deref())?;
        }
        Commands::VerifyProjection { repair } => {
            cmd::cmd_verify_projection(&config, *repair).await?;
        }
    }

    Ok(())
}
