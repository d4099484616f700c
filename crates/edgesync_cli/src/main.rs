//! Edge Sync CLI
//!
//! Operator tools for a site's sync agent.
//!
//! # Commands
//!
//! - `status` - Probe the cloud and print the sync state
//! - `drain` - Deliver the offline queue now
//! - `pull` - Fetch cloud changes since an instant without applying them
//! - `check` - Run one health round
//! - `queue` - Inspect the offline queue file without contacting the cloud

mod commands;
mod settings;

use clap::{Parser, Subcommand};
use settings::{FileConfig, Overrides};
use std::error::Error;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Edge-cloud sync operator tools.
#[derive(Parser)]
#[command(name = "edgesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(global = true, short, long, env = "EDGESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Site identifier
    #[arg(global = true, long, env = "EDGESYNC_SITE_ID")]
    site_id: Option<String>,

    /// Cloud base URL
    #[arg(global = true, long, env = "EDGESYNC_CLOUD_URL")]
    cloud_url: Option<String>,

    /// Shared signing secret
    #[arg(global = true, long, env = "EDGESYNC_SIGNING_KEY", hide_env_values = true)]
    signing_key: Option<String>,

    /// Path to the offline queue file
    #[arg(global = true, long, env = "EDGESYNC_QUEUE_PATH")]
    queue_path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the cloud and print the sync state as JSON
    Status,

    /// Deliver the offline queue now
    Drain,

    /// Fetch cloud changes without applying them
    Pull {
        /// Only changes after this RFC 3339 instant
        #[arg(short, long)]
        since: Option<String>,

        /// Comma-separated entity types
        #[arg(short, long)]
        entities: Option<String>,
    },

    /// Run one health round and print the report as JSON
    Check,

    /// Inspect the offline queue file
    Queue {
        /// Maximum number of rows to list
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

impl Cli {
    fn settings(&self) -> Result<FileConfig, Box<dyn Error>> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(file.merge(Overrides {
            site_id: self.site_id.clone(),
            cloud_url: self.cloud_url.clone(),
            signing_key: self.signing_key.clone(),
            queue_path: self.queue_path.clone(),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Status => {
            commands::status::run(cli.settings()?.into_sync_config()?).await?;
        }
        Commands::Drain => {
            commands::drain::run(cli.settings()?.into_sync_config()?).await?;
        }
        Commands::Pull { since, entities } => {
            let config = cli.settings()?.into_sync_config()?;
            commands::pull::run(config, since.as_deref(), entities.as_deref()).await?;
        }
        Commands::Check => {
            commands::check::run(cli.settings()?.into_sync_config()?).await?;
        }
        Commands::Queue { limit, format } => {
            let path = cli
                .settings()?
                .queue_path
                .ok_or("queue path required for queue")?;
            commands::queue::run(&path, *limit, format)?;
        }
        Commands::Version => {
            println!("edgesync v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
