//! Meshcall CLI Application
//!
//! Runs call scenarios between simulated users on an in-process relay.

use anyhow::Result;
use clap::{Parser, Subcommand};
use meshcall_core::AgentConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Log negotiation steps
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario on the loopback relay
    Demo {
        #[command(subcommand)]
        scenario: Scenario,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum Scenario {
    /// Alice calls Bob, Bob answers, Alice hangs up
    Direct {
        /// Place a video call instead of a voice call
        #[arg(long)]
        video: bool,
    },

    /// Several users meet in one channel, then the last one leaves
    Mesh {
        /// Number of users, including the one starting the call
        #[arg(long, default_value_t = 3)]
        participants: usize,
    },

    /// Alice shares her screen during a video call with Bob
    ScreenShare,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "meshcall=debug" } else { "meshcall=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => AgentConfig::from_json_file(path)?,
        None => AgentConfig::default(),
    };
    tracing::debug!(?config, "Loaded configuration");

    match cli.command {
        Commands::Demo { scenario } => match scenario {
            Scenario::Direct { video } => demo::direct(config, video).await?,
            Scenario::Mesh { participants } => demo::mesh(config, participants).await?,
            Scenario::ScreenShare => demo::screen_share(config).await?,
        },
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
