pub mod commands;
pub mod context;
pub mod utils;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Tally - multi-tenant family expense API server and admin tools")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the RPC server (default)")]
    Serve,

    #[command(about = "Apply master and family database migrations")]
    Migrate,

    #[command(about = "Session maintenance")]
    Sessions {
        #[command(subcommand)]
        cmd: commands::sessions::SessionCommands,
    },

    #[command(about = "Check master and tenant database connectivity")]
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);
    let config = crate::config::config();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => commands::serve::handle(config).await,
        Commands::Migrate => commands::migrate::handle(config, output_format).await,
        Commands::Sessions { cmd } => commands::sessions::handle(cmd, config, output_format).await,
        Commands::Health => commands::health::handle(config, output_format).await,
    }
}
