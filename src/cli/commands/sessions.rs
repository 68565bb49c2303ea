use clap::Subcommand;
use serde_json::json;

use crate::cli::context::build_registry;
use crate::cli::utils::output_success;
use crate::cli::OutputFormat;
use crate::config::AppConfig;
use crate::services::AuthService;

#[derive(Subcommand)]
pub enum SessionCommands {
    #[command(about = "Delete every expired session")]
    Cleanup,
}

pub async fn handle(cmd: SessionCommands, config: &AppConfig, output_format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        SessionCommands::Cleanup => {
            let registry = build_registry(config).await?;
            let auth = AuthService::new(registry.master().clone(), config.security.bcrypt_cost);
            let removed = auth.cleanup_expired_sessions().await?;
            registry.close_all().await;

            output_success(
                &output_format,
                &format!("Removed {} expired session(s)", removed),
                Some(json!({ "removed": removed })),
            )
        }
    }
}
