use sqlx::SqlitePool;
use tracing::warn;

use crate::cli::context::build_registry;
use crate::cli::utils::{output_error, output_report};
use crate::cli::OutputFormat;
use crate::config::AppConfig;
use crate::database::manager::{HealthReport, TargetHealth};

/// Resolves every registered family first so the report covers all tenants,
/// not only the ones this process happens to have cached.
pub async fn handle(config: &AppConfig, output_format: OutputFormat) -> anyhow::Result<()> {
    let registry = build_registry(config).await?;

    let mut unresolved = Vec::new();
    for family_id in family_ids(registry.master()).await? {
        if let Err(e) = registry.resolve(&family_id).await {
            warn!(family_id = %family_id, error = %e, "Could not open tenant database");
            unresolved.push(family_id);
        }
    }

    let mut report = registry.health_check().await;
    mark_unavailable(&mut report, &unresolved);
    output_report(&output_format, &report, print_report)?;

    let healthy = report.is_healthy();
    registry.close_all().await;
    if !healthy {
        output_error(&output_format, "One or more databases are unavailable", Some("unavailable"))?;
        std::process::exit(1);
    }
    Ok(())
}

fn mark_unavailable(report: &mut HealthReport, family_ids: &[String]) {
    for family_id in family_ids {
        report
            .targets
            .insert(format!("family:{}", family_id), TargetHealth::Unavailable);
    }
}

async fn family_ids(master: &SqlitePool) -> anyhow::Result<Vec<String>> {
    Ok(sqlx::query_scalar("SELECT id FROM families ORDER BY created_at")
        .fetch_all(master)
        .await?)
}

fn print_report(report: &HealthReport) {
    println!("{:<42} {}", "TARGET", "STATUS");
    println!("{}", "-".repeat(55));
    for (target, health) in &report.targets {
        let status = match health {
            TargetHealth::Ok => "ok",
            TargetHealth::Unavailable => "UNAVAILABLE",
        };
        println!("{:<42} {}", target, status);
    }
}
