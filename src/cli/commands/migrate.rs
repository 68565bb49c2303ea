use anyhow::Context;

use crate::cli::context::build_registry;
use crate::cli::utils::{output_error, output_report};
use crate::cli::OutputFormat;
use crate::config::AppConfig;
use crate::database::manager::{FamilyMigration, MigrationReport};

pub async fn handle(config: &AppConfig, output_format: OutputFormat) -> anyhow::Result<()> {
    let registry = build_registry(config).await?;
    let report = registry.run_migrations().await.context("master migrations failed")?;

    output_report(&output_format, &report, print_report)?;

    let failed = report.failed_families().len();
    registry.close_all().await;
    if failed > 0 {
        output_error(
            &output_format,
            &format!("{} family database(s) failed to migrate", failed),
            Some("migration_failed"),
        )?;
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &MigrationReport) {
    println!(
        "master: v{} -> v{} ({} applied)",
        report.master.previous_version,
        report.master.current_version,
        report.master.applied.len()
    );

    if report.families.is_empty() {
        println!("No families");
        return;
    }

    println!("{:<34} {}", "FAMILY", "RESULT");
    println!("{}", "-".repeat(60));
    for (family_id, result) in &report.families {
        match result {
            FamilyMigration::Migrated(outcome) => println!(
                "{:<34} v{} -> v{} ({} applied)",
                family_id,
                outcome.previous_version,
                outcome.current_version,
                outcome.applied.len()
            ),
            FamilyMigration::Failed { error } => println!("{:<34} FAILED: {}", family_id, error),
        }
    }
}
