use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{AppConfig, ProvisionerKind};
use crate::database::manager::{open_master, TenantRegistry};
use crate::database::provider::{DatabaseProvider, HttpProvider, HttpProviderSettings, LocalProvider, PoolSettings};

/// Build the provider selected by configuration.
pub fn build_provider(config: &AppConfig) -> anyhow::Result<Arc<dyn DatabaseProvider>> {
    let pool = PoolSettings {
        max_connections: config.database.tenant_max_connections,
        busy_timeout: config.database.busy_timeout(),
    };
    let provisioning = &config.provisioning;

    let provider: Arc<dyn DatabaseProvider> = match provisioning.kind {
        ProvisionerKind::Local => {
            info!(data_dir = %provisioning.data_dir, "Using local tenant provisioner");
            Arc::new(LocalProvider::new(&provisioning.data_dir, pool))
        }
        ProvisionerKind::Http => {
            if provisioning.api_url.is_empty() || provisioning.organization.is_empty() {
                anyhow::bail!("PROVISIONER_API_URL and PROVISIONER_ORGANIZATION are required for the http provisioner");
            }
            info!(api_url = %provisioning.api_url, organization = %provisioning.organization, "Using remote tenant provisioner");
            let provider = HttpProvider::new(HttpProviderSettings {
                api_url: provisioning.api_url.clone(),
                organization: provisioning.organization.clone(),
                api_token: provisioning.api_token.clone(),
                url_template: provisioning.url_template.clone(),
                request_timeout: Duration::from_secs(provisioning.timeout_secs),
                max_retries: provisioning.max_retries,
                pool,
            })
            .context("failed to build provisioning client")?;
            Arc::new(provider)
        }
    };
    Ok(provider)
}

/// Open the master database and wire the tenant registry around it.
pub async fn build_registry(config: &AppConfig) -> anyhow::Result<Arc<TenantRegistry>> {
    ensure_parent_dir(&config.database.master_url).await?;
    let master = open_master(
        &config.database.master_url,
        config.database.max_connections,
        config.database.busy_timeout(),
    )
    .await
    .with_context(|| format!("failed to open master database {}", config.database.master_url))?;

    let provider = build_provider(config)?;
    let registry = TenantRegistry::new(master, provider, config.provisioning.region.clone())
        .context("invalid embedded migrations")?;
    Ok(Arc::new(registry))
}

// SQLite creates the file but not its directory
async fn ensure_parent_dir(url: &str) -> anyhow::Result<()> {
    let path = url.strip_prefix("sqlite://").unwrap_or(url);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}
