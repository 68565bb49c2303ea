use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::migrations::{self, MigrationError, MigrationOutcome, MigrationSet};
use super::provider::{DatabaseProvider, ProviderError, ProvisionedDatabase};

/// Errors from the tenant registry and master repositories
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Tenant not found for family: {0}")]
    TenantNotFound(String),

    #[error("Provisioning failed for {database}: {source}")]
    Provisioning {
        database: String,
        #[source]
        source: ProviderError,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DatabaseError {
    /// True when the underlying error is a UNIQUE/PRIMARY KEY violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DatabaseError::Sqlx(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Handle to a freshly provisioned tenant database
#[derive(Debug, Clone, Serialize)]
pub struct TenantHandle {
    pub family_id: String,
    pub database_name: String,
    pub url: String,
    pub hostname: String,
}

/// Tenant connection pool as attached to requests
#[derive(Clone, Debug)]
pub struct TenantPool(pub SqlitePool);

/// Per-family outcome of a registry-wide migration run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FamilyMigration {
    Migrated(MigrationOutcome),
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub master: MigrationOutcome,
    pub families: BTreeMap<String, FamilyMigration>,
}

impl MigrationReport {
    pub fn failed_families(&self) -> Vec<&str> {
        self.families
            .iter()
            .filter(|(_, m)| matches!(m, FamilyMigration::Failed { .. }))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetHealth {
    Ok,
    Unavailable,
}

/// Health per target: `master` plus `family:<id>` for every cached tenant.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub targets: BTreeMap<String, TargetHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.targets.values().all(|t| *t == TargetHealth::Ok)
    }
}

/// Open (or create) the master database.
pub async fn open_master(url: &str, max_connections: u32, busy_timeout: Duration) -> Result<SqlitePool, DatabaseError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    info!("Connected to master database");
    Ok(pool)
}

/// Name of the tenant database for a family id.
pub fn database_name_for(family_id: &str) -> String {
    let short: String = family_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("family-{}", short)
}

/// Maps family ids to live tenant pools and owns tenant provisioning.
pub struct TenantRegistry {
    master: SqlitePool,
    provider: Arc<dyn DatabaseProvider>,
    region: String,
    master_migrations: MigrationSet,
    family_migrations: MigrationSet,
    pools: RwLock<HashMap<String, SqlitePool>>,
}

impl TenantRegistry {
    pub fn new(master: SqlitePool, provider: Arc<dyn DatabaseProvider>, region: impl Into<String>) -> Result<Self, DatabaseError> {
        Ok(Self {
            master,
            provider,
            region: region.into(),
            master_migrations: MigrationSet::master()?,
            family_migrations: MigrationSet::family()?,
            pools: RwLock::new(HashMap::new()),
        })
    }

    pub fn master(&self) -> &SqlitePool {
        &self.master
    }

    /// Create the remote database for a family. Nothing is recorded in the
    /// master database here; the caller commits the family row with the handle
    /// and calls [`release`](Self::release) if that commit fails.
    pub async fn provision(&self, family_id: &str, family_name: &str) -> Result<TenantHandle, DatabaseError> {
        let database_name = database_name_for(family_id);
        let ProvisionedDatabase { name, url, hostname } = self
            .provider
            .create_database(&database_name, &self.region)
            .await
            .map_err(|source| DatabaseError::Provisioning {
                database: database_name.clone(),
                source,
            })?;

        info!(family_id, family_name, database = %name, "Provisioned tenant database");
        Ok(TenantHandle {
            family_id: family_id.to_string(),
            database_name: name,
            url,
            hostname,
        })
    }

    /// Undo a provision whose family row never got committed. A handle that a
    /// family row does reference is left alone.
    pub async fn release(&self, handle: &TenantHandle) {
        match self.family_exists(&handle.family_id).await {
            Ok(false) => {}
            Ok(true) => {
                warn!(family_id = %handle.family_id, "Tenant database is claimed by a family, not releasing");
                return;
            }
            Err(e) => {
                error!(family_id = %handle.family_id, error = %e, "Could not confirm tenant database is unclaimed, not releasing");
                return;
            }
        }

        self.evict(&handle.family_id).await;
        if let Err(e) = self.provider.delete_database(&handle.database_name).await {
            error!(
                family_id = %handle.family_id,
                database = %handle.database_name,
                error = %e,
                "Failed to release orphaned tenant database"
            );
        }
    }

    /// Resolve a family to its tenant pool, opening and caching it on first use.
    pub async fn resolve(&self, family_id: &str) -> Result<SqlitePool, DatabaseError> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(family_id) {
                return Ok(pool.clone());
            }
        }

        let url: Option<String> = sqlx::query_scalar("SELECT database_url FROM families WHERE id = ?")
            .bind(family_id)
            .fetch_optional(&self.master)
            .await?;
        let url = url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DatabaseError::TenantNotFound(family_id.to_string()))?;

        let opened = self
            .provider
            .connect(&url)
            .await
            .map_err(|source| DatabaseError::Provisioning {
                database: database_name_for(family_id),
                source,
            })?;

        // A concurrent delete may have removed the family while we were connecting
        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(family_id) {
            return Ok(pool.clone());
        }
        if !self.family_exists(family_id).await? {
            return Err(DatabaseError::TenantNotFound(family_id.to_string()));
        }
        pools.insert(family_id.to_string(), opened.clone());
        debug!(family_id, "Cached tenant pool");
        Ok(opened)
    }

    async fn family_exists(&self, family_id: &str) -> Result<bool, DatabaseError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM families WHERE id = ?")
            .bind(family_id)
            .fetch_optional(&self.master)
            .await?;
        Ok(found.is_some())
    }

    /// Tear down a family: remote database first, master row only after that succeeds.
    pub async fn delete(&self, family_id: &str) -> Result<(), DatabaseError> {
        let database_name: Option<String> = sqlx::query_scalar("SELECT database_name FROM families WHERE id = ?")
            .bind(family_id)
            .fetch_optional(&self.master)
            .await?;
        let database_name = database_name.ok_or_else(|| DatabaseError::TenantNotFound(family_id.to_string()))?;

        self.evict(family_id).await;

        match self.provider.delete_database(&database_name).await {
            Ok(()) => {}
            Err(ProviderError::NotFound(_)) => {
                warn!(family_id, database = %database_name, "Tenant database already gone, removing family record");
            }
            Err(source) => {
                return Err(DatabaseError::Provisioning {
                    database: database_name,
                    source,
                });
            }
        }

        sqlx::query("DELETE FROM families WHERE id = ?")
            .bind(family_id)
            .execute(&self.master)
            .await?;
        // Drops any pool a resolve cached while the remote delete was in flight
        self.evict(family_id).await;

        info!(family_id, database = %database_name, "Deleted family and tenant database");
        Ok(())
    }

    /// Open a freshly provisioned database and bring it to the latest family
    /// schema. Nothing is cached or recorded in the master database.
    pub async fn prepare(&self, handle: &TenantHandle) -> Result<(SqlitePool, MigrationOutcome), DatabaseError> {
        let pool = self
            .provider
            .connect(&handle.url)
            .await
            .map_err(|source| DatabaseError::Provisioning {
                database: handle.database_name.clone(),
                source,
            })?;

        match migrations::run_migrations(&pool, &self.family_migrations).await {
            Ok(outcome) => Ok((pool, outcome)),
            Err(e) => {
                pool.close().await;
                Err(e.into())
            }
        }
    }

    /// Bring one family database to the latest schema and record the version.
    pub async fn migrate_family(&self, family_id: &str) -> Result<MigrationOutcome, DatabaseError> {
        let pool = self.resolve(family_id).await?;
        let outcome = migrations::run_migrations(&pool, &self.family_migrations).await?;

        sqlx::query(
            "UPDATE families SET schema_version = MAX(schema_version, ?), updated_at = ? WHERE id = ?",
        )
        .bind(outcome.current_version)
        .bind(Utc::now())
        .bind(family_id)
        .execute(&self.master)
        .await?;

        Ok(outcome)
    }

    /// Master migrations first, then every family. A failing family is logged
    /// and reported without stopping the others.
    pub async fn run_migrations(&self) -> Result<MigrationReport, DatabaseError> {
        let master = migrations::run_migrations(&self.master, &self.master_migrations).await?;

        let family_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM families ORDER BY created_at")
            .fetch_all(&self.master)
            .await?;

        let mut families = BTreeMap::new();
        for family_id in family_ids {
            let result = match self.migrate_family(&family_id).await {
                Ok(outcome) => FamilyMigration::Migrated(outcome),
                Err(e) => {
                    error!(family_id = %family_id, error = %e, "Tenant migration failed, continuing with remaining families");
                    FamilyMigration::Failed { error: e.to_string() }
                }
            };
            families.insert(family_id, result);
        }

        Ok(MigrationReport { master, families })
    }

    /// Ping master and every cached tenant pool.
    pub async fn health_check(&self) -> HealthReport {
        let cached: Vec<(String, SqlitePool)> = {
            let pools = self.pools.read().await;
            pools.iter().map(|(id, pool)| (id.clone(), pool.clone())).collect()
        };

        let mut targets = BTreeMap::new();
        targets.insert("master".to_string(), ping("master", &self.master).await);

        let pings = cached.iter().map(|(id, pool)| async move {
            let target = format!("family:{}", id);
            let status = ping(&target, pool).await;
            (target, status)
        });
        for (target, status) in join_all(pings).await {
            targets.insert(target, status);
        }

        HealthReport { targets }
    }

    /// Drop a cached pool, closing its connections.
    pub async fn evict(&self, family_id: &str) {
        let removed = self.pools.write().await.remove(family_id);
        if let Some(pool) = removed {
            pool.close().await;
            debug!(family_id, "Evicted tenant pool");
        }
    }

    pub async fn cached_families(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// Close every pool (e.g., on shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<(String, SqlitePool)> = self.pools.write().await.drain().collect();
        for (family_id, pool) in drained {
            pool.close().await;
            debug!(family_id = %family_id, "Closed tenant pool");
        }
        self.master.close().await;
        info!("Closed all database pools");
    }
}

async fn ping(target: &str, pool: &SqlitePool) -> TargetHealth {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => TargetHealth::Ok,
        Err(e) => {
            warn!(health_target = target, error = %e, "Health check failed");
            TargetHealth::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    #[test]
    fn derives_database_names() {
        assert_eq!(
            database_name_for("0A1B2C3D4E5F67890A1B2C3D4E5F6789"),
            "family-0a1b2c3d4e5f6789"
        );
        assert!(crate::database::provider::is_valid_database_name(&database_name_for(
            "00112233445566778899aabbccddeeff"
        )));
    }

    #[tokio::test]
    async fn resolve_unknown_family_is_tenant_not_found() {
        let ctx = TestContext::new().await;
        let err = ctx.registry.resolve("does-not-exist").await.unwrap_err();
        assert!(matches!(err, DatabaseError::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn resolve_caches_one_pool_per_family() {
        let ctx = TestContext::new().await;
        let alice = ctx.register("alice@x.com", "Alice").await;
        let family = ctx.create_family(&alice, "Smiths").await;

        let (a, b) = tokio::join!(ctx.registry.resolve(&family.id), ctx.registry.resolve(&family.id));
        a.unwrap();
        b.unwrap();
        assert_eq!(ctx.registry.cached_families().await, vec![family.id.clone()]);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let ctx = TestContext::new().await;
        let alice = ctx.register("alice@x.com", "Alice").await;
        let bob = ctx.register("bob@x.com", "Bob").await;
        let smiths = ctx.create_family(&alice, "Smiths").await;
        let joneses = ctx.create_family(&bob, "Joneses").await;

        let (a, b) = tokio::join!(ctx.registry.resolve(&smiths.id), ctx.registry.resolve(&joneses.id));
        let (a, b) = (a.unwrap(), b.unwrap());

        let insert = |pool: SqlitePool, name: &'static str| async move {
            sqlx::query("INSERT INTO family_settings (key, value, updated_at) VALUES ('owner', ?, ?)")
                .bind(name)
                .bind(Utc::now())
                .execute(&pool)
                .await
                .unwrap();
        };
        tokio::join!(insert(a.clone(), "smiths"), insert(b.clone(), "joneses"));

        let in_a: Vec<String> = sqlx::query_scalar("SELECT value FROM family_settings").fetch_all(&a).await.unwrap();
        let in_b: Vec<String> = sqlx::query_scalar("SELECT value FROM family_settings").fetch_all(&b).await.unwrap();
        assert_eq!(in_a, vec!["smiths".to_string()]);
        assert_eq!(in_b, vec!["joneses".to_string()]);
    }

    #[tokio::test]
    async fn one_broken_tenant_does_not_block_the_rest() {
        let ctx = TestContext::new().await;
        let alice = ctx.register("alice@x.com", "Alice").await;
        let bob = ctx.register("bob@x.com", "Bob").await;
        let broken = ctx.create_family(&alice, "Broken").await;
        let healthy = ctx.create_family(&bob, "Healthy").await;

        // Point the first family at a location that cannot be opened.
        let unreachable = format!("sqlite://{}", ctx.dir.path().join("missing/dir/x.db").display());
        sqlx::query("UPDATE families SET database_url = ? WHERE id = ?")
            .bind(&unreachable)
            .bind(&broken.id)
            .execute(ctx.registry.master())
            .await
            .unwrap();
        ctx.registry.evict(&broken.id).await;

        let report = ctx.registry.run_migrations().await.unwrap();
        assert_eq!(report.failed_families(), vec![broken.id.as_str()]);
        assert!(matches!(report.families.get(&healthy.id), Some(FamilyMigration::Migrated(_))));

        let version: i64 = sqlx::query_scalar("SELECT schema_version FROM families WHERE id = ?")
            .bind(&healthy.id)
            .fetch_one(ctx.registry.master())
            .await
            .unwrap();
        assert_eq!(version, 4);
    }

    #[tokio::test]
    async fn delete_keeps_family_when_remote_delete_fails() {
        let ctx = TestContext::new().await;
        let alice = ctx.register("alice@x.com", "Alice").await;
        let family = ctx.create_family(&alice, "Smiths").await;

        // An invalid stored name makes the provider refuse the deletion.
        sqlx::query("UPDATE families SET database_name = 'Not_Valid' WHERE id = ?")
            .bind(&family.id)
            .execute(ctx.registry.master())
            .await
            .unwrap();

        assert!(ctx.registry.delete(&family.id).await.is_err());
        let still_there: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM families WHERE id = ?")
            .bind(&family.id)
            .fetch_one(ctx.registry.master())
            .await
            .unwrap();
        assert_eq!(still_there, 1);
    }

    #[tokio::test]
    async fn delete_removes_family_and_memberships() {
        let ctx = TestContext::new().await;
        let alice = ctx.register("alice@x.com", "Alice").await;
        let family = ctx.create_family(&alice, "Smiths").await;

        ctx.registry.delete(&family.id).await.unwrap();

        let memberships: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM family_memberships WHERE family_id = ?")
            .bind(&family.id)
            .fetch_one(ctx.registry.master())
            .await
            .unwrap();
        assert_eq!(memberships, 0);
        assert!(matches!(
            ctx.registry.resolve(&family.id).await,
            Err(DatabaseError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolve_racing_delete_does_not_outlive_the_family() {
        let ctx = TestContext::slow(Duration::ZERO, Duration::from_millis(300)).await;
        let alice = ctx.register("alice@x.com", "Alice").await;
        let family = ctx.create_family(&alice, "Smiths").await;

        let registry = ctx.registry.clone();
        let family_id = family.id.clone();
        let deleting = tokio::spawn(async move { registry.delete(&family_id).await });

        // The family row is still present while the remote delete is in flight
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = ctx.registry.resolve(&family.id).await;

        deleting.await.unwrap().unwrap();
        assert!(matches!(
            ctx.registry.resolve(&family.id).await,
            Err(DatabaseError::TenantNotFound(_))
        ));
        assert!(ctx.registry.cached_families().await.is_empty());
    }

    #[tokio::test]
    async fn release_skips_claimed_databases() {
        let ctx = TestContext::new().await;
        let alice = ctx.register("alice@x.com", "Alice").await;
        let family = ctx.create_family(&alice, "Smiths").await;

        let handle = TenantHandle {
            family_id: family.id.clone(),
            database_name: family.database_name.clone(),
            url: family.database_url.clone(),
            hostname: "localhost".to_string(),
        };
        ctx.registry.release(&handle).await;

        assert_eq!(ctx.tenant_files(), vec![format!("{}.db", family.database_name)]);
        ctx.registry.resolve(&family.id).await.unwrap();
    }

    #[tokio::test]
    async fn health_check_reports_every_cached_target() {
        let ctx = TestContext::new().await;
        let alice = ctx.register("alice@x.com", "Alice").await;
        let family = ctx.create_family(&alice, "Smiths").await;
        ctx.registry.resolve(&family.id).await.unwrap();

        let report = ctx.registry.health_check().await;
        assert!(report.is_healthy());
        assert_eq!(report.targets.get("master"), Some(&TargetHealth::Ok));
        assert_eq!(report.targets.get(&format!("family:{}", family.id)), Some(&TargetHealth::Ok));
    }
}
