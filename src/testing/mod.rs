use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::database::manager::{open_master, TenantRegistry};
use crate::database::models::{Family, User};
use crate::database::provider::{DatabaseProvider, LocalProvider, PoolSettings, ProviderError, ProvisionedDatabase};
use crate::services::{AuthService, FamilyService};

/// Password every helper-registered user gets.
pub const TEST_PASSWORD: &str = "password123";

// bcrypt minimum
const TEST_BCRYPT_COST: u32 = 4;

/// Fully wired master database, local provider, registry and services in a temp directory.
pub struct TestContext {
    pub dir: TempDir,
    pub registry: Arc<TenantRegistry>,
    pub auth: AuthService,
    pub families: FamilyService,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::slow(Duration::ZERO, Duration::ZERO).await
    }

    /// Like [`new`](Self::new), with a provider that stalls before connecting
    /// to or deleting a tenant database.
    pub async fn slow(connect_delay: Duration, delete_delay: Duration) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let master_url = format!("sqlite://{}", dir.path().join("master.db").display());
        let master = open_master(&master_url, 4, Duration::from_secs(5))
            .await
            .expect("open master database");

        let provider = SlowProvider {
            inner: LocalProvider::new(dir.path().join("families"), PoolSettings::default()),
            connect_delay,
            delete_delay,
        };
        let registry = Arc::new(TenantRegistry::new(master, Arc::new(provider), "local").expect("registry"));
        registry.run_migrations().await.expect("master migrations");

        let auth = AuthService::new(registry.master().clone(), TEST_BCRYPT_COST);
        let families = FamilyService::new(registry.clone(), auth.clone());

        Self {
            dir,
            registry,
            auth,
            families,
        }
    }

    /// Register a user with [`TEST_PASSWORD`].
    pub async fn register(&self, email: &str, name: &str) -> User {
        self.auth.register(email, name, TEST_PASSWORD).await.expect("register user")
    }

    pub async fn create_family(&self, manager: &User, name: &str) -> Family {
        self.families.create_family(manager, name).await.expect("create family")
    }

    /// Tenant database files currently on disk.
    pub fn tenant_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path().join("families"))
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.ends_with(".db"))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Local provider with injected latency.
struct SlowProvider {
    inner: LocalProvider,
    connect_delay: Duration,
    delete_delay: Duration,
}

#[async_trait]
impl DatabaseProvider for SlowProvider {
    async fn create_database(&self, name: &str, region: &str) -> Result<ProvisionedDatabase, ProviderError> {
        self.inner.create_database(name, region).await
    }

    async fn delete_database(&self, name: &str) -> Result<(), ProviderError> {
        tokio::time::sleep(self.delete_delay).await;
        self.inner.delete_database(name).await
    }

    async fn connect(&self, url: &str) -> Result<SqlitePool, ProviderError> {
        tokio::time::sleep(self.connect_delay).await;
        self.inner.connect(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn contexts_are_isolated() {
        let a = TestContext::new().await;
        let b = TestContext::new().await;
        a.register("alice@x.com", "Alice").await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(b.registry.master())
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_ne!(a.dir.path(), b.dir.path());
    }
}
