use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from the database provisioning backend
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Database already exists: {0}")]
    AlreadyExists(String),

    #[error("Database not found: {0}")]
    NotFound(String),

    #[error("Invalid database name: {0}")]
    InvalidName(String),

    #[error("Provisioning API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Provisioning request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid provisioning URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl ProviderError {
    /// Transport failures and 5xx responses are worth another attempt.
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(e) => !e.is_builder() && !e.is_decode(),
            ProviderError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// A freshly created tenant database as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedDatabase {
    pub name: String,
    pub url: String,
    pub hostname: String,
}

/// Pool sizing applied to every tenant connection handed out by a provider
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Remote database-as-a-service contract used by the tenant registry.
#[async_trait]
pub trait DatabaseProvider: Send + Sync {
    async fn create_database(&self, name: &str, region: &str) -> Result<ProvisionedDatabase, ProviderError>;

    async fn delete_database(&self, name: &str) -> Result<(), ProviderError>;

    /// Open a pool for a database URL. Pools are lazy: no I/O happens until first use.
    async fn connect(&self, url: &str) -> Result<SqlitePool, ProviderError>;
}

/// Tenant database names: lowercase ascii alphanumerics and '-', 3..=64 chars.
pub fn is_valid_database_name(name: &str) -> bool {
    (3..=64).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
}

/// Build a lazy SQLite pool for an existing database. A missing file is an
/// error on first use, never an empty database.
pub fn lazy_pool(url: &str, settings: &PoolSettings) -> Result<SqlitePool, ProviderError> {
    Ok(SqlitePoolOptions::new()
        .max_connections(settings.max_connections)
        .connect_lazy_with(connect_options(url, settings)?))
}

fn connect_options(url: &str, settings: &PoolSettings) -> Result<SqliteConnectOptions, ProviderError> {
    Ok(SqliteConnectOptions::from_str(url)?
        .create_if_missing(false)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(settings.busy_timeout))
}

/// Provisions one SQLite file per tenant under a data directory.
pub struct LocalProvider {
    root: PathBuf,
    settings: PoolSettings,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>, settings: PoolSettings) -> Self {
        Self {
            root: root.into(),
            settings,
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.db", name))
    }

    fn url_for(path: &Path) -> String {
        format!("sqlite://{}", path.display())
    }
}

#[async_trait]
impl DatabaseProvider for LocalProvider {
    async fn create_database(&self, name: &str, _region: &str) -> Result<ProvisionedDatabase, ProviderError> {
        if !is_valid_database_name(name) {
            return Err(ProviderError::InvalidName(name.to_string()));
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(name);
        if tokio::fs::try_exists(&path).await? {
            return Err(ProviderError::AlreadyExists(name.to_string()));
        }

        let url = Self::url_for(&path);
        // Only creation may bring a file into existence
        let mut conn = connect_options(&url, &self.settings)?
            .create_if_missing(true)
            .connect()
            .await?;
        sqlx::query("SELECT 1").execute(&mut conn).await?;
        conn.close().await?;

        info!(database = %name, path = %path.display(), "Created local tenant database");
        Ok(ProvisionedDatabase {
            name: name.to_string(),
            url,
            hostname: "localhost".to_string(),
        })
    }

    async fn delete_database(&self, name: &str) -> Result<(), ProviderError> {
        if !is_valid_database_name(name) {
            return Err(ProviderError::InvalidName(name.to_string()));
        }

        let path = self.path_for(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        for suffix in ["-wal", "-shm"] {
            let companion = PathBuf::from(format!("{}{}", path.display(), suffix));
            if let Err(e) = tokio::fs::remove_file(&companion).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %companion.display(), error = %e, "Failed to remove database companion file");
                }
            }
        }

        info!(database = %name, "Deleted local tenant database");
        Ok(())
    }

    async fn connect(&self, url: &str) -> Result<SqlitePool, ProviderError> {
        lazy_pool(url, &self.settings)
    }
}

/// Settings for the remote platform API
#[derive(Debug, Clone)]
pub struct HttpProviderSettings {
    pub api_url: String,
    pub organization: String,
    pub api_token: String,
    /// Connection URL template; `{name}` and `{hostname}` are substituted.
    pub url_template: String,
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub pool: PoolSettings,
}

#[derive(Debug, Serialize)]
struct CreateDatabaseBody<'a> {
    name: &'a str,
    group: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateDatabaseResponse {
    database: RemoteDatabase,
}

#[derive(Debug, Deserialize)]
struct RemoteDatabase {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Hostname")]
    hostname: String,
}

/// Provisions tenant databases through a remote platform API.
pub struct HttpProvider {
    client: reqwest::Client,
    settings: HttpProviderSettings,
    retry_policy: ExponentialBuilder,
}

impl HttpProvider {
    pub fn new(settings: HttpProviderSettings) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tally-api/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(settings.request_timeout)
            .build()?;

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(3))
            .with_max_times(settings.max_retries)
            .with_jitter();

        Ok(Self {
            client,
            settings,
            retry_policy,
        })
    }

    fn databases_url(&self) -> Result<url::Url, ProviderError> {
        let base = url::Url::parse(&self.settings.api_url)?;
        Ok(base.join(&format!(
            "v1/organizations/{}/databases",
            self.settings.organization
        ))?)
    }

    fn connection_url(&self, name: &str, hostname: &str) -> String {
        self.settings
            .url_template
            .replace("{name}", name)
            .replace("{hostname}", hostname)
    }

    async fn check(resp: reqwest::Response, name: &str) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            404 => ProviderError::NotFound(name.to_string()),
            409 => ProviderError::AlreadyExists(name.to_string()),
            code => ProviderError::Api { status: code, message },
        })
    }
}

#[async_trait]
impl DatabaseProvider for HttpProvider {
    async fn create_database(&self, name: &str, region: &str) -> Result<ProvisionedDatabase, ProviderError> {
        if !is_valid_database_name(name) {
            return Err(ProviderError::InvalidName(name.to_string()));
        }
        let endpoint = self.databases_url()?;
        let body = CreateDatabaseBody { name, group: region };

        let created: CreateDatabaseResponse = (|| async {
            let resp = self
                .client
                .post(endpoint.clone())
                .bearer_auth(&self.settings.api_token)
                .json(&body)
                .send()
                .await?;
            let resp = Self::check(resp, name).await?;
            Ok::<_, ProviderError>(resp.json::<CreateDatabaseResponse>().await?)
        })
        .retry(self.retry_policy.clone())
        .when(ProviderError::is_retryable)
        .notify(|err: &ProviderError, dur: Duration| {
            warn!(database = %name, error = %err, "Create database failed, retrying in {:?}", dur);
        })
        .await?;

        let remote = created.database;
        info!(database = %remote.name, hostname = %remote.hostname, "Provisioned remote tenant database");
        Ok(ProvisionedDatabase {
            url: self.connection_url(&remote.name, &remote.hostname),
            name: remote.name,
            hostname: remote.hostname,
        })
    }

    async fn delete_database(&self, name: &str) -> Result<(), ProviderError> {
        if !is_valid_database_name(name) {
            return Err(ProviderError::InvalidName(name.to_string()));
        }
        let mut endpoint = self.databases_url()?;
        endpoint
            .path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .push(name);

        (|| async {
            let resp = self
                .client
                .delete(endpoint.clone())
                .bearer_auth(&self.settings.api_token)
                .send()
                .await?;
            Self::check(resp, name).await?;
            Ok::<_, ProviderError>(())
        })
        .retry(self.retry_policy.clone())
        .when(ProviderError::is_retryable)
        .notify(|err: &ProviderError, dur: Duration| {
            warn!(database = %name, error = %err, "Delete database failed, retrying in {:?}", dur);
        })
        .await?;

        info!(database = %name, "Deleted remote tenant database");
        Ok(())
    }

    async fn connect(&self, url: &str) -> Result<SqlitePool, ProviderError> {
        lazy_pool(url, &self.settings.pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path as AxumPath, http::StatusCode, routing::{delete, post}, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn validates_database_names() {
        assert!(is_valid_database_name("family-0a1b2c3d4e5f6789"));
        assert!(!is_valid_database_name("Family-01"));
        assert!(!is_valid_database_name("family_01"));
        assert!(!is_valid_database_name("-family"));
        assert!(!is_valid_database_name("ab"));
        assert!(!is_valid_database_name("family; drop"));
    }

    #[tokio::test]
    async fn local_provider_creates_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path(), PoolSettings::default());

        let db = provider.create_database("family-abc", "local").await.unwrap();
        assert!(db.url.starts_with("sqlite://"));
        assert!(dir.path().join("family-abc.db").exists());

        let dup = provider.create_database("family-abc", "local").await;
        assert!(matches!(dup, Err(ProviderError::AlreadyExists(_))));

        provider.delete_database("family-abc").await.unwrap();
        assert!(!dir.path().join("family-abc.db").exists());

        let gone = provider.delete_database("family-abc").await;
        assert!(matches!(gone, Err(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn connecting_to_a_vanished_database_does_not_recreate_it() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path(), PoolSettings::default());
        let db = provider.create_database("family-abc", "local").await.unwrap();
        provider.delete_database("family-abc").await.unwrap();

        let pool = provider.connect(&db.url).await.unwrap();
        assert!(sqlx::query("SELECT 1").execute(&pool).await.is_err());
        assert!(!dir.path().join("family-abc.db").exists());
    }

    async fn spawn_platform(failures_before_success: usize) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let create_calls = calls.clone();
        let app = Router::new()
            .route(
                "/v1/organizations/acme/databases",
                post(move |Json(body): Json<serde_json::Value>| {
                    let calls = create_calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < failures_before_success {
                            return (StatusCode::BAD_GATEWAY, Json(serde_json::json!({"error": "busy"})));
                        }
                        let name = body["name"].as_str().unwrap_or_default().to_string();
                        (
                            StatusCode::OK,
                            Json(serde_json::json!({
                                "database": {"Name": name, "Hostname": format!("{}.db.example", name)}
                            })),
                        )
                    }
                }),
            )
            .route(
                "/v1/organizations/acme/databases/:name",
                delete(|AxumPath(name): AxumPath<String>| async move {
                    if name == "family-missing" {
                        StatusCode::NOT_FOUND
                    } else {
                        StatusCode::OK
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/", addr), calls)
    }

    fn http_settings(api_url: String) -> HttpProviderSettings {
        HttpProviderSettings {
            api_url,
            organization: "acme".to_string(),
            api_token: "secret".to_string(),
            url_template: "sqlite:///srv/tenants/{hostname}.db".to_string(),
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            pool: PoolSettings::default(),
        }
    }

    #[tokio::test]
    async fn http_provider_retries_server_errors() {
        let (api_url, calls) = spawn_platform(2).await;
        let provider = HttpProvider::new(http_settings(api_url)).unwrap();

        let db = provider.create_database("family-abc", "eu").await.unwrap();
        assert_eq!(db.name, "family-abc");
        assert_eq!(db.hostname, "family-abc.db.example");
        assert_eq!(db.url, "sqlite:///srv/tenants/family-abc.db.example.db");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn http_provider_maps_not_found_on_delete() {
        let (api_url, _) = spawn_platform(0).await;
        let provider = HttpProvider::new(http_settings(api_url)).unwrap();

        provider.delete_database("family-abc").await.unwrap();
        let missing = provider.delete_database("family-missing").await;
        assert!(matches!(missing, Err(ProviderError::NotFound(_))));
    }
}
