use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the migration runner
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Invalid migration file name: {0}")]
    InvalidName(String),

    #[error("Migration versions must be strictly increasing and positive (saw {0})")]
    OutOfOrder(i64),

    #[error("Migration {version} ({name}) failed: {source}")]
    Failed {
        version: i64,
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Which schema a migration set targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    Master,
    Family,
}

impl MigrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationKind::Master => "master",
            MigrationKind::Family => "family",
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One versioned SQL script
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub sql: &'static str,
}

impl Migration {
    /// Build from a file name with a zero-padded numeric prefix, e.g. `0003_expenses.sql`.
    pub fn from_file(file_name: &str, sql: &'static str) -> Result<Self, MigrationError> {
        let stem = file_name.strip_suffix(".sql").unwrap_or(file_name);
        let (prefix, name) = stem
            .split_once('_')
            .ok_or_else(|| MigrationError::InvalidName(file_name.to_string()))?;
        let version: i64 = prefix
            .parse()
            .map_err(|_| MigrationError::InvalidName(file_name.to_string()))?;
        if name.is_empty() {
            return Err(MigrationError::InvalidName(file_name.to_string()));
        }

        Ok(Self {
            version,
            name: name.to_string(),
            sql,
        })
    }

    pub fn checksum(&self) -> String {
        format!("{:x}", Sha256::digest(self.sql.as_bytes()))
    }
}

/// An ordered set of migrations sharing one version space
#[derive(Debug, Clone)]
pub struct MigrationSet {
    pub kind: MigrationKind,
    migrations: Vec<Migration>,
}

impl MigrationSet {
    pub fn new(kind: MigrationKind, migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        let mut last = 0;
        for m in &migrations {
            if m.version <= last {
                return Err(MigrationError::OutOfOrder(m.version));
            }
            last = m.version;
        }
        Ok(Self { kind, migrations })
    }

    /// Schema for the shared master database
    pub fn master() -> Result<Self, MigrationError> {
        Self::new(
            MigrationKind::Master,
            vec![
                Migration::from_file("0001_users.sql", include_str!("../../migrations/master/0001_users.sql"))?,
                Migration::from_file("0002_families.sql", include_str!("../../migrations/master/0002_families.sql"))?,
                Migration::from_file(
                    "0003_user_sessions.sql",
                    include_str!("../../migrations/master/0003_user_sessions.sql"),
                )?,
                Migration::from_file(
                    "0004_session_tokens.sql",
                    include_str!("../../migrations/master/0004_session_tokens.sql"),
                )?,
            ],
        )
    }

    /// Schema applied to every family database
    pub fn family() -> Result<Self, MigrationError> {
        Self::new(
            MigrationKind::Family,
            vec![
                Migration::from_file(
                    "0001_categories.sql",
                    include_str!("../../migrations/family/0001_categories.sql"),
                )?,
                Migration::from_file(
                    "0002_family_members.sql",
                    include_str!("../../migrations/family/0002_family_members.sql"),
                )?,
                Migration::from_file("0003_expenses.sql", include_str!("../../migrations/family/0003_expenses.sql"))?,
                Migration::from_file(
                    "0004_budgets_and_settings.sql",
                    include_str!("../../migrations/family/0004_budgets_and_settings.sql"),
                )?,
            ],
        )
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }
}

/// Result of one run against one database
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub previous_version: i64,
    pub current_version: i64,
    pub applied: Vec<i64>,
}

// Version 0: the ledger itself. Safe to run repeatedly.
const LEDGER_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        checksum TEXT NOT NULL,
        kind TEXT NOT NULL,
        execution_time_ms INTEGER NOT NULL,
        applied_at TEXT NOT NULL
    )
"#;

/// Highest version recorded in the ledger, 0 when nothing has been applied.
pub async fn current_version(pool: &SqlitePool) -> Result<i64, MigrationError> {
    sqlx::query(LEDGER_DDL).execute(pool).await?;
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the ledger's high-water mark, each in its own transaction.
pub async fn run_migrations(pool: &SqlitePool, set: &MigrationSet) -> Result<MigrationOutcome, MigrationError> {
    let previous_version = current_version(pool).await?;
    warn_on_drift(pool, set).await?;

    let mut applied = Vec::new();
    for migration in set.migrations().iter().filter(|m| m.version > previous_version) {
        apply_one(pool, set.kind, migration).await?;
        applied.push(migration.version);
    }

    let current_version = applied.last().copied().unwrap_or(previous_version);
    if applied.is_empty() {
        debug!(kind = %set.kind, version = current_version, "Schema up to date");
    } else {
        info!(
            kind = %set.kind,
            from = previous_version,
            to = current_version,
            count = applied.len(),
            "Applied migrations"
        );
    }

    Ok(MigrationOutcome {
        previous_version,
        current_version,
        applied,
    })
}

async fn apply_one(pool: &SqlitePool, kind: MigrationKind, migration: &Migration) -> Result<(), MigrationError> {
    let started = Instant::now();
    let failed = |source: sqlx::Error| MigrationError::Failed {
        version: migration.version,
        name: migration.name.clone(),
        source,
    };

    // Dropping the transaction on an error path rolls it back.
    // The driver steps through every statement in the script
    let mut tx = pool.begin().await.map_err(failed)?;
    (&mut *tx).execute(migration.sql).await.map_err(failed)?;

    let elapsed_ms = started.elapsed().as_millis() as i64;
    sqlx::query(
        "INSERT INTO schema_migrations (version, name, checksum, kind, execution_time_ms, applied_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(migration.version)
    .bind(&migration.name)
    .bind(migration.checksum())
    .bind(kind.as_str())
    .bind(elapsed_ms)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .map_err(failed)?;

    tx.commit().await.map_err(failed)?;
    debug!(kind = %kind, version = migration.version, name = %migration.name, elapsed_ms, "Applied migration");
    Ok(())
}

async fn warn_on_drift(pool: &SqlitePool, set: &MigrationSet) -> Result<(), MigrationError> {
    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    for row in rows {
        let version: i64 = row.try_get("version")?;
        let checksum: String = row.try_get("checksum")?;
        if let Some(m) = set.migrations().iter().find(|m| m.version == version) {
            if m.checksum() != checksum {
                warn!(kind = %set.kind, version, name = %m.name, "Applied migration differs from embedded script");
            }
        }
    }
    Ok(())
}
