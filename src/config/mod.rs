use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub provisioning: ProvisioningConfig,
    pub api: ApiConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub master_url: String,
    pub max_connections: u32,
    pub tenant_max_connections: u32,
    pub busy_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionerKind {
    Local,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    pub kind: ProvisionerKind,
    pub data_dir: String,
    pub api_url: String,
    pub organization: String,
    #[serde(skip_serializing)]
    pub api_token: String,
    pub region: String,
    pub url_template: String,
    pub timeout_secs: u64,
    pub max_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
    pub enable_request_logging: bool,
    pub max_request_size_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub bcrypt_cost: u32,
    pub session_cleanup_interval_secs: u64,
    pub cors_origins: Vec<String>,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        // Database overrides
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.master_url = v;
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_TENANT_MAX_CONNECTIONS") {
            self.database.tenant_max_connections = v.parse().unwrap_or(self.database.tenant_max_connections);
        }
        if let Ok(v) = env::var("DATABASE_BUSY_TIMEOUT_SECS") {
            self.database.busy_timeout_secs = v.parse().unwrap_or(self.database.busy_timeout_secs);
        }

        // Provisioning overrides
        match env::var("PROVISIONER").as_deref() {
            Ok("http") | Ok("remote") => self.provisioning.kind = ProvisionerKind::Http,
            Ok("local") => self.provisioning.kind = ProvisionerKind::Local,
            _ => {}
        }
        if let Ok(v) = env::var("PROVISIONER_DATA_DIR") {
            self.provisioning.data_dir = v;
        }
        if let Ok(v) = env::var("PROVISIONER_API_URL") {
            self.provisioning.api_url = v;
        }
        if let Ok(v) = env::var("PROVISIONER_ORGANIZATION") {
            self.provisioning.organization = v;
        }
        if let Ok(v) = env::var("PROVISIONER_API_TOKEN") {
            self.provisioning.api_token = v;
        }
        if let Ok(v) = env::var("PROVISIONER_REGION") {
            self.provisioning.region = v;
        }
        if let Ok(v) = env::var("PROVISIONER_URL_TEMPLATE") {
            self.provisioning.url_template = v;
        }
        if let Ok(v) = env::var("PROVISIONER_TIMEOUT_SECS") {
            self.provisioning.timeout_secs = v.parse().unwrap_or(self.provisioning.timeout_secs);
        }
        if let Ok(v) = env::var("PROVISIONER_MAX_RETRIES") {
            self.provisioning.max_retries = v.parse().unwrap_or(self.provisioning.max_retries);
        }

        // API overrides
        if let Some(port) = env::var("TALLY_API_PORT")
            .ok()
            .or_else(|| env::var("PORT").ok())
            .and_then(|s| s.parse::<u16>().ok())
        {
            self.api.port = port;
        }
        if let Ok(v) = env::var("API_ENABLE_REQUEST_LOGGING") {
            self.api.enable_request_logging = v.parse().unwrap_or(self.api.enable_request_logging);
        }
        if let Ok(v) = env::var("API_MAX_REQUEST_SIZE_BYTES") {
            self.api.max_request_size_bytes = v.parse().unwrap_or(self.api.max_request_size_bytes);
        }

        // Security overrides
        if let Ok(v) = env::var("SECURITY_BCRYPT_COST") {
            self.security.bcrypt_cost = v.parse().unwrap_or(self.security.bcrypt_cost);
        }
        if let Ok(v) = env::var("SECURITY_SESSION_CLEANUP_INTERVAL_SECS") {
            self.security.session_cleanup_interval_secs =
                v.parse().unwrap_or(self.security.session_cleanup_interval_secs);
        }
        if let Ok(v) = env::var("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig {
                master_url: "sqlite://data/master.db".to_string(),
                max_connections: 5,
                tenant_max_connections: 2,
                busy_timeout_secs: 5,
            },
            provisioning: ProvisioningConfig {
                kind: ProvisionerKind::Local,
                data_dir: "data/families".to_string(),
                api_url: String::new(),
                organization: String::new(),
                api_token: String::new(),
                region: "local".to_string(),
                url_template: "sqlite://data/families/{name}.db".to_string(),
                timeout_secs: 30,
                max_retries: 2,
            },
            api: ApiConfig {
                port: 8080,
                enable_request_logging: true,
                max_request_size_bytes: 2 * 1024 * 1024, // 2MB
            },
            security: SecurityConfig {
                bcrypt_cost: 10,
                session_cleanup_interval_secs: 15 * 60,
                cors_origins: vec!["http://localhost:3000".to_string(), "http://localhost:5173".to_string()],
            },
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            database: DatabaseConfig {
                master_url: "sqlite:///var/lib/tally/master.db".to_string(),
                max_connections: 10,
                tenant_max_connections: 4,
                busy_timeout_secs: 5,
            },
            provisioning: ProvisioningConfig {
                kind: ProvisionerKind::Http,
                data_dir: "/var/lib/tally/families".to_string(),
                api_url: String::new(),
                organization: String::new(),
                api_token: String::new(),
                region: "default".to_string(),
                url_template: "sqlite:///var/lib/tally/families/{name}.db".to_string(),
                timeout_secs: 15,
                max_retries: 3,
            },
            api: ApiConfig {
                port: 8080,
                enable_request_logging: true,
                max_request_size_bytes: 1024 * 1024, // 1MB
            },
            security: SecurityConfig {
                bcrypt_cost: bcrypt::DEFAULT_COST,
                session_cleanup_interval_secs: 10 * 60,
                cors_origins: vec!["https://staging.example.com".to_string()],
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            database: DatabaseConfig {
                master_url: "sqlite:///var/lib/tally/master.db".to_string(),
                max_connections: 20,
                tenant_max_connections: 4,
                busy_timeout_secs: 10,
            },
            provisioning: ProvisioningConfig {
                kind: ProvisionerKind::Http,
                data_dir: "/var/lib/tally/families".to_string(),
                api_url: String::new(),
                organization: String::new(),
                api_token: String::new(),
                region: "default".to_string(),
                url_template: "sqlite:///var/lib/tally/families/{name}.db".to_string(),
                timeout_secs: 10,
                max_retries: 3,
            },
            api: ApiConfig {
                port: 8080,
                enable_request_logging: false,
                max_request_size_bytes: 1024 * 1024, // 1MB
            },
            security: SecurityConfig {
                bcrypt_cost: bcrypt::DEFAULT_COST,
                session_cleanup_interval_secs: 5 * 60,
                cors_origins: vec!["https://app.example.com".to_string()],
            },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_development_config() {
        let config = AppConfig::development();
        assert_eq!(config.provisioning.kind, ProvisionerKind::Local);
        assert!(config.api.enable_request_logging);
        assert!(config.security.bcrypt_cost < bcrypt::DEFAULT_COST);
    }

    #[test]
    fn test_default_production_config() {
        let config = AppConfig::production();
        assert_eq!(config.provisioning.kind, ProvisionerKind::Http);
        assert_eq!(config.security.bcrypt_cost, bcrypt::DEFAULT_COST);
        assert!(!config.api.enable_request_logging);
    }
}
