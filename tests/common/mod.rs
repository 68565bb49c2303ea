#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;

use tally_api::app::{router, AppState};
use tally_api::config::AppConfig;
use tally_api::database::manager::{open_master, TenantRegistry};
use tally_api::database::provider::{LocalProvider, PoolSettings};

pub const PASSWORD: &str = "password123";

/// In-process server on a free port, backed by SQLite files in a temp directory.
pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub registry: Arc<TenantRegistry>,
    pub dir: TempDir,
}

impl TestServer {
    pub async fn start() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let master_url = format!("sqlite://{}", dir.path().join("master.db").display());
        let master = open_master(&master_url, 4, Duration::from_secs(5)).await?;

        let provider = LocalProvider::new(dir.path().join("families"), PoolSettings::default());
        let registry = Arc::new(TenantRegistry::new(master, Arc::new(provider), "local")?);
        registry.run_migrations().await?;

        let state = AppState::new(registry.clone(), 4);
        let app = router(state, &AppConfig::from_env());

        // Pick an unused port for isolation
        let port = portpicker::pick_unused_port().context("failed to pick free port")?;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
        });

        let server = Self {
            base_url: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
            registry,
            dir,
        };
        server.wait_ready(Duration::from_secs(10)).await?;
        Ok(server)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(resp) = self.client.get(self.url("/tally.v1.HealthService/Check")).send().await {
                if resp.status() == StatusCode::OK {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("server did not become ready on {} within {:?}", self.base_url, timeout)
    }

    pub fn url(&self, procedure: &str) -> String {
        format!("{}{}", self.base_url, procedure)
    }

    /// POST a JSON message to a procedure, optionally with an Authorization header value.
    pub async fn call(&self, procedure: &str, auth: Option<&str>, body: Value) -> Result<(StatusCode, Value)> {
        let mut request = self.client.post(self.url(procedure)).json(&body);
        if let Some(auth) = auth {
            request = request.header("authorization", auth);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    pub async fn register(&self, email: &str, name: &str) -> Result<Value> {
        let (status, body) = self
            .call(
                "/tally.v1.AuthService/Register",
                None,
                json!({ "email": email, "name": name, "password": PASSWORD }),
            )
            .await?;
        anyhow::ensure!(status == StatusCode::OK && body["success"] == true, "register failed: {}", body);
        Ok(body["data"].clone())
    }

    /// Log in and return `Bearer <token>`.
    pub async fn login(&self, email: &str) -> Result<String> {
        let (status, body) = self
            .call(
                "/tally.v1.AuthService/Login",
                None,
                json!({ "email": email, "password": PASSWORD }),
            )
            .await?;
        anyhow::ensure!(status == StatusCode::OK && body["success"] == true, "login failed: {}", body);
        let token = body["data"]["token"].as_str().context("token missing")?;
        Ok(format!("Bearer {}", token))
    }

    pub async fn register_and_login(&self, email: &str, name: &str) -> Result<String> {
        self.register(email, name).await?;
        self.login(email).await
    }
}
