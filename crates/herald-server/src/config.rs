use anyhow::{bail, Context, Result};
use axum::http::HeaderName;
use herald_isr::http::check_webhook_path;
use herald_isr::{IsrHttpConfig, IsrTomlConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// herald.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub isr: IsrTomlConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Upstream application that renders pages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_origin")]
    pub origin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_path")]
    pub path: String,

    #[serde(default = "default_secret_header")]
    pub secret_header: String,

    #[serde(default)]
    pub secret: Option<String>,

    /// External event → route table; the bundled table is used when unset
    #[serde(default)]
    pub routes_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_origin() -> String {
    "http://127.0.0.1:4000".to_string()
}

fn default_webhook_path() -> String {
    "/api/webhooks/invalidate".to_string()
}

fn default_secret_header() -> String {
    "x-webhook-secret".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            path: default_webhook_path(),
            secret_header: default_secret_header(),
            secret: None,
            routes_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // If file doesn't exist or is empty, return default config
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Apply HERALD_* environment variables on top of the file
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("HERALD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("HERALD_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("HERALD_PORT is not a valid port: {}", port))?;
        }
        if let Some(origin) = lookup("HERALD_RENDER_ORIGIN") {
            self.render.origin = origin;
        }
        if let Some(secret) = lookup("HERALD_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
        if let Some(secret) = lookup("HERALD_API_SECRET") {
            self.api.secret = Some(secret);
        }
        Ok(())
    }

    /// Reject settings the router cannot mount
    pub fn validate(&self) -> Result<()> {
        check_webhook_path(&self.webhook.path)
            .map_err(|e| anyhow::anyhow!("invalid [webhook] path: {}", e))?;
        if self.webhook.secret_header.parse::<HeaderName>().is_err() {
            bail!(
                "invalid [webhook] secret_header: {:?}",
                self.webhook.secret_header
            );
        }
        Ok(())
    }

    pub fn http_config(&self) -> IsrHttpConfig {
        IsrHttpConfig {
            webhook_path: self.webhook.path.clone(),
            secret_header: self.webhook.secret_header.to_ascii_lowercase(),
            webhook_secret: self.webhook.secret.clone().filter(|s| !s.is_empty()),
            api_secret: self.api.secret.clone().filter(|s| !s.is_empty()),
        }
    }
}
