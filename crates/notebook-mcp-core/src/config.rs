//! Configuration types for Notebook MCP Server.
//!
//! Settings come from an optional YAML file and are overridden by the
//! environment (`NOTEBOOK_PATH`, `SERVER_URL`, `TOKEN`, `KERNEL_ID`,
//! `KERNEL_NAME`). [`SessionConfig`] is the validated form consumed by the
//! clients.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::{Error, Result};

/// Environment variable naming the notebook document.
pub const ENV_NOTEBOOK_PATH: &str = "NOTEBOOK_PATH";
/// Environment variable naming the server base URL.
pub const ENV_SERVER_URL: &str = "SERVER_URL";
/// Environment variable holding the auth token.
pub const ENV_TOKEN: &str = "TOKEN";
/// Environment variable naming an existing kernel to attach to.
pub const ENV_KERNEL_ID: &str = "KERNEL_ID";
/// Environment variable naming the kernelspec used when starting a kernel.
pub const ENV_KERNEL_NAME: &str = "KERNEL_NAME";
/// Environment variable pointing at a YAML config file.
pub const ENV_CONFIG_FILE: &str = "NOTEBOOK_MCP_CONFIG";

/// Server configuration loaded from YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Server settings
    pub server: ServerSettings,
    /// Execution bridge settings
    pub bridge: BridgeSettings,
    /// Target notebook and server
    pub notebook: NotebookSettings,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Override notebook settings from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    /// Override notebook settings from an arbitrary variable lookup.
    pub fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_NOTEBOOK_PATH) {
            self.notebook.path = path;
        }
        if let Some(url) = lookup(ENV_SERVER_URL) {
            self.notebook.server_url = url;
        }
        if let Some(token) = lookup(ENV_TOKEN) {
            self.notebook.token = token;
        }
        if let Some(kernel_id) = lookup(ENV_KERNEL_ID).filter(|id| !id.trim().is_empty()) {
            self.notebook.kernel_id = Some(kernel_id);
        }
        if let Some(name) = lookup(ENV_KERNEL_NAME) {
            self.notebook.kernel_name = name;
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        self.bridge.validate()?;
        self.notebook.validate()?;
        Ok(())
    }

    /// Build the validated session configuration.
    pub fn session_config(&self) -> Result<SessionConfig> {
        self.validate()?;
        let server_url = parse_server_url(&self.notebook.server_url)?;

        Ok(SessionConfig {
            notebook_path: self.notebook.path.trim().trim_start_matches('/').to_string(),
            server_url,
            token: self.notebook.token.clone(),
            kernel_id: self.notebook.kernel_id.clone(),
            kernel_name: self.notebook.kernel_name.clone(),
            default_timeout: Duration::from_millis(self.bridge.default_timeout_ms),
            ack_timeout: Duration::from_millis(self.bridge.ack_timeout_ms),
            connect_timeout: Duration::from_millis(self.bridge.connect_timeout_ms),
            reconnect_attempts: self.bridge.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.bridge.reconnect_backoff_ms),
        })
    }
}

/// Server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Execution bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Deadline applied to a run when the caller gives none
    pub default_timeout_ms: u64,
    /// How long to wait for the document store to acknowledge a write
    pub ack_timeout_ms: u64,
    /// Handshake deadline for both channels
    pub connect_timeout_ms: u64,
    /// Reconnect attempts made when a client is degraded
    pub reconnect_attempts: u32,
    /// Initial delay between reconnect attempts (doubles each attempt)
    pub reconnect_backoff_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            ack_timeout_ms: 2_000,
            connect_timeout_ms: 10_000,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 250,
        }
    }
}

impl BridgeSettings {
    fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(Error::Config("bridge.default_timeout_ms must be > 0".into()));
        }
        if self.ack_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "bridge.ack_timeout_ms and bridge.connect_timeout_ms must be > 0".into(),
            ));
        }
        if self.reconnect_attempts == 0 {
            return Err(Error::Config("bridge.reconnect_attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// Target notebook, server and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotebookSettings {
    /// Notebook path relative to the server root
    pub path: String,
    /// Server base URL
    pub server_url: String,
    /// Bearer token (empty = unauthenticated)
    pub token: String,
    /// Existing kernel to attach to; a new kernel is started when unset
    pub kernel_id: Option<String>,
    /// Kernelspec name used when starting a kernel
    pub kernel_name: String,
}

impl Default for NotebookSettings {
    fn default() -> Self {
        Self {
            path: "notebook.ipynb".to_string(),
            server_url: "http://localhost:8888".to_string(),
            token: String::new(),
            kernel_id: None,
            kernel_name: "python3".to_string(),
        }
    }
}

impl NotebookSettings {
    fn validate(&self) -> Result<()> {
        let path = self.path.trim().trim_start_matches('/');
        if path.is_empty() {
            return Err(Error::Config("notebook path cannot be empty".into()));
        }
        if path.split('/').any(|segment| segment == "..") {
            return Err(Error::Config(format!(
                "notebook path '{}' must not escape the server root",
                self.path
            )));
        }
        if self.kernel_name.trim().is_empty() {
            return Err(Error::Config("kernel name cannot be empty".into()));
        }
        parse_server_url(&self.server_url)?;
        Ok(())
    }
}

fn parse_server_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::Config(format!("invalid server URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Config(format!(
                "server URL must be http or https, got '{other}'"
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(Error::Config(format!("server URL '{raw}' has no host")));
    }
    Ok(url)
}

/// Validated coordinates and timings used by the clients and the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Notebook path relative to the server root (no leading slash)
    pub notebook_path: String,
    /// Server base URL
    pub server_url: Url,
    /// Bearer token (empty = unauthenticated)
    pub token: String,
    /// Existing kernel to attach to
    pub kernel_id: Option<String>,
    /// Kernelspec name used when starting a kernel
    pub kernel_name: String,
    /// Deadline applied when a run gives none
    pub default_timeout: Duration,
    /// Document write acknowledgement deadline
    pub ack_timeout: Duration,
    /// Handshake deadline
    pub connect_timeout: Duration,
    /// Reconnect attempts for a degraded client
    pub reconnect_attempts: u32,
    /// Initial reconnect delay
    pub reconnect_backoff: Duration,
}

impl SessionConfig {
    /// Resolve from the process environment over defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = ServerConfig::default();
        config.apply_env();
        config.session_config()
    }

    /// Whether requests should carry an auth token.
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }
}
