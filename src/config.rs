//! Panel configuration file.
//!
//! A single JSON document holds the credentials, the throttle policy, the
//! durable block list and the session store locations. A missing or broken
//! file is replaced with defaults on startup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ConfigError;
use crate::service::{DEFAULT_PANEL_SERVICE, DEFAULT_PROXY_SERVICE};
use crate::sessions::SessionsConfig;
use crate::throttle::BlockList;

/// Config file used when `PANEL_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "abdal-4iproto-panel.json";

pub const DEFAULT_PORT: u16 = 8080;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "PANEL_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Listen port; `0` defers to the `PORT` environment variable.
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Verbose request and job logging.
    pub logging: bool,
    /// Addresses denied before any login logic runs.
    pub blocked_ips: Vec<String>,
    pub max_login_attempts: u32,
    /// Seconds after the last failure before the count resets.
    #[serde(alias = "login_attempt_window_seconds")]
    pub login_attempt_window: u64,
    /// Seconds a throttled address stays blocked.
    #[serde(alias = "block_duration_seconds")]
    pub block_duration: u64,
    pub theme: String,
    pub sessions: SessionsConfig,
    pub services: ServicesConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            username: "admin".to_string(),
            password: "admin123".to_string(),
            logging: true,
            blocked_ips: Vec::new(),
            max_login_attempts: 5,
            login_attempt_window: 300,
            block_duration: 3600,
            theme: "normal".to_string(),
            sessions: SessionsConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

/// OS service names driven by the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub proxy_service: String,
    pub panel_service: String,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            proxy_service: DEFAULT_PROXY_SERVICE.to_string(),
            panel_service: DEFAULT_PANEL_SERVICE.to_string(),
        }
    }
}

impl PanelConfig {
    /// Reads and parses `path`.
    pub async fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read(path).await.map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Writes the config as pretty-printed JSON.
    pub async fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self).map_err(ConfigError::Serialize)?;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ConfigError::Io {
                    path: dir.display().to_string(),
                    source,
                })?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    /// Port to listen on, falling back to `PORT` and then the default.
    pub fn listen_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        std::env::var("PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked_ips.iter().any(|blocked| blocked == ip)
    }

    /// Copy safe to hand out over the API.
    pub fn redacted(&self) -> Self {
        Self {
            password: String::new(),
            ..self.clone()
        }
    }
}

pub fn config_path_from_env() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// The loaded config plus the file it is persisted to.
///
/// Writers update memory and disk under the same lock so the file always
/// matches some state the panel actually had.
#[derive(Debug)]
pub struct PanelConfigStore {
    path: PathBuf,
    config: RwLock<PanelConfig>,
}

impl PanelConfigStore {
    pub fn new(path: impl Into<PathBuf>, config: PanelConfig) -> Self {
        Self {
            path: path.into(),
            config: RwLock::new(config),
        }
    }

    /// Loads `path`, writing defaults there if it is missing or unreadable.
    pub async fn load_or_default(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        match PanelConfig::read(&path).await {
            Ok(config) => Ok(Self::new(path, config)),
            Err(e) => {
                tracing::warn!(error = %e, "Using default panel config");
                let config = PanelConfig::default();
                config.write(&path).await?;
                Ok(Self::new(path, config))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn current(&self) -> PanelConfig {
        self.config.read().await.clone()
    }

    pub async fn save(&self) -> Result<(), ConfigError> {
        let config = self.config.read().await;
        config.write(&self.path).await
    }

    /// Persists `config` and makes it current. The in-memory copy is left
    /// alone if the file cannot be written.
    pub async fn replace(&self, config: PanelConfig) -> Result<(), ConfigError> {
        let mut current = self.config.write().await;
        config.write(&self.path).await?;
        *current = config;
        Ok(())
    }

    /// Durable block list, sorted and deduplicated.
    pub async fn blocked_ips(&self) -> Vec<String> {
        let config = self.config.read().await;
        config
            .blocked_ips
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Lifts a durable block. Returns whether the address was listed.
    pub async fn unblock_ip(&self, ip: &str) -> Result<bool, ConfigError> {
        let mut config = self.config.write().await;
        let before = config.blocked_ips.len();
        config.blocked_ips.retain(|blocked| blocked != ip);
        if config.blocked_ips.len() == before {
            return Ok(false);
        }
        config.write(&self.path).await?;
        tracing::info!(ip, "Address removed from durable block list");
        Ok(true)
    }
}

#[async_trait]
impl BlockList for PanelConfigStore {
    async fn is_blocked(&self, ip: &str) -> bool {
        self.config.read().await.is_blocked(ip)
    }

    async fn block(&self, ip: &str) -> Result<bool, ConfigError> {
        let mut config = self.config.write().await;
        if config.is_blocked(ip) {
            return Ok(false);
        }
        config.blocked_ips.push(ip.to_string());
        config.write(&self.path).await?;
        Ok(true)
    }
}
