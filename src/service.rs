//! Control of the OS services the panel depends on.
//!
//! The session bridge only needs `stop` and `start` of the proxy service;
//! the HTTP layer additionally restarts the proxy or the panel itself.
//! [`SystemServiceController`] binds these to `systemctl` on Unix and to
//! `sc` on Windows.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Default bound on a single service-manager command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default unit name of the proxy (the session store writer).
#[cfg(windows)]
pub const DEFAULT_PROXY_SERVICE: &str = "Abdal4iProtoServer";
#[cfg(not(windows))]
pub const DEFAULT_PROXY_SERVICE: &str = "abdal-4iproto-server";

/// Default unit name of the panel itself.
#[cfg(windows)]
pub const DEFAULT_PANEL_SERVICE: &str = "Abdal4iProtoPanel";
#[cfg(not(windows))]
pub const DEFAULT_PANEL_SERVICE: &str = "abdal-4iproto-panel";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid service name '{0}'")]
    InvalidName(String),

    #[error("failed to run service manager for {action} of '{service}': {source}")]
    Spawn {
        action: &'static str,
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{action} of '{service}' failed (exit {code}): {stderr}")]
    Failed {
        action: &'static str,
        service: String,
        code: i32,
        stderr: String,
    },

    #[error("{action} of '{service}' timed out after {}s", .timeout.as_secs())]
    TimedOut {
        action: &'static str,
        service: String,
        timeout: Duration,
    },
}

/// Synchronous-from-the-caller's-view control of one external service.
///
/// Implementations must tolerate being asked to stop an already stopped
/// service or start a running one closely enough that a retry is safe.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    async fn stop(&self) -> Result<(), ServiceError>;

    async fn start(&self) -> Result<(), ServiceError>;

    /// Stops (failure only logged), pauses briefly, then starts.
    async fn restart(&self) -> Result<(), ServiceError> {
        if let Err(e) = self.stop().await {
            tracing::warn!(service = %self.name(), error = %e, "Stop failed during restart, continuing");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.start().await
    }
}

/// The platform service manager used to drive a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManager {
    /// `systemctl <action> <unit>`
    Systemd,
    /// `sc <action> <service>`
    WindowsSc,
}

impl ServiceManager {
    pub fn for_current_platform() -> Self {
        if cfg!(windows) {
            ServiceManager::WindowsSc
        } else {
            ServiceManager::Systemd
        }
    }

    fn program(self) -> &'static str {
        match self {
            ServiceManager::Systemd => "systemctl",
            ServiceManager::WindowsSc => "sc",
        }
    }
}

/// [`ServiceController`] that shells out to the platform service manager.
#[derive(Debug, Clone)]
pub struct SystemServiceController {
    service: String,
    manager: ServiceManager,
    timeout: Duration,
}

impl SystemServiceController {
    /// Creates a controller for `service`, rejecting names that could be
    /// interpreted as extra arguments.
    pub fn new(service: impl Into<String>) -> Result<Self, ServiceError> {
        let service = service.into();
        if !is_safe_service_name(&service) {
            return Err(ServiceError::InvalidName(service));
        }
        Ok(Self {
            service,
            manager: ServiceManager::for_current_platform(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    pub fn with_manager(mut self, manager: ServiceManager) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, action: &'static str) -> Result<(), ServiceError> {
        tracing::info!(service = %self.service, action, "Running service manager command");

        let result = tokio::time::timeout(
            self.timeout,
            Command::new(self.manager.program())
                .arg(action)
                .arg(&self.service)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                tracing::info!(service = %self.service, action, "Service command succeeded");
                Ok(())
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                tracing::error!(service = %self.service, action, stderr = %stderr, "Service command failed");
                Err(ServiceError::Failed {
                    action,
                    service: self.service.clone(),
                    code: output.status.code().unwrap_or(-1),
                    stderr,
                })
            }
            Ok(Err(source)) => {
                tracing::error!(service = %self.service, action, error = %source, "Failed to execute service manager");
                Err(ServiceError::Spawn {
                    action,
                    service: self.service.clone(),
                    source,
                })
            }
            Err(_) => {
                tracing::error!(service = %self.service, action, "Service command timed out");
                Err(ServiceError::TimedOut {
                    action,
                    service: self.service.clone(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl ServiceController for SystemServiceController {
    fn name(&self) -> &str {
        &self.service
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.run("stop").await
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.run("start").await
    }

    async fn restart(&self) -> Result<(), ServiceError> {
        match self.manager {
            // systemd restarts atomically, which matters when the panel
            // restarts its own unit.
            ServiceManager::Systemd => self.run("restart").await,
            ServiceManager::WindowsSc => {
                if let Err(e) = self.stop().await {
                    tracing::warn!(service = %self.service, error = %e, "Stop failed (may already be stopped)");
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.start().await
            }
        }
    }
}

/// Allowed characters: alphanumeric, hyphen, underscore, dot.
fn is_safe_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
