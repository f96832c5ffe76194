use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EdaError, Result};

/// Top-level configuration for the activation service.
///
/// Loaded from `~/.eda/config.toml` by default. Each section corresponds
/// to a bounded context or cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdaConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl EdaConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EdaConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| EdaError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.eda/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Page size used when a list request does not name one.
    pub page_size: u32,
    /// Upper bound for a requested page size.
    pub max_page_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            page_size: 20,
            max_page_size: 200,
        }
    }
}

/// Where and how rule-engine workers are deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Deployment backend passed to every job: "local", "podman" or "k8s".
    pub deployment_type: String,
    /// Base URL the rule engine uses to call back into the service.
    pub websocket_base_url: String,
    /// Whether the rule engine verifies the websocket TLS certificate ("yes"/"no").
    pub websocket_ssl_verify: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            deployment_type: "local".to_string(),
            websocket_base_url: "ws://localhost:8000".to_string(),
            websocket_ssl_verify: "yes".to_string(),
        }
    }
}

/// Liveness monitoring of running instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Seconds between background monitor passes.
    pub check_seconds: u64,
    /// Seconds without a heartbeat after which a running instance is unresponsive.
    pub timeout_seconds: u64,
    /// Run a monitor pass synchronously before answering an activation list.
    pub monitor_on_list: bool,
}

impl LivenessConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_seconds.max(1))
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_seconds: 300,
            timeout_seconds: 610,
            monitor_on_list: true,
        }
    }
}

/// Restart policy bounds and backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Delay before restarting an activation that completed.
    pub seconds_on_complete: u64,
    /// Delay before restarting an activation that failed.
    pub seconds_on_failure: u64,
    /// Maximum automatic restarts after consecutive failures.
    pub max_restarts_on_failure: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            seconds_on_complete: 0,
            seconds_on_failure: 60,
            max_restarts_on_failure: 5,
        }
    }
}

/// Job worker pool and rule-engine process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of jobs processed concurrently.
    pub concurrency: usize,
    /// Executable started for each activation instance.
    pub engine_command: String,
    /// Arguments passed before the per-instance arguments.
    pub engine_args: Vec<String>,
    /// Verbosity flag forwarded to the rule engine.
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            engine_command: "ansible-rulebook".to_string(),
            engine_args: vec!["--worker".to_string()],
            log_level: "-v".to_string(),
        }
    }
}
