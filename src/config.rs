use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared between the router, the app loader and the reload
/// callback. Swapped wholesale on reload.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Global configuration for the server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and application root
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker lifecycle timings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Sandbox runtime location
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Environment variables injected into every app
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Per-app overrides keyed by app key (`<app>.<domain>`)
    #[serde(default)]
    pub apps: BTreeMap<String, AppOverrides>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 7777)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Application root directory, laid out as `<dir>/<domain>/<app>/`
    #[serde(default = "default_root_dir")]
    pub dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            dir: default_root_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Time without in-flight requests before a worker is reaped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Deadline for the `READY` handshake
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,

    /// Time between the interrupt signal and a forced kill
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,

    /// Max time to wait for response headers from a worker
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout(),
            startup_timeout_ms: default_startup_timeout(),
            shutdown_grace_period_ms: default_shutdown_grace_period(),
            response_timeout_secs: default_response_timeout(),
        }
    }
}

impl WorkerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RuntimeConfig {
    /// Explicit path to the sandbox runtime executable
    pub executable: Option<PathBuf>,

    /// Where the sandbox bridge script is installed (default: user cache dir)
    pub cache_dir: Option<PathBuf>,
}

/// Per-app settings layered on top of the app's own files
#[derive(Debug, Deserialize, Clone)]
pub struct AppOverrides {
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    pub allow_net: bool,

    #[serde(default = "default_true")]
    pub allow_env: bool,

    #[serde(default = "default_true")]
    pub allow_sys: bool,
}

impl Default for AppOverrides {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            allow_net: true,
            allow_env: true,
            allow_sys: true,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    7777
}

fn default_root_dir() -> PathBuf {
    dirs_next::home_dir()
        .map(|home| home.join("smallweb"))
        .unwrap_or_else(|| PathBuf::from("smallweb"))
}

fn default_idle_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_startup_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_shutdown_grace_period() -> u64 {
    5_000 // 5 seconds between interrupt and kill
}

fn default_response_timeout() -> u64 {
    300 // long enough for SSE and slow streaming responses
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides for an app, or the defaults if it has none
    pub fn app_overrides(&self, app_key: &str) -> AppOverrides {
        self.apps.get(app_key).cloned().unwrap_or_default()
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }

        if self.worker.startup_timeout_ms == 0 {
            errors.push("worker: 'startup_timeout_ms' must be greater than 0".to_string());
        }

        if self.worker.idle_timeout_ms == 0 {
            errors.push("worker: 'idle_timeout_ms' must be greater than 0".to_string());
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                errors.push(format!("env: invalid variable name '{}'", key));
            }
        }

        for (app, overrides) in &self.apps {
            for key in overrides.env.keys() {
                if key.is_empty() || key.contains('=') {
                    errors.push(format!("apps.'{}': invalid variable name '{}'", app, key));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
