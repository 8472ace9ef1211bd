//! App snapshots and the filesystem loader that produces them.
//!
//! An app lives at `<root>/<domain>/<app>/`. Loading reads its optional
//! `smallweb.json` (or the `smallweb` key of `deno.json`), its `.env` file
//! and the server configuration, and freezes the result into an [`App`].

use crate::config::{Config, SharedConfig};
use crate::error::AppError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const ENTRYPOINT_CANDIDATES: [&str; 4] = ["main.js", "main.ts", "main.jsx", "main.tsx"];

/// Registry and watch-state key for an app
pub fn app_key(appname: &str, domain: &str) -> String {
    format!("{}.{}", appname, domain)
}

/// Settings an app declares about itself
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Entrypoint relative to the app directory
    pub entrypoint: Option<String>,
    /// Subdirectory the app is served from
    pub root: Option<String>,
}

/// Capabilities granted to the sandbox runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub net: bool,
    pub env: bool,
    pub sys: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            net: true,
            env: true,
            sys: true,
        }
    }
}

/// Immutable snapshot of one hosted application
#[derive(Debug, Clone)]
pub struct App {
    pub name: String,
    pub domain: String,
    pub base_dir: PathBuf,
    pub config: AppConfig,
    pub permissions: Permissions,
    env: BTreeMap<String, String>,
}

impl App {
    pub fn key(&self) -> String {
        app_key(&self.name, &self.domain)
    }

    /// Directory the runtime is confined to
    pub fn dir(&self) -> PathBuf {
        if let Some(ref root) = self.config.root {
            return self.base_dir.join(root);
        }

        if self.config.entrypoint.is_some() || has_main(&self.base_dir) {
            return self.base_dir.clone();
        }

        let dist = self.base_dir.join("dist");
        if has_main(&dist) || dist.join("index.html").is_file() {
            return dist;
        }

        self.base_dir.clone()
    }

    /// Writable directory for app state
    pub fn data_dir(&self) -> PathBuf {
        self.dir().join("data")
    }

    /// Module the sandbox imports. Falls back to the app directory itself,
    /// which the sandbox serves as static files.
    pub fn entrypoint(&self) -> String {
        let dir = self.dir();
        let path = match self.config.entrypoint {
            Some(ref entrypoint) => dir.join(entrypoint),
            None => ENTRYPOINT_CANDIDATES
                .iter()
                .map(|candidate| dir.join(candidate))
                .find(|path| path.is_file())
                .unwrap_or(dir),
        };
        path.to_string_lossy().into_owned()
    }

    /// Environment as `KEY=VALUE` pairs
    pub fn env(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

fn has_main(dir: &Path) -> bool {
    ENTRYPOINT_CANDIDATES
        .iter()
        .any(|candidate| dir.join(candidate).is_file())
}

/// Resolves a (domain, appname) pair to a fresh [`App`] snapshot
pub trait AppLoader: Send + Sync {
    fn load_app(&self, domain: &str, appname: &str) -> Result<App, AppError>;
}

/// Loads apps from the configured root directory
pub struct FsAppLoader {
    config: SharedConfig,
}

impl FsAppLoader {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }
}

impl AppLoader for FsAppLoader {
    fn load_app(&self, domain: &str, appname: &str) -> Result<App, AppError> {
        // Snapshot so a concurrent reload cannot tear the view
        let config = self.config.read().clone();
        load_app(&config.server.dir, domain, appname, &config)
    }
}

/// Load an app from `<root>/<domain>/<appname>`
pub fn load_app(root: &Path, domain: &str, appname: &str, config: &Config) -> Result<App, AppError> {
    if !is_path_segment(domain) || !is_path_segment(appname) {
        return Err(AppError::NotFound);
    }

    let base_dir = root.join(domain).join(appname);
    if !base_dir.is_dir() {
        return Err(AppError::NotFound);
    }

    let invalid = |reason: String| AppError::Invalid {
        name: app_key(appname, domain),
        reason,
    };

    let app_config = read_app_config(&base_dir).map_err(invalid)?;
    let overrides = config.app_overrides(&app_key(appname, domain));

    let mut env = config.env.clone();
    env.extend(overrides.env.clone());

    let dotenv = base_dir.join(".env");
    if dotenv.is_file() {
        let vars = dotenvy::from_path_iter(&dotenv)
            .map_err(|e| invalid(format!("could not read .env: {}", e)))?;
        for item in vars {
            let (key, value) = item.map_err(|e| invalid(format!("could not parse .env: {}", e)))?;
            env.insert(key, value);
        }
    }

    Ok(App {
        name: appname.to_string(),
        domain: domain.to_string(),
        base_dir,
        config: app_config,
        permissions: Permissions {
            net: overrides.allow_net,
            env: overrides.allow_env,
            sys: overrides.allow_sys,
        },
        env,
    })
}

fn is_path_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn read_app_config(dir: &Path) -> Result<AppConfig, String> {
    let smallweb = dir.join("smallweb.json");
    if smallweb.is_file() {
        let content = std::fs::read_to_string(&smallweb)
            .map_err(|e| format!("could not read smallweb.json: {}", e))?;
        return serde_json::from_str(&content)
            .map_err(|e| format!("could not parse smallweb.json: {}", e));
    }

    let deno = dir.join("deno.json");
    if deno.is_file() {
        let content = std::fs::read_to_string(&deno)
            .map_err(|e| format!("could not read deno.json: {}", e))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| format!("could not parse deno.json: {}", e))?;
        return match value.get("smallweb") {
            Some(section) => serde_json::from_value(section.clone())
                .map_err(|e| format!("invalid smallweb section in deno.json: {}", e)),
            None => Ok(AppConfig::default()),
        };
    }

    Ok(AppConfig::default())
}
