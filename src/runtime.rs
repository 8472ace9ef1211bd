//! Sandbox runtime invocation: executable lookup, the descriptor protocol and
//! the capability-scoped argument list.

use crate::app::App;
use crate::config::RuntimeConfig;
use crate::error::StartupError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::warn;

/// Bridge script executed by the runtime. It imports the app entrypoint and
/// answers the descriptor passed as the last argument.
const SANDBOX_SCRIPT: &str = include_str!("../assets/sandbox.ts");

/// Final CLI argument of every runtime invocation
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum CommandDescriptor {
    Fetch { entrypoint: String, port: u16 },
    Run { entrypoint: String, args: Vec<String> },
    Email { entrypoint: String, msg: String },
}

impl CommandDescriptor {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A located runtime plus the installed bridge script
#[derive(Debug, Clone)]
pub struct Runtime {
    executable: PathBuf,
    sandbox: PathBuf,
    npm_cache: PathBuf,
}

impl Runtime {
    /// Resolve the executable and make sure the bridge script is on disk
    pub fn locate(config: &RuntimeConfig) -> Result<Self, StartupError> {
        let executable = resolve_runtime_executable(config.executable.as_deref())?;
        let sandbox = install_sandbox(&sandbox_path(config.cache_dir.as_deref()))?;

        Ok(Self {
            executable,
            sandbox,
            npm_cache: npm_cache_dir(),
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Build an invocation of the bridge for `app`. Stdio is left to the caller.
    pub fn command(&self, app: &App, descriptor: &CommandDescriptor) -> Result<Command, StartupError> {
        let payload = descriptor
            .to_json()
            .map_err(|e| StartupError::Spawn(e.into()))?;

        let mut cmd = Command::new(&self.executable);
        cmd.arg("run")
            .args(capability_args(app, &self.npm_cache))
            .arg(&self.sandbox)
            .arg(payload)
            .current_dir(app.dir())
            .env_clear()
            .envs(runtime_env(app, std::env::vars()))
            .kill_on_drop(true);

        Ok(cmd)
    }
}

/// Locate the runtime binary: configured path, `DENO_EXEC_PATH`, `PATH`,
/// then well-known install locations.
pub fn resolve_runtime_executable(configured: Option<&Path>) -> Result<PathBuf, StartupError> {
    let env_override = std::env::var_os("DENO_EXEC_PATH").map(PathBuf::from);
    resolve_executable_with(configured, env_override)
}

fn resolve_executable_with(
    configured: Option<&Path>,
    env_override: Option<PathBuf>,
) -> Result<PathBuf, StartupError> {
    if let Some(path) = configured {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(StartupError::ExecutableNotFound)
        };
    }

    if let Some(path) = env_override {
        if path.is_file() {
            return Ok(path);
        }
        warn!(path = %path.display(), "DENO_EXEC_PATH does not point to a file, ignoring");
    }

    if let Ok(path) = which::which("deno") {
        return Ok(path);
    }

    let mut candidates = Vec::new();
    if let Some(home) = dirs_next::home_dir() {
        candidates.push(home.join(".deno").join("bin").join("deno"));
    }
    candidates.extend(
        [
            "/home/linuxbrew/.linuxbrew/bin/deno",
            "/opt/homebrew/bin/deno",
            "/usr/local/bin/deno",
            "/usr/bin/deno",
        ]
        .iter()
        .map(PathBuf::from),
    );

    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or(StartupError::ExecutableNotFound)
}

/// Permission flags confining the runtime to the app
pub fn capability_args(app: &App, npm_cache: &Path) -> Vec<String> {
    let dir = app.dir();
    let mut args = vec!["--allow-import".to_string()];

    if app.permissions.net {
        args.push("--allow-net".to_string());
    }
    if app.permissions.env {
        args.push("--allow-env".to_string());
    }
    if app.permissions.sys {
        args.push("--allow-sys".to_string());
    }

    args.push("--no-prompt".to_string());
    args.push("--quiet".to_string());

    if let Some(config) = ["deno.json", "deno.jsonc"]
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
    {
        args.push(format!("--config={}", config.display()));
    }

    args.push(format!(
        "--allow-read={},{}",
        dir.display(),
        npm_cache.display()
    ));
    args.push(format!("--allow-write={}", app.data_dir().display()));

    args
}

/// Child environment: the app's variables plus a small allowlist from the host
pub fn runtime_env<I>(app: &App, host_env: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: Vec<(String, String)> = app
        .env()
        .into_iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    let mut home = None;
    let mut passthrough = Vec::new();
    for (key, value) in host_env {
        if key == "HOME" {
            home = Some(value);
        } else if key.starts_with("DENO_") || key.starts_with("OTEL_") {
            passthrough.push((key, value));
        }
    }

    env.push(("HOME".to_string(), home.unwrap_or_default()));
    env.push(("DENO_NO_UPDATE_CHECK".to_string(), "1".to_string()));
    env.extend(passthrough);
    env.push(("OTEL_SERVICE_NAME".to_string(), app.name.clone()));
    env
}

fn npm_cache_dir() -> PathBuf {
    dirs_next::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("deno")
        .join("npm")
        .join("registry.npmjs.org")
}

fn sandbox_path(cache_dir: Option<&Path>) -> PathBuf {
    let base = match cache_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs_next::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("scriptgate"),
    };
    base.join("sandbox")
        .join(env!("CARGO_PKG_VERSION"))
        .join("sandbox.ts")
}

/// Write the bridge script unless an identical copy is already present.
/// Goes through a temp file + rename so concurrent starts never see a
/// partial script.
fn install_sandbox(path: &Path) -> Result<PathBuf, StartupError> {
    let install_err = |source| StartupError::SandboxInstall {
        path: path.to_path_buf(),
        source,
    };

    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == SANDBOX_SCRIPT {
            return Ok(path.to_path_buf());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(install_err)?;
    }

    let tmp = path.with_extension(format!("ts.{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, SANDBOX_SCRIPT).map_err(install_err)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        install_err(e)
    })?;

    Ok(path.to_path_buf())
}
