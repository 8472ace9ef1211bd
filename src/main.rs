use scriptgate::app::FsAppLoader;
use scriptgate::config::{Config, SharedConfig};
use scriptgate::pool::{ConnectionPool, PoolConfig};
use scriptgate::proxy::ProxyServer;
use scriptgate::router::Router;
use scriptgate::watcher::{WatchState, Watcher};
use scriptgate::{PKG_NAME, VERSION};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scriptgate=info".parse()?),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if explicit_path.is_some() || config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    if !config.server.dir.is_dir() {
        anyhow::bail!(
            "App root '{}' does not exist or is not a directory",
            config.server.dir.display()
        );
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let pool_config = PoolConfig {
        response_timeout: config.worker.response_timeout(),
        ..Default::default()
    };
    let root = config.server.dir.clone();
    let shared: SharedConfig = Arc::new(RwLock::new(config));

    // Watch the app tree and the configuration file
    let watch_state = Arc::new(WatchState::new(
        root,
        config_path.exists().then(|| config_path.clone()),
    ));
    let reload_target = Arc::clone(&shared);
    let reload_path = config_path.clone();
    let watcher = Watcher::start(Arc::clone(&watch_state), move || {
        reload_config(&reload_path, &reload_target)
    })?;

    let router = Arc::new(Router::new(
        Arc::new(FsAppLoader::new(Arc::clone(&shared))),
        watch_state,
        shared,
        Arc::new(ConnectionPool::new(pool_config)),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(bind_addr, Arc::clone(&router), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);
    watcher.stop();

    info!("Stopping all workers...");
    router.stop_all().await;

    let stats = router.pool().stats();
    info!(
        total_requests = stats.get_total_requests(),
        failed_requests = stats.get_failed_requests(),
        timed_out_requests = stats.get_timed_out_requests(),
        "Proxy statistics"
    );

    if tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .is_err()
    {
        warn!("Proxy server did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Re-read the configuration. The previous one stays in effect on failure.
fn reload_config(path: &Path, shared: &SharedConfig) {
    match Config::load(path) {
        Ok(config) => {
            let mut current = shared.write();
            if current.server.bind != config.server.bind
                || current.server.port != config.server.port
                || current.server.dir != config.server.dir
            {
                warn!("Changes to [server] take effect after a restart");
            }
            *current = config;
            info!(path = %path.display(), "Configuration reloaded");
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to reload configuration, keeping previous");
        }
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting app server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        dir = %config.server.dir.display(),
        "Server configuration"
    );
    info!(
        idle_timeout_ms = config.worker.idle_timeout_ms,
        startup_timeout_ms = config.worker.startup_timeout_ms,
        shutdown_grace_period_ms = config.worker.shutdown_grace_period_ms,
        response_timeout_secs = config.worker.response_timeout_secs,
        "Worker settings"
    );
    if let Some(ref executable) = config.runtime.executable {
        info!(executable = %executable.display(), "Runtime executable configured");
    }
}
