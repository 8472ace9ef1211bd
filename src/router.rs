//! Host-based routing and the worker registry
//!
//! Every request resolves its Host header to an app, then asks the registry
//! for a worker. A cached worker is reused while its process is alive and it
//! started after the app's last recorded change. Otherwise a replacement is
//! spawned under a per-app lock so a burst of requests during a deploy
//! triggers exactly one spawn.

use crate::app::{app_key, AppLoader};
use crate::config::SharedConfig;
use crate::error::{json_error_response, AppError, GetWorkerError, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::watcher::{is_reserved, WatchState};
use crate::worker::Worker;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum hostname length allowed by DNS
const MAX_HOSTNAME_LEN: usize = 253;

const X_REQUEST_ID: &str = "x-request-id";

pub struct Router {
    loader: Arc<dyn AppLoader>,
    watch: Arc<WatchState>,
    config: SharedConfig,
    pool: Arc<ConnectionPool>,
    /// Current worker per app key
    workers: DashMap<String, Arc<Worker>>,
    /// Serializes replacement spawns per app key
    spawn_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl Router {
    pub fn new(
        loader: Arc<dyn AppLoader>,
        watch: Arc<WatchState>,
        config: SharedConfig,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            loader,
            watch,
            config,
            pool,
            workers: DashMap::new(),
            spawn_locks: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn watch_state(&self) -> &Arc<WatchState> {
        &self.watch
    }

    /// Registered worker for an app, live or not
    pub fn worker(&self, domain: &str, appname: &str) -> Option<Arc<Worker>> {
        self.workers
            .get(&app_key(appname, domain))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Map a hostname to `(domain, appname)`. CNAME aliases are consulted
    /// first, then `<root>/<hostname>/_`, then `<root>/<domain>/<app>`.
    pub fn resolve(&self, hostname: &str) -> Option<(String, String)> {
        let hostname = hostname.to_lowercase();
        let hostname = self.watch.resolve_cname(&hostname).unwrap_or(hostname);
        let root = self.watch.root();

        if is_domain_segment(&hostname) && root.join(&hostname).join("_").is_dir() {
            return Some((hostname, "_".to_string()));
        }

        let (appname, domain) = hostname.split_once('.')?;
        if !is_dir_segment(appname) || !is_domain_segment(domain) {
            return None;
        }

        if root.join(domain).join(appname).is_dir() {
            return Some((domain.to_string(), appname.to_string()));
        }

        None
    }

    /// Return a running, up-to-date worker for the app, spawning one if needed
    pub async fn get_worker(
        &self,
        domain: &str,
        appname: &str,
    ) -> Result<Arc<Worker>, GetWorkerError> {
        let key = app_key(appname, domain);

        if let Some(worker) = self.fresh_worker(&key, domain, appname) {
            return Ok(worker);
        }

        let lock = Arc::clone(self.spawn_locks.entry(key.clone()).or_default().value());
        let _guard = lock.lock().await;

        // Another request may have finished the spawn while we waited
        if let Some(worker) = self.fresh_worker(&key, domain, appname) {
            return Ok(worker);
        }

        let app = self.loader.load_app(domain, appname)?;
        let (worker_config, runtime_config) = {
            let config = self.config.read();
            (config.worker.clone(), config.runtime.clone())
        };

        info!(app = %key, "Starting worker");
        let worker = Arc::new(Worker::new(
            app,
            worker_config,
            runtime_config,
            Arc::clone(&self.pool),
        ));
        worker.start().await?;

        // The superseded worker is left to its own idle reaper
        if let Some(previous) = self.workers.insert(key.clone(), Arc::clone(&worker)) {
            debug!(
                app = %key,
                previous_pid = previous.pid(),
                previous_running = previous.is_running(),
                "Replaced worker"
            );
        }

        Ok(worker)
    }

    fn fresh_worker(&self, key: &str, domain: &str, appname: &str) -> Option<Arc<Worker>> {
        // Clone out so no map shard lock is held while polling the process
        let worker = self.workers.get(key).map(|entry| Arc::clone(entry.value()))?;
        if !worker.is_running() {
            return None;
        }

        let started_at = worker.started_at()?;
        match self.watch.last_change(domain, appname) {
            Some(changed) if changed >= started_at => {
                debug!(app = %key, "Worker is stale");
                None
            }
            _ => Some(worker),
        }
    }

    /// Route one request
    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let Some(hostname) = extract_hostname(&req) else {
            return json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            );
        };

        debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let Some((domain, appname)) = self.resolve(&hostname) else {
            return json_error_response(
                ProxyErrorCode::UnknownHost,
                format!("No app found for hostname {}", hostname),
            );
        };

        match self.get_worker(&domain, &appname).await {
            Ok(worker) => worker.serve(req).await,
            Err(GetWorkerError::App(AppError::NotFound)) => json_error_response(
                ProxyErrorCode::AppNotFound,
                format!("App {} not found", app_key(&appname, &domain)),
            ),
            Err(e) => {
                error!(hostname, request_id, error = %e, "Failed to start worker");
                json_error_response(ProxyErrorCode::WorkerStartFailed, e.to_string())
            }
        }
    }

    /// Stop every registered worker
    pub async fn stop_all(&self) {
        let workers: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.workers.clear();

        info!(count = workers.len(), "Stopping all workers");
        let results = futures::future::join_all(workers.iter().map(|w| w.stop())).await;
        for (worker, result) in workers.iter().zip(results) {
            if let Err(e) = result {
                warn!(app = %worker.key(), error = %e, "Failed to stop worker");
            }
        }
    }
}

/// Hostnames map onto directory names; refuse anything that is not a plain one
fn is_dir_segment(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.')
}

/// Reserved root entries are never watched, so they are never served either
fn is_domain_segment(name: &str) -> bool {
    is_dir_segment(name) && !is_reserved(name)
}

/// Host header (or HTTP/2 authority) without port, validated and lowercased
fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    normalize_hostname(host)
}

fn normalize_hostname(host: &str) -> Option<String> {
    // Strip port if present
    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, underscore and dot only
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}
