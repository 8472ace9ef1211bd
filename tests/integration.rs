//! Integration tests for Scriptgate
//!
//! The `mock-runtime` binary stands in for the sandbox runtime: it reads the
//! command descriptor from its last argument, prints `READY` on stderr and
//! answers HTTP and WebSocket requests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use scriptgate::app::FsAppLoader;
use scriptgate::config::{Config, SharedConfig};
use scriptgate::pool::{ConnectionPool, PoolConfig};
use scriptgate::proxy::ProxyServer;
use scriptgate::router::Router;
use scriptgate::watcher::{WatchState, Watcher};
use scriptgate::worker::WorkerState;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

static MOCK_RUNTIME: OnceLock<PathBuf> = OnceLock::new();

/// Path to the mock runtime binary. The separate crate under
/// `tests/mock_runtime` is built once per test run.
fn mock_runtime_path() -> PathBuf {
    MOCK_RUNTIME
        .get_or_init(|| {
            let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/mock_runtime");
            let status = std::process::Command::new(option_env!("CARGO").unwrap_or("cargo"))
                .args(["build", "--release", "--quiet", "--manifest-path"])
                .arg(crate_dir.join("Cargo.toml"))
                .status()
                .expect("Failed to run cargo for the mock runtime");
            assert!(status.success(), "Failed to build the mock runtime");

            let mut path = crate_dir.join("target/release/mock-runtime");
            if cfg!(windows) {
                path.set_extension("exe");
            }
            path
        })
        .clone()
}

/// Create `<root>/<domain>/<app>/main.ts`, plus a `.env` when given
fn create_app(root: &Path, domain: &str, app: &str, dotenv: Option<&str>) -> PathBuf {
    let dir = root.join(domain).join(app);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("main.ts"), "export default { fetch: () => new Response('hi') }\n")
        .unwrap();
    if let Some(dotenv) = dotenv {
        std::fs::write(dir.join(".env"), dotenv).unwrap();
    }
    dir
}

fn test_config(root: &Path, cache: &Path) -> Config {
    let mut config = Config::default();
    config.server.dir = root.to_path_buf();
    config.runtime.executable = Some(mock_runtime_path());
    config.runtime.cache_dir = Some(cache.to_path_buf());
    config.worker.idle_timeout_ms = 10_000;
    config.worker.startup_timeout_ms = 5_000;
    config.worker.shutdown_grace_period_ms = 1_000;
    config
        .env
        .insert("MOCK_GREETING".to_string(), "hello from config".to_string());
    config
}

struct TestServer {
    port: u16,
    router: Arc<Router>,
    watcher: Option<Arc<Watcher>>,
    shutdown_tx: watch::Sender<bool>,
    root: TempDir,
    _cache: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}, false).await
    }

    /// Start a proxy over a fresh app root. `setup` runs before the server
    /// is built so it can create apps and tune the configuration.
    async fn start_with<F>(setup: F, watch_files: bool) -> Self
    where
        F: FnOnce(&mut Config),
    {
        let root = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        create_app(root.path(), "example.com", "hello", None);
        create_app(root.path(), "example.com", "_", None);

        let mut config = test_config(root.path(), cache.path());
        setup(&mut config);

        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            response_timeout: config.worker.response_timeout(),
            ..Default::default()
        }));
        let shared: SharedConfig = Arc::new(RwLock::new(config));
        let watch_state = Arc::new(WatchState::new(root.path().to_path_buf(), None));
        let watcher = if watch_files {
            Some(Watcher::start(Arc::clone(&watch_state), || {}).unwrap())
        } else {
            None
        };

        let router = Arc::new(Router::new(
            Arc::new(FsAppLoader::new(Arc::clone(&shared))),
            watch_state,
            shared,
            pool,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::new(addr, Arc::clone(&router), shutdown_rx);
        tokio::spawn(async move { server.serve(listener).await });

        Self {
            port: addr.port(),
            router,
            watcher,
            shutdown_tx,
            root,
            _cache: cache,
        }
    }

    fn root(&self) -> &Path {
        self.root.path()
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        self.router.stop_all().await;
    }
}

struct HttpResponse {
    status: u16,
    head: String,
    body: String,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_lowercase());
        self.head
            .lines()
            .find(|l| l.to_lowercase().starts_with(&prefix))
            .map(|l| l[prefix.len()..].trim().to_string())
    }

    fn json(&self) -> serde_json::Value {
        // Tolerate chunked framing around the JSON document
        let start = self.body.find('{').expect("JSON body");
        let end = self.body.rfind('}').expect("JSON body");
        serde_json::from_str(&self.body[start..=end]).unwrap()
    }
}

/// Send a raw HTTP request and read the response until the server closes
async fn raw_request(port: u16, request: &str) -> HttpResponse {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let (head, body) = response.split_once("\r\n\r\n").unwrap_or((&response, ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    HttpResponse {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}

/// Send HTTP request with custom Host header
async fn http_get_with_host(port: u16, path: &str, host: &str) -> HttpResponse {
    raw_request(
        port,
        &format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        ),
    )
    .await
}

async fn pid_for(port: u16, host: &str) -> u64 {
    let response = http_get_with_host(port, "/", host).await;
    assert_eq!(response.status, 200, "body: {}", response.body);
    response.json()["pid"].as_u64().unwrap()
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_proxy_forwards_with_headers() {
    let server = TestServer::start().await;

    let response = http_get_with_host(server.port, "/", "hello.example.com").await;
    assert_eq!(response.status, 200, "body: {}", response.body);

    let json = response.json();
    assert_eq!(json["method"], "GET");
    assert_eq!(json["path"], "/");
    assert_eq!(json["x_forwarded_host"], "hello.example.com");
    assert_eq!(json["x_forwarded_proto"], "http");
    assert_eq!(json["greeting"], "hello from config");

    let worker = server.router.worker("example.com", "hello").unwrap();
    assert_eq!(worker.state(), WorkerState::Running);
    assert_eq!(worker.pid(), json["pid"].as_u64().map(|p| p as u32));

    server.shutdown().await;
}

#[tokio::test]
async fn test_host_with_port_and_uppercase() {
    let server = TestServer::start().await;

    let response = http_get_with_host(server.port, "/", "HELLO.Example.com:8080").await;
    assert_eq!(response.status, 200, "body: {}", response.body);
    assert_eq!(server.router.worker_count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_root_app_for_bare_domain() {
    let server = TestServer::start().await;

    let response = http_get_with_host(server.port, "/", "example.com").await;
    assert_eq!(response.status, 200, "body: {}", response.body);
    assert!(server.router.worker("example.com", "_").is_some());

    server.shutdown().await;
}

#[tokio::test]
async fn test_cname_alias_routes_to_app() {
    let server = TestServer::start_with(|_| {}, false).await;
    std::fs::write(
        server.root().join("example.com").join("hello").join("CNAME"),
        "www.custom.org\n",
    )
    .unwrap();
    server.router.watch_state().refresh_cnames();

    let response = http_get_with_host(server.port, "/", "www.custom.org").await;
    assert_eq!(response.status, 200, "body: {}", response.body);
    assert!(server.router.worker("example.com", "hello").is_some());

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_host_returns_404() {
    let server = TestServer::start().await;

    let response = http_get_with_host(server.port, "/", "nope.example.org").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("x-proxy-error").as_deref(), Some("UNKNOWN_HOST"));
    assert_eq!(server.router.worker_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_host_returns_400() {
    let server = TestServer::start().await;

    let response = raw_request(server.port, "GET / HTTP/1.0\r\n\r\n").await;
    assert_eq!(response.status, 400);
    assert_eq!(
        response.header("x-proxy-error").as_deref(),
        Some("MISSING_HOST_HEADER")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_app_config_returns_500() {
    let server = TestServer::start().await;
    let dir = create_app(server.root(), "example.com", "broken", None);
    std::fs::write(dir.join("smallweb.json"), "{ not json").unwrap();

    let response = http_get_with_host(server.port, "/", "broken.example.com").await;
    assert_eq!(response.status, 500);
    assert_eq!(
        response.header("x-proxy-error").as_deref(),
        Some("WORKER_START_FAILED")
    );
    assert_eq!(server.router.worker_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_redirect_passes_through() {
    let server = TestServer::start().await;

    let response = http_get_with_host(server.port, "/redirect", "hello.example.com").await;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("location").as_deref(), Some("/elsewhere"));

    server.shutdown().await;
}

// ============================================================================
// Worker lifecycle
// ============================================================================

#[tokio::test]
async fn test_concurrent_requests_spawn_once() {
    let server = TestServer::start().await;
    let port = server.port;

    let requests = (0..10).map(|_| tokio::spawn(pid_for(port, "hello.example.com")));
    let pids: Vec<u64> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(pids.iter().all(|pid| *pid == pids[0]), "pids: {:?}", pids);
    assert_eq!(server.router.worker_count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_worker_reused_between_requests() {
    let server = TestServer::start().await;

    let first = pid_for(server.port, "hello.example.com").await;
    let second = pid_for(server.port, "hello.example.com").await;
    assert_eq!(first, second);

    server.shutdown().await;
}

#[tokio::test]
async fn test_startup_failure_returns_500() {
    let server = TestServer::start().await;
    create_app(
        server.root(),
        "example.com",
        "failing",
        Some("MOCK_FAIL_BEFORE_READY=1\n"),
    );

    let response = http_get_with_host(server.port, "/", "failing.example.com").await;
    assert_eq!(response.status, 500);
    assert_eq!(
        response.header("x-proxy-error").as_deref(),
        Some("WORKER_START_FAILED")
    );
    assert!(server.router.worker("example.com", "failing").is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_startup_timeout_returns_500() {
    let server = TestServer::start_with(|c| c.worker.startup_timeout_ms = 300, false).await;
    create_app(
        server.root(),
        "example.com",
        "sluggish",
        Some("MOCK_STARTUP_DELAY_MS=3000\n"),
    );

    let start = std::time::Instant::now();
    let response = http_get_with_host(server.port, "/", "sluggish.example.com").await;
    assert_eq!(response.status, 500);
    assert!(response.body.contains("READY"), "body: {}", response.body);
    assert!(start.elapsed() < Duration::from_secs(3));

    server.shutdown().await;
}

#[tokio::test]
async fn test_startup_delay_within_timeout() {
    let server = TestServer::start().await;
    create_app(
        server.root(),
        "example.com",
        "delayed",
        Some("MOCK_STARTUP_DELAY_MS=300\n"),
    );

    let response = http_get_with_host(server.port, "/", "delayed.example.com").await;
    assert_eq!(response.status, 200, "body: {}", response.body);

    server.shutdown().await;
}

#[tokio::test]
async fn test_app_env_overrides_global() {
    let server = TestServer::start().await;
    create_app(
        server.root(),
        "example.com",
        "custom",
        Some("MOCK_GREETING=\"from dotenv\"\n"),
    );

    let response = http_get_with_host(server.port, "/", "custom.example.com").await;
    assert_eq!(response.json()["greeting"], "from dotenv");

    server.shutdown().await;
}

#[tokio::test]
async fn test_slow_request_outlives_idle_timeout() {
    let server = TestServer::start_with(|c| c.worker.idle_timeout_ms = 300, false).await;

    let first = pid_for(server.port, "hello.example.com").await;

    let response = http_get_with_host(server.port, "/slow?ms=1200", "hello.example.com").await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains("slow response"));

    // Idle timer restarted when the slow response finished
    let second = pid_for(server.port, "hello.example.com").await;
    assert_eq!(first, second);

    server.shutdown().await;
}

#[tokio::test]
async fn test_idle_worker_is_stopped_and_respawned() {
    let server = TestServer::start_with(|c| c.worker.idle_timeout_ms = 300, false).await;

    let first = pid_for(server.port, "hello.example.com").await;
    let worker = server.router.worker("example.com", "hello").unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while worker.state() != WorkerState::Stopped && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(worker.state(), WorkerState::Stopped);

    let second = pid_for(server.port, "hello.example.com").await;
    assert_ne!(first, second);

    server.shutdown().await;
}

#[tokio::test]
async fn test_source_change_replaces_worker() {
    let server = TestServer::start_with(|_| {}, true).await;

    let first = pid_for(server.port, "hello.example.com").await;
    let old = server.router.worker("example.com", "hello").unwrap();
    let started_at = old.started_at().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(
        server.root().join("example.com").join("hello").join("main.ts"),
        "export default { fetch: () => new Response('v2') }\n",
    )
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let changed = server
            .router
            .watch_state()
            .last_change("example.com", "hello");
        if changed.map(|t| t >= started_at).unwrap_or(false) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "change was never observed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let second = pid_for(server.port, "hello.example.com").await;
    assert_ne!(first, second);

    // The superseded worker keeps running until its own idle timeout
    assert!(old.is_running());
    assert_eq!(server.router.worker_count(), 1);

    old.stop().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_change_in_data_dir_keeps_worker() {
    let server = TestServer::start().await;

    let first = pid_for(server.port, "hello.example.com").await;
    let data = server.root().join("example.com").join("hello").join("data");
    std::fs::create_dir_all(&data).unwrap();
    server
        .router
        .watch_state()
        .record_change(&data.join("db.json"), SystemTime::now());

    let second = pid_for(server.port, "hello.example.com").await;
    assert_eq!(first, second);

    server.shutdown().await;
}

#[tokio::test]
async fn test_stop_all_stops_workers() {
    let server = TestServer::start().await;

    pid_for(server.port, "hello.example.com").await;
    pid_for(server.port, "example.com").await;
    let hello = server.router.worker("example.com", "hello").unwrap();
    let root = server.router.worker("example.com", "_").unwrap();

    server.router.stop_all().await;

    assert_eq!(server.router.worker_count(), 0);
    assert_eq!(hello.state(), WorkerState::Stopped);
    assert_eq!(root.state(), WorkerState::Stopped);

    server.shutdown().await;
}

// ============================================================================
// CLI and email commands
// ============================================================================

#[tokio::test]
async fn test_worker_command_runs_descriptor() {
    let server = TestServer::start().await;

    let worker = server.router.get_worker("example.com", "hello").await.unwrap();
    let output = worker
        .command(vec!["migrate".to_string(), "--dry-run".to_string()])
        .unwrap()
        .output()
        .await
        .unwrap();

    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        "run migrate --dry-run"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_worker_send_email() {
    let server = TestServer::start().await;

    let worker = server.router.get_worker("example.com", "hello").await.unwrap();
    worker
        .send_email(b"From: a@example.com\r\n\r\nhello")
        .await
        .unwrap();

    server.shutdown().await;
}

// ============================================================================
// WebSocket
// ============================================================================

#[tokio::test]
async fn test_websocket_echo_through_proxy() {
    let server = TestServer::start().await;

    let mut request = format!("ws://127.0.0.1:{}/ws", server.port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Host", "hello.example.com".parse().unwrap());

    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status(), 101);

    let worker = server.router.worker("example.com", "hello").unwrap();

    ws.send(Message::text("ping over proxy")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Message::text("ping over proxy"));

    // An open socket counts as an in-flight request
    assert_eq!(worker.active_requests(), 1);

    ws.close(None).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while worker.active_requests() != 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(worker.active_requests(), 0);

    server.shutdown().await;
}
