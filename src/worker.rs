//! Supervisor for one sandboxed runtime process serving one app
//!
//! A worker goes through `NotStarted -> Starting -> Running -> Stopping ->
//! Stopped` exactly once. A stopped worker is never restarted; the router
//! builds a new one instead.

use crate::app::App;
use crate::config::{RuntimeConfig, WorkerConfig};
use crate::error::{json_error_response, ProxyErrorCode, ShutdownError, StartupError};
use crate::pool::ConnectionPool;
use crate::runtime::{CommandDescriptor, Runtime};
use crate::websocket::{is_websocket_upgrade, proxy_websocket};
use base64::Engine;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Line the runtime writes to stderr once it accepts connections
const READY_LINE: &str = "READY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    state: WorkerState,
    child: Option<Child>,
    port: Option<u16>,
    started_at: Option<SystemTime>,
}

pub struct Worker {
    app: App,
    key: String,
    inner: Mutex<Inner>,
    active_requests: AtomicUsize,
    idle_deadline: watch::Sender<Instant>,
    config: WorkerConfig,
    runtime: RuntimeConfig,
    pool: Arc<ConnectionPool>,
}

impl Worker {
    pub fn new(
        app: App,
        config: WorkerConfig,
        runtime: RuntimeConfig,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        let (idle_deadline, _) = watch::channel(Instant::now() + config.idle_timeout());
        Self {
            key: app.key(),
            app,
            inner: Mutex::new(Inner {
                state: WorkerState::NotStarted,
                child: None,
                port: None,
                started_at: None,
            }),
            active_requests: AtomicUsize::new(0),
            idle_deadline,
            config,
            runtime,
            pool,
        }
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.lock().port
    }

    /// Time the process was spawned. Taken before the runtime reads any app
    /// file, so a file written during startup still counts as newer.
    pub fn started_at(&self) -> Option<SystemTime> {
        self.inner.lock().started_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().child.as_ref().and_then(|c| c.id())
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Spawn the runtime and wait for its `READY` line
    pub async fn start(self: &Arc<Self>) -> Result<(), StartupError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::NotStarted {
                return Err(StartupError::AlreadyStarted);
            }
            inner.state = WorkerState::Starting;
        }

        match self.spawn().await {
            Ok((child, port, started_at)) => {
                info!(app = %self.key, port, pid = child.id(), "Worker ready");
                {
                    let mut inner = self.inner.lock();
                    inner.child = Some(child);
                    inner.port = Some(port);
                    inner.started_at = Some(started_at);
                    inner.state = WorkerState::Running;
                }
                self.reset_idle_timer();
                self.spawn_idle_monitor();
                Ok(())
            }
            Err(e) => {
                self.inner.lock().state = WorkerState::Stopped;
                Err(e)
            }
        }
    }

    async fn spawn(&self) -> Result<(Child, u16, SystemTime), StartupError> {
        let port = free_port().map_err(StartupError::PortAllocationFailed)?;
        let runtime = Runtime::locate(&self.runtime)?;

        let descriptor = CommandDescriptor::Fetch {
            entrypoint: self.app.entrypoint(),
            port,
        };
        let mut cmd = runtime.command(&self.app, &descriptor)?;
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(app = %self.key, executable = %runtime.executable().display(), port, "Spawning worker");
        let started_at = SystemTime::now();
        let mut child = cmd.spawn().map_err(StartupError::Spawn)?;

        let (ready_tx, ready_rx) = oneshot::channel();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, self.key.clone(), ready_tx));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, self.key.clone(), "stdout"));
        }

        let timeout = self.config.startup_timeout();
        let failure = match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(())) => return Ok((child, port, started_at)),
            Ok(Err(_)) => StartupError::StartupFailed,
            Err(_) => StartupError::StartupTimeout(timeout),
        };

        warn!(app = %self.key, error = %failure, "Worker failed to start");
        if let Err(e) = child.kill().await {
            warn!(app = %self.key, error = %e, "Failed to kill worker after failed start");
        }
        Err(failure)
    }

    /// True while the process is alive. An exited child is noticed here and
    /// moves the worker to `Stopped`.
    pub fn is_running(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != WorkerState::Running {
            return false;
        }

        let Some(child) = inner.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(app = %self.key, ?status, "Worker process exited unexpectedly");
                inner.child = None;
                inner.port = None;
                inner.state = WorkerState::Stopped;
                false
            }
            Err(e) => {
                warn!(app = %self.key, error = %e, "Could not poll worker process");
                true
            }
        }
    }

    /// Interrupt the process, then kill it after the grace period. No-op
    /// unless running.
    pub async fn stop(&self) -> Result<(), ShutdownError> {
        let child = {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Running {
                return Ok(());
            }
            inner.state = WorkerState::Stopping;
            inner.child.take()
        };

        let result = match child {
            Some(child) => self.terminate(child).await,
            None => Ok(()),
        };

        let mut inner = self.inner.lock();
        inner.port = None;
        inner.state = WorkerState::Stopped;
        result
    }

    async fn terminate(&self, mut child: Child) -> Result<(), ShutdownError> {
        let grace_period = self.config.shutdown_grace_period();

        let Some(pid) = child.id() else {
            // Already reaped
            return Ok(());
        };

        info!(app = %self.key, pid, "Sending SIGINT to worker");

        #[cfg(unix)]
        {
            // SAFETY: pid belongs to a child we have not yet reaped
            let rc = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    if let Err(e) = child.kill().await {
                        warn!(app = %self.key, pid, error = %e, "Failed to kill worker after signal failure");
                    }
                    return Err(ShutdownError::SignalFailed(err));
                }
            }
        }

        #[cfg(not(unix))]
        {
            child.start_kill().map_err(ShutdownError::SignalFailed)?;
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(app = %self.key, ?status, "Worker exited");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(app = %self.key, error = %e, "Error waiting for worker to exit");
                Ok(())
            }
            Err(_) => {
                warn!(
                    app = %self.key,
                    grace_period_ms = grace_period.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                child.kill().await.map_err(ShutdownError::KillFailed)?;
                Err(ShutdownError::ShutdownTimeout(grace_period))
            }
        }
    }

    /// Push the idle deadline out by one idle timeout from now
    fn reset_idle_timer(&self) {
        self.idle_deadline
            .send_replace(Instant::now() + self.config.idle_timeout());
    }

    fn spawn_idle_monitor(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let mut deadline_rx = self.idle_deadline.subscribe();

        tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow_and_update();

                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if worker.state() != WorkerState::Running {
                            return;
                        }

                        if worker.active_requests() == 0 {
                            info!(app = %worker.key, "Worker idle, stopping");
                            if let Err(e) = worker.stop().await {
                                warn!(app = %worker.key, error = %e, "Failed to stop idle worker");
                            }
                            return;
                        }

                        // Busy: the next finished request re-arms the timer
                        if deadline_rx.changed().await.is_err() {
                            return;
                        }
                    }
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Count a request as in flight until the guard drops
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            worker: Arc::clone(self),
        }
    }

    /// Proxy a request (plain HTTP or WebSocket) to the runtime
    pub async fn serve(self: &Arc<Self>, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let guard = self.begin_request();

        let Some(port) = self.port() else {
            return json_error_response(ProxyErrorCode::UpstreamFailed, "Worker is not running");
        };

        if is_websocket_upgrade(req.headers()) {
            return match proxy_websocket(req, port, guard).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(app = %self.key, port, error = %e, "WebSocket proxy failed");
                    json_error_response(ProxyErrorCode::from(&e), e.to_string())
                }
            };
        }

        match self.pool.forward(req, port).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                // The guard rides along with the body so streaming responses
                // keep the worker busy until the last frame
                let body = body
                    .map_frame(move |frame| {
                        let _held = &guard;
                        frame
                    })
                    .boxed();
                Response::from_parts(parts, body)
            }
            Err(e) => {
                warn!(app = %self.key, port, error = %e, "Proxy request failed");
                json_error_response(ProxyErrorCode::from(&e), e.to_string())
            }
        }
    }

    /// Build a one-shot `run` invocation. The caller wires stdio.
    pub fn command(&self, args: Vec<String>) -> Result<Command, StartupError> {
        let runtime = Runtime::locate(&self.runtime)?;
        runtime.command(
            &self.app,
            &CommandDescriptor::Run {
                entrypoint: self.app.entrypoint(),
                args,
            },
        )
    }

    /// Deliver a raw email message to the app's email handler
    pub async fn send_email(&self, msg: &[u8]) -> anyhow::Result<()> {
        let runtime = Runtime::locate(&self.runtime)?;
        let mut cmd = runtime.command(
            &self.app,
            &CommandDescriptor::Email {
                entrypoint: self.app.entrypoint(),
                msg: base64::engine::general_purpose::STANDARD.encode(msg),
            },
        )?;
        cmd.stdin(Stdio::null());

        let output = cmd.output().await?;
        log_output(&self.key, "stdout", &output.stdout);
        log_output(&self.key, "stderr", &output.stderr);

        if !output.status.success() {
            anyhow::bail!("email handler for {} failed: {}", self.key, output.status);
        }
        Ok(())
    }
}

/// Marks one request as in flight. Dropping it re-arms the idle timer.
pub struct InFlightGuard {
    worker: Arc<Worker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.worker.reset_idle_timer();
        self.worker.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ask the OS for a free loopback port
fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Watch stderr for the ready line, then keep forwarding it to the log
async fn forward_stderr<R>(stderr: R, app: String, ready_tx: oneshot::Sender<()>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    let mut ready_tx = Some(ready_tx);

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if ready_tx.is_some() && line == READY_LINE {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                    continue;
                }
                info!(target: "console", app = %app, stream = "stderr", "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                error!(app = %app, error = %e, "Failed to read worker stderr");
                break;
            }
        }
    }
    // Dropping an unused ready_tx tells start() the stream ended first
}

async fn forward_lines<R>(stream: R, app: String, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "console", app = %app, stream = name, "{}", line);
    }
}

fn log_output(app: &str, stream: &'static str, bytes: &[u8]) {
    for line in String::from_utf8_lossy(bytes).lines() {
        info!(target: "console", app = %app, stream, "{}", line);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("port", &self.port())
            .field("active_requests", &self.active_requests())
            .finish()
    }
}
