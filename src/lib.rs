//! Scriptgate - hosts many script apps behind one HTTP server
//!
//! This library provides an on-demand app host that:
//! - Routes HTTP traffic by Host header to apps laid out as `<root>/<domain>/<app>/`
//! - Spawns one sandboxed runtime process per app when traffic arrives
//! - Waits for a `READY` handshake before proxying HTTP and WebSocket traffic
//! - Stops workers after a period without in-flight requests
//! - Watches the app tree and replaces workers whose sources changed

pub mod app;
pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod router;
pub mod runtime;
pub mod watcher;
pub mod websocket;
pub mod worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
