//! Sandbox runtime stand-in for integration testing
//!
//! Invoked the same way as the real runtime: the last argument is the JSON
//! command descriptor. Behavior is tuned through the app environment:
//! - MOCK_STARTUP_DELAY_MS: delay before listening (default: 0)
//! - MOCK_FAIL_BEFORE_READY: exit with status 1 before reporting READY
//! - MOCK_GREETING: echoed back in the JSON body of `/`

use base64::Engine;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::convert::Infallible;
use std::env;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type Body = http_body_util::combinators::BoxBody<Bytes, Infallible>;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
enum Descriptor {
    Fetch { port: u16 },
    Run { args: Vec<String> },
    Email { msg: String },
}

#[tokio::main]
async fn main() {
    let raw = env::args().last().unwrap_or_default();
    let descriptor: Descriptor = match serde_json::from_str(&raw) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("mock runtime: invalid descriptor {:?}: {}", raw, e);
            std::process::exit(2);
        }
    };

    match descriptor {
        Descriptor::Fetch { port } => serve(port).await,
        Descriptor::Run { args } => {
            println!("run {}", args.join(" "));
        }
        Descriptor::Email { msg } => {
            match base64::engine::general_purpose::STANDARD.decode(msg.as_bytes()) {
                Ok(bytes) => println!("email {}", String::from_utf8_lossy(&bytes)),
                Err(e) => {
                    eprintln!("mock runtime: bad email payload: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn serve(port: u16) {
    let delay: u64 = env::var("MOCK_STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if delay > 0 {
        eprintln!("mock runtime: sleeping for {}ms before starting", delay);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    if env::var("MOCK_FAIL_BEFORE_READY").is_ok() {
        eprintln!("mock runtime: failing on purpose");
        std::process::exit(1);
    }

    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("mock runtime: failed to bind {}: {}", port, e);
            std::process::exit(1);
        }
    };

    eprintln!("mock runtime: listening on port {}", port);
    eprintln!("READY");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("mock runtime: accept error: {}", e);
                continue;
            }
        };
        tokio::spawn(async move {
            let service = service_fn(|req: Request<Incoming>| async move {
                Ok::<_, Infallible>(route(req).await)
            });
            let _ = AutoBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await;
        });
    }
}

async fn route(req: Request<Incoming>) -> Response<Body> {
    if req.headers().contains_key(SEC_WEBSOCKET_KEY) {
        return upgrade(req);
    }

    match req.uri().path() {
        "/redirect" => Response::builder()
            .status(StatusCode::FOUND)
            .header("Location", "/elsewhere")
            .body(full(""))
            .unwrap_or_else(|_| Response::new(full(""))),
        "/slow" => {
            let ms: u64 = req
                .uri()
                .query()
                .and_then(|q| q.strip_prefix("ms="))
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Response::new(full("slow response"))
        }
        _ => {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let body = serde_json::json!({
                "pid": std::process::id(),
                "method": req.method().as_str(),
                "path": req.uri().path(),
                "x_forwarded_host": header("x-forwarded-host"),
                "x_forwarded_proto": header("x-forwarded-proto"),
                "greeting": env::var("MOCK_GREETING").ok(),
            });
            Response::builder()
                .header("Content-Type", "application/json")
                .body(full(body.to_string()))
                .unwrap_or_else(|_| Response::new(full("")))
        }
    }
}

/// Accept the upgrade and echo text and binary messages back
fn upgrade(req: Request<Incoming>) -> Response<Body> {
    let accept = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
        .unwrap_or_default();

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(u) => u,
            Err(e) => {
                eprintln!("mock runtime: upgrade failed: {}", e);
                return;
            }
        };
        let mut ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(_) | Message::Binary(_) => {
                    if ws.send(msg).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = ws.close(None).await;
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, HeaderValue::from_static("upgrade"))
        .header(UPGRADE, HeaderValue::from_static("websocket"))
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Empty::<Bytes>::new().boxed())
        .unwrap_or_else(|_| Response::new(full("")))
}

fn full(body: impl Into<Bytes>) -> Body {
    Full::new(body.into()).boxed()
}
