//! WebSocket relay between an upgraded client connection and a worker
//!
//! The worker side is dialed first so a refused connection can still be
//! reported as a regular HTTP error. Only after the worker accepts do we
//! answer the client with `101 Switching Protocols` and start relaying frames.

use crate::error::ProxyError;
use futures::{SinkExt, StreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// True if the request asks for `Upgrade: websocket`
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Dial the worker, answer the client with 101 and relay frames in a
/// background task. `guard` lives as long as the relay.
pub async fn proxy_websocket<G>(
    req: Request<Incoming>,
    port: u16,
    guard: G,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError>
where
    G: Send + 'static,
{
    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| ProxyError::UpgradeFailed("missing Sec-WebSocket-Key".to_string()))?;
    let accept = derive_accept_key(key.as_bytes());

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut upstream_req = format!("ws://127.0.0.1:{}{}", port, path)
        .into_client_request()
        .map_err(|e| ProxyError::UpgradeFailed(e.to_string()))?;
    if let Some(protocols) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        upstream_req
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    }

    let (upstream, upstream_resp) = tokio_tungstenite::connect_async(upstream_req)
        .await
        .map_err(|e| ProxyError::DialFailed(e.to_string()))?;

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, HeaderValue::from_static("upgrade"))
        .header(UPGRADE, HeaderValue::from_static("websocket"))
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = upstream_resp.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .map_err(|e| ProxyError::UpgradeFailed(e.to_string()))?;

    tokio::spawn(async move {
        let _guard = guard;
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                bridge(client, upstream).await;
                debug!(port, "WebSocket relay closed");
            }
            Err(e) => {
                warn!(port, error = %e, "Client upgrade failed");
            }
        }
    });

    Ok(response)
}

/// Relay messages both ways until either side closes or errors, then close both
pub async fn bridge<A, B>(client: WebSocketStream<A>, upstream: WebSocketStream<B>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    {
        let client_to_upstream = async {
            while let Some(Ok(msg)) = client_rx.next().await {
                if !relay(&mut upstream_tx, msg).await {
                    break;
                }
            }
        };

        let upstream_to_client = async {
            while let Some(Ok(msg)) = upstream_rx.next().await {
                if !relay(&mut client_tx, msg).await {
                    break;
                }
            }
        };

        tokio::select! {
            _ = client_to_upstream => {}
            _ = upstream_to_client => {}
        }
    }

    let _ = client_tx.close().await;
    let _ = upstream_tx.close().await;
}

/// Forward one message. Returns false once the relay should stop.
async fn relay<S>(sink: &mut S, msg: Message) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    match msg {
        // Answered by each side's own protocol handler
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => true,
        Message::Close(frame) => {
            let _ = sink.send(Message::Close(frame)).await;
            false
        }
        msg => sink.send(msg).await.is_ok(),
    }
}
