//! WebSocket transport and the small informational HTTP surface.
//!
//! One WebSocket text frame carries one IRC line in each direction. The
//! transport honors X-Forwarded-For / X-Forwarded-Proto only when the peer
//! is inside a configured reverse-proxy range.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::gateway::Gateway;
use crate::session::Signal;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/webirc", get(info))
        .route("/webirc/_status", get(status))
        .route("/webirc/websocket", get(websocket_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

pub async fn serve(gateway: Arc<Gateway>, listen_addr: &str) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "http/websocket listening");
    axum::serve(
        listener,
        router(gateway).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn info() -> Json<serde_json::Value> {
    Json(json!({
        "name": "webirc-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Loopback-only dump of the live sessions.
async fn status(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    let mut out = gateway.status_lines().join("\n");
    out.push('\n');
    out.into_response()
}

async fn websocket_upgrade(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get("origin")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    // Check before the upgrade so a bad origin costs one HTTP round trip.
    if !gateway.config.is_origin_allowed(&origin) {
        tracing::info!(%origin, "origin not allowed, refusing upgrade");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let remote_ip = client_ip(&gateway, addr, &headers);
    let secure = is_secure(&gateway, addr, &headers);

    ws.on_upgrade(move |socket| handle_socket(gateway, socket, origin, remote_ip, secure))
}

async fn handle_socket(
    gateway: Arc<Gateway>,
    mut socket: WebSocket,
    origin: String,
    remote_ip: IpAddr,
    secure: bool,
) {
    let info = gateway.build_conn_info(&origin, remote_ip, secure).await;
    let (session, mut signals) = match gateway.new_client(info).await {
        Ok(admitted) => admitted,
        Err(e) => {
            tracing::info!(%remote_ip, "client refused: {e}");
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let line = text.as_str().trim_end_matches(['\r', '\n']);
                    session.deliver_from_transport(line.to_string());
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        let line = text.trim_end_matches(['\r', '\n']);
                        session.deliver_from_transport(line.to_string());
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by axum
                Some(Err(_)) => break,
            },

            signal = signals.recv() => match signal {
                Some(Signal::Data(line)) => {
                    if socket.send(WsMessage::Text(line.into())).await.is_err() {
                        break;
                    }
                }
                // Lifecycle markers aren't wire data on this transport; the
                // socket itself conveys open/closed.
                Some(Signal::State { .. }) => {}
                None => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    return;
                }
            },
        }
    }

    // Release our end of the signal stream before taking the shutdown latch
    // so an in-flight signal send can never block it.
    drop(signals);
    session.start_shutdown("client_closed").await;
}

fn client_ip(gateway: &Gateway, addr: SocketAddr, headers: &HeaderMap) -> IpAddr {
    let remote = addr.ip();
    if !gateway.config.is_trusted_proxy(remote) {
        return remote;
    }
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(remote)
}

fn is_secure(gateway: &Gateway, addr: SocketAddr, headers: &HeaderMap) -> bool {
    if !gateway.config.is_trusted_proxy(addr.ip()) {
        // TLS terminates at the reverse proxy or not at all; a direct
        // connection to this listener is plain HTTP.
        return false;
    }
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .map(|proto| proto.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}
