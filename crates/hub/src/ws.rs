// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Axum WebSocket transport driving the device and App duplex endpoints
//! (§1, §6). Framing, TLS, and auth-header handling belong to the endpoint
//! itself and are out of scope (§1) — this module only turns an upgraded
//! socket into a `ChannelTransport` and bridges it against the abstract
//! `Transport` contract the core sends through, mirroring the teacher's
//! `ws_handler`/`handle_ws` split. No REST admin surface is served here:
//! session administration (settings/location/calendar updates) is this
//! crate's Rust API, called directly by the out-of-scope external layer
//! that fronts it (§1, §6 non-goal).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::messages::{AppInbound, DeviceInbound};
use crate::registry::Registry;
use crate::transport::{ChannelTransport, OutboundFrame};

/// Build the axum `Router` serving the device and App WebSocket endpoints
/// plus a bare health check.
pub fn build_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/ws/device/{user_id}", get(device_ws_handler))
        .route("/ws/app/{user_id}", get(app_ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

async fn health() -> &'static str {
    "ok"
}

/// `GET /ws/device/{user_id}` — device duplex endpoint upgrade.
async fn device_ws_handler(State(registry): State<Arc<Registry>>, Path(user_id): Path<String>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_device_ws(socket, registry, user_id))
}

async fn handle_device_ws(socket: WebSocket, registry: Arc<Registry>, user_id: String) {
    let session = registry.get_or_create(&user_id).await;
    let (transport, mut outbound_rx) = ChannelTransport::new();
    if session.attach_device(transport.clone()).await.is_err() {
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Binary(bytes)) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close { .. }) => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<DeviceInbound>(&text) {
                            Ok(decoded) => session.route_device_message(decoded).await,
                            Err(e) => debug!(err = %e, "failed to decode device message"),
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        session.audio.ingress(bytes).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    transport.mark_closed();
    session.detach_device("device websocket closed").await;
}

/// `GET /ws/app/{user_id}` — App duplex endpoint upgrade. The first text
/// frame must be `app_connection_init`; anything else aborts the upgrade
/// without registering a connection.
async fn app_ws_handler(State(registry): State<Arc<Registry>>, Path(user_id): Path<String>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_app_ws(socket, registry, user_id))
}

async fn handle_app_ws(socket: WebSocket, registry: Arc<Registry>, user_id: String) {
    let session = registry.get_or_create(&user_id).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(Ok(Message::Text(first))) = ws_rx.next().await else { return };
    let Ok(AppInbound::AppConnectionInit { package_name, api_key, session_id }) = serde_json::from_str::<AppInbound>(&first) else {
        return;
    };

    let (transport, mut outbound_rx) = ChannelTransport::new();
    if session.apps.register_connection(&package_name, &api_key, &session_id, transport.clone()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Binary(bytes)) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close { .. }) => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<AppInbound>(&text) {
                            Ok(decoded) => session.route_app_message(&package_name, decoded).await,
                            Err(e) => debug!(err = %e, package = %package_name, "failed to decode app message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    transport.mark_closed();
    session.apps.on_transport_closed(&package_name).await;
}
