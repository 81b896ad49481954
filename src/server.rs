//! Chat server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/ws/chat` | Websocket chat: one JSON event per text frame |
//!
//! Every outbound message is one JSON text frame. Events of one connection
//! are handled in arrival order by a per-connection worker task while the
//! connection loop keeps forwarding replies as they are produced.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser client
//! served from another origin can connect.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use vizchat_core::messages::OutboundMessage;

use crate::config::Config;
use crate::orchestrator::{ChannelSink, Orchestrator};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

/// Build the router with CORS and shared state.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ws/chat", get(handle_chat))
        .layer(cors)
        .with_state(AppState { orchestrator })
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config, orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(orchestrator);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "chat server listening on ws://{}/ws/chat", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /ws/chat ============

async fn handle_chat(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| chat_connection(socket, state.orchestrator))
}

async fn chat_connection(mut socket: WebSocket, orchestrator: Arc<Orchestrator>) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let worker = tokio::spawn(async move {
        let sink = ChannelSink(reply_tx);
        while let Some(text) = event_rx.recv().await {
            orchestrator.handle_raw(&text, &sink).await;
        }
    });

    info!("chat connection opened");
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if event_tx.send(text.as_str().to_string()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
            Some(reply) = reply_rx.recv() => {
                let text = match serde_json::to_string(&reply) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode reply");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // the worker finishes the event in progress, then sees the closed channel
    drop(event_tx);
    if let Err(e) = worker.await {
        warn!(error = %e, "chat worker failed");
    }
    info!("chat connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use vizchat_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn health_reports_version() {
        let Json(body) = handle_health().await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn router_builds() {
        let orchestrator = Orchestrator::new(
            &Config::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(crate::llm::DisabledClient),
        );
        let _app: Router = router(Arc::new(orchestrator));
    }
}
