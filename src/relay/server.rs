//! Relay server - websocket listener feeding the broker

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::common::{Error, Result};

use super::broker::{Broker, Outbound};
use super::protocol::{self, Role, POLICY_VIOLATION};

/// Relay server bound to a local address
pub struct RelayServer {
    listener: TcpListener,
    broker: Arc<Broker>,
}

impl RelayServer {
    /// Bind the listener with a fresh broker; port 0 picks a free port
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with(addr, Arc::new(Broker::new())).await
    }

    /// Bind the listener around an existing broker
    pub async fn bind_with(addr: &str, broker: Arc<Broker>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::RelayConnection(format!("failed to bind {}: {}", addr, e)))?;
        Ok(Self { listener, broker })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    /// Serve until `shutdown` resolves, then close both slots
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "Relay listening");

        let broker = self.broker.clone();
        axum::serve(self.listener, router(self.broker))
            .with_graceful_shutdown(shutdown)
            .await?;

        broker.disconnect(Role::Reporter).await;
        broker.disconnect(Role::Viewer).await;
        tracing::info!(%addr, "Relay stopped");
        Ok(())
    }
}

/// Routes served by the relay
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/versionz", get(versionz))
        .with_state(broker)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn versionz(State(broker): State<Arc<Broker>>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "reporter_connected": broker.is_reporter_connected().await,
        "viewer_connected": broker.is_viewer_connected().await,
    }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, broker))
}

/// Wait for the first text frame; `None` when the peer leaves first
async fn first_text(stream: &mut SplitStream<WebSocket>) -> Option<Result<String>> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => return Some(Ok(text)),
            Ok(WsMessage::Binary(_)) => {
                return Some(Err(Error::ProtocolViolation(
                    "binary frames are not supported".to_string(),
                )))
            }
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("Connection failed before init: {}", e);
                return None;
            }
        }
    }
    None
}

async fn handle_connection(socket: WebSocket, broker: Arc<Broker>) {
    let (mut sink, mut stream) = socket.split();

    let role = match first_text(&mut stream).await {
        None => return,
        Some(Ok(text)) => protocol::parse_init(&text),
        Some(Err(e)) => Err(e),
    };

    let attached = match role {
        Ok(role) => broker.attach(role).await.map(|(id, rx)| (role, id, rx)),
        Err(e) => Err(e),
    };

    let (role, id, mut outbox) = match attached {
        Ok(attached) => attached,
        Err(e) => {
            tracing::warn!("Rejecting connection: {}", e);
            let close = CloseFrame {
                code: POLICY_VIOLATION,
                reason: e.to_string().into(),
            };
            let _ = sink.send(WsMessage::Close(Some(close))).await;
            return;
        }
    };

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        tracing::debug!(%role, "Send failed: {}", e);
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let close = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sink.send(WsMessage::Close(Some(close))).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match role {
                    Role::Reporter => broker.forward_from_reporter(text).await,
                    Role::Viewer => broker.forward_from_viewer(text).await,
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%role, "Receive failed: {}", e);
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    broker.detach(role, id).await;
    writer.abort();
}
