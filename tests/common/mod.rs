//! Shared helpers for the integration tests
//!
//! Runs use the `mock_engine` binary in place of the real engine and a relay
//! bound to an ephemeral port.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use walker::common::config::Config;
use walker::relay::{Broker, RelayServer};

/// How long a test waits for any single relay frame
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(20);

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Configuration that launches the mock engine on `port`
pub fn mock_engine_config(port: u16) -> Config {
    let mut config = Config::default();
    config.engine.program = PathBuf::from(env!("CARGO_BIN_EXE_mock_engine"));
    config.engine.jar = None;
    config.engine.port = port;
    config.engine.max_port_attempts = 5;
    config.timeouts.engine_ready_secs = 10;
    config.timeouts.engine_request_secs = 5;
    config.timeouts.viewer_ack_secs = 1;
    config.timeouts.viewer_ack_attempts = 15;
    config
}

/// Find `count` consecutive free ports and return the first
pub fn free_port_range(count: u16) -> u16 {
    for _ in 0..50 {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind probe port");
        let base = probe.local_addr().expect("probe addr").port();
        drop(probe);

        if base.checked_add(count).is_none() {
            continue;
        }
        let all_free = (base..base + count).all(|port| TcpListener::bind(("127.0.0.1", port)).is_ok());
        if all_free {
            return base;
        }
    }
    panic!("no range of {} free ports found", count);
}

/// Whether a process with this pid still exists
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// A relay server running in the background
pub struct TestRelay {
    pub url: String,
    pub broker: Arc<Broker>,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let server = RelayServer::bind("127.0.0.1:0").await.expect("bind relay");
        let url = format!("ws://{}", server.local_addr().expect("relay addr"));
        let broker = server.broker();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(server.serve(async move {
            let _ = stopped.await;
        }));
        Self {
            url,
            broker,
            stop: Some(stop),
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Raw websocket client speaking the relay protocol
pub struct TestClient {
    socket: Socket,
}

impl TestClient {
    /// Connect without sending anything
    pub async fn connect_raw(url: &str) -> Self {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("connect to relay");
        Self { socket }
    }

    /// Connect and register as a viewer
    pub async fn viewer(url: &str) -> Self {
        let mut client = Self::connect_raw(url).await;
        client.send(json!({"type": "init", "client": "viewer"})).await;
        client
    }

    pub async fn send(&mut self, value: Value) {
        self.socket
            .send(Message::Text(value.to_string()))
            .await
            .expect("send frame");
    }

    /// Next JSON frame; `None` once the connection is closed
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(FRAME_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for a relay frame")?;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).expect("frame is JSON"))
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Close code of the next close frame, skipping anything before it
    pub async fn close_code(&mut self) -> Option<u16> {
        loop {
            let frame = tokio::time::timeout(FRAME_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for close")?;
            match frame {
                Ok(Message::Close(Some(frame))) => return Some(frame.code.into()),
                Ok(Message::Close(None)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Frames up to and including the `end` event
    pub async fn recv_until_end(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv().await {
            let is_end = frame["type"] == "end";
            frames.push(frame);
            if is_end {
                break;
            }
        }
        frames
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

/// Frames of one type, in order
pub fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
    frames.iter().filter(|frame| frame["type"] == kind).collect()
}
