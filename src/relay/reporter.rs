//! Reporter - the driver's connection to the relay

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::common::{Error, Result};
use crate::types::{JsonMap, Step, StepResult};

use super::protocol::{self, Message, Role};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `end` waits for the relay to finish the close handshake
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Emits run events to the relay as the `reporter` role
pub struct Reporter {
    socket: Socket,
    url: String,
    ended: bool,
}

impl Reporter {
    /// Connect and perform the init handshake
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::RelayConnection(format!("failed to connect to {}: {}", url, e)))?;

        let mut reporter = Self {
            socket,
            url: url.to_string(),
            ended: false,
        };
        reporter
            .send(&Message::Init {
                client: Role::Reporter,
            })
            .await?;
        tracing::debug!(url, "Reporter connected");
        Ok(reporter)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        if self.ended {
            return Err(Error::RelayConnection("reporter already ended".to_string()));
        }
        let text = message.to_text()?;
        self.socket
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| Error::RelayConnection(e.to_string()))
    }

    /// Announce the run with the loaded model payloads
    pub async fn start(&mut self, models: Vec<Value>, message: Option<String>) -> Result<()> {
        self.send(&Message::Start {
            models: Some(models),
            message,
        })
        .await
    }

    /// Wait for the relay's start acknowledgment
    ///
    /// Returns `false` when nothing arrived within `timeout`. Frames other
    /// than the acknowledgment are skipped.
    pub async fn await_ack(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.socket.next()).await {
                Err(_) => return Ok(false),
                Ok(frame) => frame,
            };

            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if protocol::message_type(&text).as_deref() == Some("start") {
                        return Ok(true);
                    }
                    tracing::debug!("Ignoring relay message while waiting for viewer: {}", text);
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return Err(Error::RelayConnection(match frame {
                        Some(frame) => format!("relay closed the connection: {}", frame.reason),
                        None => "relay closed the connection".to_string(),
                    }))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::RelayConnection(e.to_string())),
                None => return Err(Error::RelayConnection("relay closed the connection".to_string())),
            }
        }
    }

    pub async fn step_start(&mut self, step: &Step) -> Result<()> {
        self.send(&Message::StepStart { step: step.clone() }).await
    }

    /// Report a finished step; the output is stamped with time and step name
    pub async fn step_end(&mut self, step: &Step, mut result: StepResult) -> Result<()> {
        result.id = step.id.clone();
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.6f")
            .to_string();
        result.output = stamped_output(step, &result.output, &timestamp);
        self.send(&Message::StepEnd { result }).await
    }

    /// Send the final event and close the connection
    pub async fn end(&mut self, statistics: JsonMap, status: bool) -> Result<()> {
        self.send(&Message::End { statistics, status }).await?;
        self.ended = true;
        if let Err(e) = self.socket.close(None).await {
            tracing::debug!("Error closing reporter connection: {}", e);
        }

        // Frames the relay sent us must be read before the socket drops,
        // or the unread bytes turn the close into a reset and the relay
        // loses the tail of the run.
        let socket = &mut self.socket;
        let drained = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, async {
            while let Some(frame) = socket.next().await {
                match frame {
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!("Relay did not finish the close handshake in time");
        }
        Ok(())
    }

    /// Report a failure outside of the step stream
    pub async fn error(
        &mut self,
        step: Option<&Step>,
        message: impl Into<String>,
        trace: Option<String>,
    ) -> Result<()> {
        self.send(&Message::Error {
            step: step.cloned(),
            message: message.into(),
            trace,
        })
        .await
    }
}

fn stamped_output(step: &Step, output: &str, timestamp: &str) -> String {
    match &step.model_name {
        Some(model) => format!("[{}] {}.{}:\n{}", timestamp, model, step.name, output),
        None => format!("[{}] {}\n{}", timestamp, step.name, output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamped_output_with_model() {
        let mut step = Step::named("e_login");
        step.model_name = Some("Login".to_string());
        assert_eq!(
            stamped_output(&step, "logged in", "2024-01-01 10:00:00.000000"),
            "[2024-01-01 10:00:00.000000] Login.e_login:\nlogged in"
        );
    }

    #[test]
    fn test_stamped_output_without_model() {
        let step = Step::named("v_start");
        assert_eq!(stamped_output(&step, "", "ts"), "[ts] v_start\n");
    }

    #[tokio::test]
    async fn test_connect_failure_is_relay_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Reporter::connect(&format!("ws://127.0.0.1:{}", port))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::RelayConnection(_)));
    }
}
