//! Relay wire protocol
//!
//! Every frame is a JSON text message with a `type` field. The first frame
//! of a connection must be `init`; later frames are opaque to the broker
//! except that reporter `start` frames are buffered for late viewers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{Error, Result};
use crate::types::{JsonMap, Step, StepResult};

/// Websocket close code for policy violations
pub const POLICY_VIOLATION: u16 = 1008;

/// Which slot a connection occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reporter,
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reporter => write!(f, "reporter"),
            Self::Viewer => write!(f, "viewer"),
        }
    }
}

/// Messages exchanged over the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Handshake; must be the first frame
    Init { client: Role },

    /// Run start from the reporter, or the broker's acknowledgment when empty
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        models: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    StepStart { step: Step },

    StepEnd { result: StepResult },

    End { statistics: JsonMap, status: bool },

    /// Out-of-band failure report
    Error {
        step: Option<Step>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
}

impl Message {
    /// The acknowledgment the broker sends a reporter once a viewer is present
    pub fn start_ack() -> Self {
        Self::Start {
            models: None,
            message: None,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Read the `type` field of a frame without validating the rest
pub fn message_type(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

/// Parse the mandatory first frame and return the requested role
pub fn parse_init(text: &str) -> Result<Role> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::ProtocolViolation(format!("init frame is not JSON: {}", e)))?;

    if value.get("type").and_then(Value::as_str) != Some("init") {
        return Err(Error::ProtocolViolation(
            "first message must be of type 'init'".to_string(),
        ));
    }

    match value.get("client").and_then(Value::as_str) {
        Some("reporter") => Ok(Role::Reporter),
        Some("viewer") => Ok(Role::Viewer),
        Some(other) => Err(Error::ProtocolViolation(format!(
            "unknown client '{}'",
            other
        ))),
        None => Err(Error::ProtocolViolation(
            "init message has no client".to_string(),
        )),
    }
}
