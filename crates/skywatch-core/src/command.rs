//! Command acknowledgment wire type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `data` payload of a `COMMAND_ACK` event, correlated to a previously
/// sent command by `req_id`. Device-specific response fields ride along in
/// `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub req_id: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub err: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandAck {
    /// Synthetic failure ack for a command whose acknowledgment never came.
    pub fn timeout(req_id: &str, cmd: &str) -> Self {
        Self::failure(Some(req_id), cmd, "timeout")
    }

    /// Synthetic failure ack for a command issued while the link is down.
    pub fn disconnected(cmd: &str) -> Self {
        Self::failure(None, cmd, "ws_disconnected")
    }

    fn failure(req_id: Option<&str>, cmd: &str, err: &str) -> Self {
        Self {
            ok: false,
            req_id: req_id.map(str::to_string),
            cmd: Some(cmd.to_string()),
            err: Some(err.to_string()),
            extra: Map::new(),
        }
    }
}
