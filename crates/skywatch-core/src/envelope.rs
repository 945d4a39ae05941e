//! Wire envelope for the telemetry stream.
//!
//! Every frame is one UTF-8 JSON object: `{type, timestamp, source, data}`.
//! A frame missing any of the four fields (or carrying the wrong primitive
//! type) is rejected whole at this boundary -- no partial event is ever
//! dispatched.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::error::{TelemetryError, TelemetryResult};

/// Milliseconds since the Unix epoch, producer-clock convention of the wire.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Event type carried in the envelope `type` field.
///
/// Unknown-but-well-formed types are tolerated (`Unknown`) so a newer
/// producer does not break older clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    TelemetryUpdate,
    ContactNew,
    ContactUpdate,
    ContactLost,
    ReplayState,
    NetworkUpdate,
    AlertNew,
    AlertUpdate,
    LogEvent,
    CommandAck,
    Command,
    Unknown(String),
}

impl EventType {
    /// Parse a wire `type` string, applying the legacy alias rewrite.
    ///
    /// An older producer emitted `RID_CONTACT_*` where the contract says
    /// `CONTACT_*`; the rewrite happens exactly once, here, before any
    /// subscriber can observe the event.
    pub fn parse(raw: &str) -> Self {
        let name = match raw.strip_prefix("RID_CONTACT_") {
            Some(suffix) => {
                tracing::warn!(from = raw, "legacy RID_CONTACT_* event, remapping");
                format!("CONTACT_{suffix}")
            }
            None => raw.to_string(),
        };

        match name.as_str() {
            "TELEMETRY_UPDATE" => Self::TelemetryUpdate,
            "CONTACT_NEW" => Self::ContactNew,
            "CONTACT_UPDATE" => Self::ContactUpdate,
            "CONTACT_LOST" => Self::ContactLost,
            "REPLAY_STATE" => Self::ReplayState,
            "NETWORK_UPDATE" => Self::NetworkUpdate,
            "ALERT_NEW" => Self::AlertNew,
            "ALERT_UPDATE" => Self::AlertUpdate,
            "LOG_EVENT" => Self::LogEvent,
            "COMMAND_ACK" => Self::CommandAck,
            "COMMAND" => Self::Command,
            _ => Self::Unknown(name),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::TelemetryUpdate => "TELEMETRY_UPDATE",
            Self::ContactNew => "CONTACT_NEW",
            Self::ContactUpdate => "CONTACT_UPDATE",
            Self::ContactLost => "CONTACT_LOST",
            Self::ReplayState => "REPLAY_STATE",
            Self::NetworkUpdate => "NETWORK_UPDATE",
            Self::AlertNew => "ALERT_NEW",
            Self::AlertUpdate => "ALERT_UPDATE",
            Self::LogEvent => "LOG_EVENT",
            Self::CommandAck => "COMMAND_ACK",
            Self::Command => "COMMAND",
            Self::Unknown(s) => s,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

/// Origin of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Live,
    Replay,
    Backend,
    Ui,
}

impl Source {
    /// Lenient parse matching the backend's spellings. The replay pipeline
    /// has emitted `ek_replay` and `raw_replay`; anything unrecognized is
    /// treated as live rather than dropped.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "replay" | "ek_replay" | "raw_replay" => Self::Replay,
            "backend" => Self::Backend,
            "ui" => Self::Ui,
            _ => Self::Live,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Live => "live",
            Self::Replay => "replay",
            Self::Backend => "backend",
            Self::Ui => "ui",
        }
    }
}

/// The parsed wire envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event: EventType,
    /// Milliseconds since epoch, producer clock.
    pub timestamp: u64,
    pub source: Source,
    pub data: Value,
}

impl Envelope {
    /// Parse and validate one raw text frame.
    ///
    /// Validation is structural only: `type` must be a string, `timestamp` a
    /// number, `source` a string, and the `data` key must exist (its value
    /// may be anything, including null). Any violation rejects the frame.
    pub fn parse(raw: &str) -> TelemetryResult<Envelope> {
        let value: Value = serde_json::from_str(raw)?;

        let obj = value
            .as_object()
            .ok_or_else(|| TelemetryError::InvalidEnvelope("frame is not an object".into()))?;

        let type_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TelemetryError::InvalidEnvelope("missing string `type`".into()))?;

        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_f64)
            .ok_or_else(|| TelemetryError::InvalidEnvelope("missing numeric `timestamp`".into()))?;

        let source_str = obj
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| TelemetryError::InvalidEnvelope("missing string `source`".into()))?;

        let data = obj
            .get("data")
            .cloned()
            .ok_or_else(|| TelemetryError::InvalidEnvelope("missing `data` key".into()))?;

        let event = EventType::parse(type_str);
        if !event.is_known() {
            // Forward-compat: pass through, a newer backend may know more.
            tracing::warn!(event = type_str, "unknown event type, dispatching anyway");
        }

        Ok(Envelope {
            event,
            timestamp: timestamp.max(0.0) as u64,
            source: Source::parse(source_str),
            data,
        })
    }

    /// Build an outbound command envelope. `args` fields are merged into the
    /// data object alongside `target`, `req_id` and `cmd`.
    pub fn command(target: &str, req_id: &str, cmd: &str, args: Value) -> Envelope {
        let mut data = Map::new();
        data.insert("target".into(), json!(target));
        data.insert("req_id".into(), json!(req_id));
        data.insert("cmd".into(), json!(cmd));
        if let Value::Object(extra) = args {
            for (k, v) in extra {
                data.insert(k, v);
            }
        }

        Envelope {
            event: EventType::Command,
            timestamp: epoch_ms(),
            source: Source::Ui,
            data: Value::Object(data),
        }
    }

    /// Synthesize an envelope for an event generated client-side (lifecycle
    /// notifications have no wire frame behind them).
    pub fn synthetic(name: &str, data: Value) -> Envelope {
        Envelope {
            event: EventType::parse(name),
            timestamp: epoch_ms(),
            source: Source::Backend,
            data,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "type": self.event.as_str(),
            "timestamp": self.timestamp,
            "source": self.source.as_str(),
            "data": self.data,
        })
    }

    /// Encode as one wire frame.
    pub fn to_frame(&self) -> String {
        self.to_json().to_string()
    }
}
