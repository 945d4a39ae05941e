use thiserror::Error;

/// Errors produced by the telemetry protocol layer.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    NotConnected,

    #[error("snapshot fetch error: {0}")]
    Snapshot(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TelemetryError {
    fn from(e: serde_json::Error) -> Self {
        TelemetryError::Codec(e.to_string())
    }
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
