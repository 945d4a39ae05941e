//! skywatch-core: shared wire and data model for the skywatch telemetry
//! session client.
//!
//! Provides the JSON envelope codec (with the legacy event-type alias shim),
//! the canonical contact model and its normalization rules, the command/ack
//! wire types, and the crate-wide error type.

pub mod command;
pub mod contact;
pub mod envelope;
pub mod error;

// Re-export commonly used items at crate root.
pub use command::CommandAck;
pub use contact::{
    Contact, ContactClass, ContactDetail, Coordinates, FpvLinkDetail, LockState, RemoteIdDetail,
    Severity, UnknownRfDetail,
};
pub use envelope::{epoch_ms, Envelope, EventType, Source};
pub use error::{TelemetryError, TelemetryResult};
