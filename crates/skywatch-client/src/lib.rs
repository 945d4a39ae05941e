//! skywatch-client: async session client for the SkyWatch telemetry stream.
//!
//! Maintains a resilient WebSocket session to a detection device, decodes
//! envelope frames into typed events, correlates commands with their acks,
//! reconciles contact events into a bounded working set, and falls back to
//! REST status polling while the live link is down.
//!
//! # Quick Start
//!
//! ```no_run
//! use skywatch_client::{ClientConfig, TelemetryClient};
//! use skywatch_core::EventType;
//!
//! # async fn example() {
//! let client = TelemetryClient::new(ClientConfig {
//!     ws_url: "ws://device.local:8080/api/v1/ws".into(),
//!     rest_base: "http://device.local:8080".into(),
//!     ..Default::default()
//! });
//! client.init();
//!
//! let _sub = client.on(EventType::ContactNew, |data, _env| {
//!     println!("new contact: {}", data["id"]);
//! });
//!
//! let ack = client.send_command("TEST_BEEP", serde_json::json!({})).await;
//! println!("beep ok: {}", ack.ok);
//!
//! client.shutdown().await;
//! # }
//! ```

pub mod client;
pub mod command;
pub mod connection;
pub mod contacts;
pub mod dispatch;
pub mod snapshot;
pub mod status;

// Re-export primary public types.
pub use client::{ClientConfig, TelemetryClient};
pub use command::{CommandCorrelator, DEFAULT_COMMAND_TIMEOUT};
pub use connection::{ConnectionManager, ReconnectPolicy};
pub use contacts::{ApplyOutcome, ContactStore, DEFAULT_CONTACT_CAP};
pub use dispatch::{EventDispatcher, Lifecycle, Subscription, Topic};
pub use snapshot::{SnapshotPoller, StatusSnapshot, DEFAULT_POLL_INTERVAL};
pub use status::StatusCache;

// Re-export skywatch-core types for convenience.
pub use skywatch_core::{
    Contact, CommandAck, Envelope, EventType, Severity, Source, TelemetryError, TelemetryResult,
};
