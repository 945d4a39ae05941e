//! Command/acknowledgment correlation.
//!
//! Outbound commands are tagged with a fresh request id; a one-shot
//! subscription on `COMMAND_ACK` resolves the caller's future when the
//! matching ack arrives, and a timer resolves it with a synthetic failure
//! ack otherwise. Exactly one of the two fires: resolution goes through a
//! consuming `Option` feeding a oneshot channel, so a double resolve is
//! unrepresentable rather than guarded by a flag.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use skywatch_core::{CommandAck, Envelope, EventType};

use crate::connection::ConnectionManager;
use crate::dispatch::{EventDispatcher, Subscription};

/// Default ack deadline, matching the backend's command turnaround budget.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1_500);

pub struct CommandCorrelator {
    dispatcher: Arc<EventDispatcher>,
    conn: Arc<ConnectionManager>,
}

impl CommandCorrelator {
    pub fn new(dispatcher: Arc<EventDispatcher>, conn: Arc<ConnectionManager>) -> Self {
        Self { dispatcher, conn }
    }

    /// Send a command to the backend and wait for its ack.
    pub async fn send_command(&self, cmd: &str, args: Value) -> CommandAck {
        self.send_command_to("backend", cmd, args, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    /// Send a command to an explicit target (`backend` or `esp32`) with a
    /// custom timeout. Never fails: a missed deadline or a down link yields
    /// a failure-flagged ack instead.
    pub async fn send_command_to(
        &self,
        target: &str,
        cmd: &str,
        args: Value,
        timeout: Duration,
    ) -> CommandAck {
        if !self.conn.is_connected() {
            // Short-circuit without touching the network or the timer.
            tracing::warn!(cmd, "command while disconnected");
            return CommandAck::disconnected(cmd);
        }

        let req_id = Uuid::new_v4().to_string();
        let waiter = AckWaiter::register(&self.dispatcher, &req_id, cmd);
        let envelope = Envelope::command(target, &req_id, cmd, args);
        tracing::debug!(cmd, req_id = %req_id, target, "sending command");
        self.conn.send(&envelope).await;
        waiter.resolve(&self.dispatcher, timeout).await
    }

    /// Fire-and-forget: tag a request id and send without waiting for an
    /// ack. Returns the id so a caller may correlate on its own.
    pub async fn send_command_nowait(&self, target: &str, cmd: &str, args: Value) -> String {
        let req_id = Uuid::new_v4().to_string();
        let envelope = Envelope::command(target, &req_id, cmd, args);
        self.conn.send(&envelope).await;
        req_id
    }
}

/// A registered one-shot wait for a `COMMAND_ACK` with a specific `req_id`.
pub(crate) struct AckWaiter {
    sub: Subscription,
    rx: oneshot::Receiver<CommandAck>,
    req_id: String,
    cmd: String,
}

impl AckWaiter {
    /// Subscribe before the command goes out, so an ack racing the send
    /// cannot be missed.
    pub(crate) fn register(dispatcher: &EventDispatcher, req_id: &str, cmd: &str) -> Self {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let want = req_id.to_string();

        let sub = dispatcher.on(EventType::CommandAck, move |data, _env| {
            if data.get("req_id").and_then(Value::as_str) != Some(want.as_str()) {
                return;
            }
            if let Some(tx) = slot.lock().unwrap().take() {
                let ack =
                    serde_json::from_value::<CommandAck>(data.clone()).unwrap_or_else(|_| {
                        CommandAck {
                            ok: false,
                            req_id: Some(want.clone()),
                            cmd: None,
                            err: Some("bad_ack".into()),
                            extra: serde_json::Map::new(),
                        }
                    });
                let _ = tx.send(ack);
            }
        });

        Self {
            sub,
            rx,
            req_id: req_id.to_string(),
            cmd: cmd.to_string(),
        }
    }

    /// Wait for the ack or the deadline, whichever comes first, then drop
    /// the subscription.
    pub(crate) async fn resolve(self, dispatcher: &EventDispatcher, timeout: Duration) -> CommandAck {
        let ack = match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(cmd = %self.cmd, req_id = %self.req_id, "command ack timed out");
                CommandAck::timeout(&self.req_id, &self.cmd)
            }
        };
        dispatcher.off(self.sub);
        ack
    }
}
