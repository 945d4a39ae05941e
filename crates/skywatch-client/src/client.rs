//! The root telemetry client.
//!
//! `TelemetryClient` composes the connection manager, event dispatcher,
//! command correlator, contact engine, status cache and snapshot poller
//! behind one explicitly constructed, explicitly torn-down object. There is
//! no process-wide instance; tests and embedders create as many as they
//! need.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use skywatch_core::{epoch_ms, CommandAck, Contact, Envelope, EventType};

use crate::command::{CommandCorrelator, DEFAULT_COMMAND_TIMEOUT};
use crate::connection::{ConnectionManager, ReconnectPolicy};
use crate::contacts::ContactStore;
use crate::dispatch::{EventDispatcher, Subscription, Topic};
use crate::snapshot::{SnapshotPoller, DEFAULT_POLL_INTERVAL};
use crate::status::StatusCache;

/// Sound asset the backend plays when a new airborne contact appears.
const DETECTION_ALARM: &str = "drone_detected_alarm";

/// Connection endpoints and tunables. URLs are injected here rather than
/// discovered ambiently.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ws_url: String,
    pub rest_base: String,
    pub reconnect: ReconnectPolicy,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8080/api/v1/ws".into(),
            rest_base: "http://127.0.0.1:8080".into(),
            reconnect: ReconnectPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

pub struct TelemetryClient {
    config: ClientConfig,
    dispatcher: Arc<EventDispatcher>,
    store: Arc<ContactStore>,
    status: Arc<StatusCache>,
    conn: Arc<ConnectionManager>,
    correlator: CommandCorrelator,
    internal_subs: Mutex<Vec<Subscription>>,
    poller: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TelemetryClient {
    pub fn new(config: ClientConfig) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new());
        let store = Arc::new(ContactStore::new());
        let status = Arc::new(StatusCache::new());
        let conn = Arc::new(ConnectionManager::new(
            &config.ws_url,
            config.reconnect.clone(),
            dispatcher.clone(),
        ));
        let correlator = CommandCorrelator::new(dispatcher.clone(), conn.clone());

        Self {
            config,
            dispatcher,
            store,
            status,
            conn,
            correlator,
            internal_subs: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
        }
    }

    /// Wire internal subscriptions, open the connection, and start the
    /// snapshot poller.
    pub fn init(&self) {
        self.wire();
        self.conn.connect();

        let poller = SnapshotPoller::new(
            &self.config.rest_base,
            self.store.clone(),
            self.status.clone(),
            self.config.poll_interval,
        );
        let handle = poller.spawn(self.conn.link_state());
        if let Some(old) = self.poller.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    /// Deterministic teardown: drop every internally registered handler,
    /// stop the poller, close the connection.
    pub async fn shutdown(&self) {
        for sub in self.internal_subs.lock().unwrap().drain(..) {
            self.dispatcher.off(sub);
        }
        if let Some(handle) = self.poller.lock().unwrap().take() {
            handle.abort();
        }
        self.conn.disconnect().await;
    }

    // ── Public surface ───────────────────────────────────────────────

    /// Subscribe to a wire event type or lifecycle notification.
    pub fn on<T, F>(&self, topic: T, handler: F) -> Subscription
    where
        T: Into<Topic>,
        F: Fn(&Value, &Envelope) + Send + Sync + 'static,
    {
        self.dispatcher.on(topic, handler)
    }

    pub fn off(&self, sub: Subscription) {
        self.dispatcher.off(sub)
    }

    /// Send a backend command and wait for its ack (or a synthetic failure
    /// ack on timeout/disconnect).
    pub async fn send_command(&self, cmd: &str, args: Value) -> CommandAck {
        self.correlator
            .send_command_to("backend", cmd, args, self.config.command_timeout)
            .await
    }

    /// Send a command to an explicit target with a custom timeout.
    pub async fn send_command_to(
        &self,
        target: &str,
        cmd: &str,
        args: Value,
        timeout: Duration,
    ) -> CommandAck {
        self.correlator
            .send_command_to(target, cmd, args, timeout)
            .await
    }

    /// Fire-and-forget command; returns the request id.
    pub async fn send_command_nowait(&self, target: &str, cmd: &str, args: Value) -> String {
        self.correlator.send_command_nowait(target, cmd, args).await
    }

    /// Most-recent-first snapshot of the tracked contacts.
    pub fn contacts(&self) -> Vec<Contact> {
        self.store.snapshot()
    }

    pub fn contact_count(&self) -> usize {
        self.store.len()
    }

    /// Latest merged device status.
    pub fn status(&self) -> Value {
        self.status.current()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Manual reconnect: tear the session down and start over with a fresh
    /// attempt budget (the recovery path after `max_reconnect_reached`).
    pub async fn reconnect(&self) {
        self.conn.disconnect().await;
        self.conn.connect();
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Route contact and telemetry events into the engines. These are
    /// ordinary subscriptions: UI consumers subscribed to the same events
    /// are independent and unordered relative to them.
    fn wire(&self) {
        let mut subs = self.internal_subs.lock().unwrap();
        if !subs.is_empty() {
            return; // init() called twice
        }

        {
            let store = self.store.clone();
            let conn = self.conn.clone();
            subs.push(self.dispatcher.on(EventType::ContactNew, move |data, env| {
                let outcome = store.apply_new(data, Some(env), epoch_ms());
                if outcome.alarm {
                    // Audible alert is a backend command; playback stays
                    // external to this client.
                    let envelope = Envelope::command(
                        "backend",
                        &Uuid::new_v4().to_string(),
                        "PLAY_SOUND",
                        json!({ "name": DETECTION_ALARM }),
                    );
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        conn.send(&envelope).await;
                    });
                }
            }));
        }

        {
            let store = self.store.clone();
            subs.push(
                self.dispatcher
                    .on(EventType::ContactUpdate, move |data, env| {
                        store.apply_update(data, Some(env), epoch_ms());
                    }),
            );
        }

        {
            let store = self.store.clone();
            subs.push(self.dispatcher.on(EventType::ContactLost, move |data, env| {
                store.apply_lost(data, Some(env), epoch_ms());
            }));
        }

        {
            let status = self.status.clone();
            subs.push(
                self.dispatcher
                    .on(EventType::TelemetryUpdate, move |data, _| {
                        status.merge_telemetry(data);
                    }),
            );
        }

        {
            let status = self.status.clone();
            subs.push(self.dispatcher.on(EventType::ReplayState, move |data, _| {
                status.merge_replay(data);
            }));
        }
    }
}

impl Drop for TelemetryClient {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.lock().unwrap().take() {
            handle.abort();
        }
    }
}
