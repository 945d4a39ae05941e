//! WebSocket connection manager.
//!
//! Owns one connection to the backend's telemetry endpoint and drives the
//! reconnect state machine: on any close or error the session task emits
//! `disconnected` and schedules another attempt with exponential backoff,
//! until the bounded attempt budget runs out and `max_reconnect_reached`
//! fires as a terminal state.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use skywatch_core::Envelope;

use crate::dispatch::{EventDispatcher, Lifecycle};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Reconnect backoff: `delay(n) = base * multiplier^(n-1)` for attempt n,
/// bounded by `max_attempts`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5_000),
            multiplier: 1.5,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .mul_f64(self.multiplier.powi(attempt.saturating_sub(1) as i32))
    }
}

/// Owns the transport; explicitly constructed so several instances can
/// coexist (there is deliberately no process-wide singleton).
pub struct ConnectionManager {
    url: String,
    policy: ReconnectPolicy,
    dispatcher: Arc<EventDispatcher>,
    sink: Arc<Mutex<Option<WsSink>>>,
    link_tx: watch::Sender<bool>,
    link_rx: watch::Receiver<bool>,
    runner: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(url: &str, policy: ReconnectPolicy, dispatcher: Arc<EventDispatcher>) -> Self {
        let (link_tx, link_rx) = watch::channel(false);
        Self {
            url: url.to_string(),
            policy,
            dispatcher,
            sink: Arc::new(Mutex::new(None)),
            link_tx,
            link_rx,
            runner: std::sync::Mutex::new(None),
        }
    }

    /// Start (or restart) the session task. Idempotent while the link is up:
    /// a second call is a logged no-op. While the link is down this acts as a
    /// manual reconnect with a fresh attempt budget.
    pub fn connect(self: &Arc<Self>) {
        if self.is_connected() {
            tracing::info!("already connected");
            return;
        }

        let mut runner = self.runner.lock().unwrap();
        if let Some(old) = runner.take() {
            old.abort();
        }

        let this = self.clone();
        *runner = Some(tokio::spawn(async move {
            this.run().await;
        }));
    }

    /// Close the transport and cancel any pending reconnect. In-flight
    /// command futures are not cancelled; they resolve via their own timeout.
    pub async fn disconnect(&self) {
        let handle = self.runner.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }

        if let Some(mut ws) = self.sink.lock().await.take() {
            let _ = ws.send(Message::Close(None)).await;
        }

        let was_up = self.link_tx.send_replace(false);
        if was_up {
            self.dispatcher.emit_lifecycle(Lifecycle::Disconnected);
        }
        tracing::info!("disconnected");
    }

    /// Send one envelope. When the transport is down this logs and drops;
    /// callers must not assume delivery.
    pub async fn send(&self, envelope: &Envelope) {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(ws) => {
                if let Err(e) = ws.send(Message::Text(envelope.to_frame())).await {
                    tracing::warn!(error = %e, "websocket send failed");
                }
            }
            None => {
                tracing::warn!(
                    event = envelope.event.as_str(),
                    "send while disconnected, dropping"
                );
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.link_rx.borrow()
    }

    /// Reactive view of the link state, for the snapshot poller.
    pub fn link_state(&self) -> watch::Receiver<bool> {
        self.link_rx.clone()
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Connect / read / reconnect loop. Runs until aborted or the attempt
    /// budget is exhausted.
    async fn run(&self) {
        let mut attempt: u32 = 0;
        loop {
            match connect_async(&self.url).await {
                Ok((ws, _response)) => {
                    tracing::info!(url = %self.url, "websocket connected");
                    attempt = 0;

                    let (tx, rx) = ws.split();
                    *self.sink.lock().await = Some(tx);
                    let _ = self.link_tx.send(true);
                    self.dispatcher.emit_lifecycle(Lifecycle::Connected);

                    self.read_loop(rx).await;

                    *self.sink.lock().await = None;
                    let _ = self.link_tx.send(false);
                    self.dispatcher.emit_lifecycle(Lifecycle::Disconnected);
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "websocket connect failed");
                }
            }

            attempt += 1;
            if attempt > self.policy.max_attempts {
                tracing::error!(
                    attempts = self.policy.max_attempts,
                    "max reconnect attempts reached, giving up"
                );
                self.dispatcher.emit_lifecycle(Lifecycle::MaxReconnectReached);
                break;
            }

            let delay = self.policy.delay(attempt);
            tracing::info!(
                attempt,
                max = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Drain incoming frames until the connection closes or errors.
    async fn read_loop(&self, mut rx: WsStream) {
        while let Some(message) = rx.next().await {
            match message {
                Ok(Message::Text(text)) => handle_frame(&self.dispatcher, &text),
                Ok(Message::Ping(payload)) => {
                    let mut sink = self.sink.lock().await;
                    if let Some(ws) = sink.as_mut() {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                }
                Ok(Message::Close(_)) => {
                    tracing::debug!("close frame received");
                    break;
                }
                Ok(_) => {} // binary frames and pongs are not part of this protocol
                Err(e) => {
                    tracing::warn!(error = %e, "websocket read error");
                    break;
                }
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.runner.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Parse one raw text frame and fan it out. A malformed frame is dropped
/// whole at this boundary -- logged, never dispatched, never fatal.
pub(crate) fn handle_frame(dispatcher: &EventDispatcher, raw: &str) {
    match Envelope::parse(raw) {
        Ok(envelope) => dispatcher.emit_event(&envelope),
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed frame");
        }
    }
}
