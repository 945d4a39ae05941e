//! REST snapshot poller.
//!
//! Fallback path for when the live stream is down: fetches
//! `GET /api/v1/status` once at startup, then every poll interval while the
//! link is down, stopping the instant the link comes back. A snapshot is a
//! supplement, never a reset: only a non-empty contacts array hydrates the
//! working set.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::watch;

use skywatch_core::{epoch_ms, TelemetryError, TelemetryResult};

use crate::contacts::ContactStore;
use crate::status::StatusCache;

/// Poll cadence while the live connection is down.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The `GET /api/v1/status` response. Sections stay loosely typed; this
/// client only inspects the contacts array and caches the rest for
/// consumers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub gps: Option<Value>,
    #[serde(default)]
    pub esp32: Option<Value>,
    #[serde(default)]
    pub remote_id: Option<Value>,
    #[serde(default)]
    pub fpv: Option<Value>,
    #[serde(default)]
    pub settings: Option<Value>,
    #[serde(default)]
    pub replay: Option<Value>,
    #[serde(default)]
    pub contacts: Option<Vec<Value>>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusSnapshot {
    /// Contacts ride at the top level, or under `remote_id.contacts` on
    /// older backends.
    pub fn contact_batch(&self) -> Vec<Value> {
        if let Some(contacts) = &self.contacts {
            if !contacts.is_empty() {
                return contacts.clone();
            }
        }
        self.remote_id
            .as_ref()
            .and_then(|rid| rid.get("contacts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct SnapshotPoller {
    http: reqwest::Client,
    endpoint: String,
    store: Arc<ContactStore>,
    status: Arc<StatusCache>,
    interval: Duration,
}

impl SnapshotPoller {
    pub fn new(
        rest_base: &str,
        store: Arc<ContactStore>,
        status: Arc<StatusCache>,
        interval: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/api/v1/status", rest_base.trim_end_matches('/')),
            store,
            status,
            interval,
        }
    }

    /// Run the poll loop until the link-state channel closes or the task is
    /// aborted. An in-flight fetch at teardown simply completes into a
    /// discarded result.
    pub fn spawn(self, mut link: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // Startup baseline, regardless of link state.
            self.fetch_once().await;

            loop {
                if *link.borrow() {
                    // Live feed is up: no polling until the link drops.
                    if link.changed().await.is_err() {
                        break;
                    }
                    continue;
                }

                tokio::select! {
                    changed = link.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *link.borrow() {
                            // Reconcile once right after reconnect.
                            self.fetch_once().await;
                        }
                    }
                    _ = tokio::time::sleep(self.interval) => {
                        self.fetch_once().await;
                    }
                }
            }
            tracing::debug!("snapshot poller ended");
        })
    }

    /// One fetch attempt. Failures are logged and swallowed; the next tick
    /// is the retry path (no backoff on REST, unlike the WebSocket).
    pub async fn fetch_once(&self) {
        match self.try_fetch().await {
            Ok(hydrated) => {
                tracing::debug!(hydrated, "status snapshot applied");
            }
            Err(e) => {
                tracing::warn!(error = %e, "status snapshot fetch failed");
            }
        }
    }

    async fn try_fetch(&self) -> TelemetryResult<usize> {
        let response = self
            .http
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| TelemetryError::Snapshot(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TelemetryError::Snapshot(format!(
                "http {}",
                response.status()
            )));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| TelemetryError::Snapshot(e.to_string()))?;

        self.status.set_snapshot(raw.clone());

        let snapshot: StatusSnapshot = serde_json::from_value(raw).unwrap_or_default();
        let batch = snapshot.contact_batch();
        if batch.is_empty() {
            // An empty or absent array never wipes the tracked contacts.
            return Ok(0);
        }
        Ok(self.store.hydrate(&batch, epoch_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn snapshot_parses_with_loose_sections() {
        let snap: StatusSnapshot = serde_json::from_value(json!({
            "system": {"cpu_temp_celsius": 51.0},
            "gps": {"mode": 3, "hdop": 0.9},
            "remote_id": {"status": "ok"},
            "timestamp": 1_700_000_000_000u64,
            "battery": {"level": 80}
        }))
        .unwrap();
        assert!(snap.system.is_some());
        assert_eq!(snap.timestamp, Some(1_700_000_000_000));
        assert_eq!(snap.extra["battery"]["level"], 80);
        assert!(snap.contact_batch().is_empty());
    }

    #[test]
    fn contact_batch_falls_back_to_remote_id_section() {
        let snap: StatusSnapshot = serde_json::from_value(json!({
            "remote_id": {"contacts": [{"id": "rid-1"}]}
        }))
        .unwrap();
        assert_eq!(snap.contact_batch().len(), 1);

        let snap: StatusSnapshot = serde_json::from_value(json!({
            "contacts": [{"id": "rid-2"}],
            "remote_id": {"contacts": [{"id": "rid-1"}]}
        }))
        .unwrap();
        assert_eq!(snap.contact_batch()[0]["id"], "rid-2");
    }

    /// Serve canned HTTP responses for a fixed number of requests.
    async fn serve_status(listener: TcpListener, body: String, requests: usize) {
        for _ in 0..requests {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 4096];
            // Read the request; a GET has no body worth waiting for.
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    }

    #[tokio::test]
    async fn startup_fetch_hydrates_nonempty_snapshots() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = json!({
            "system": {},
            "contacts": [{"id": "snap-1", "type": "REMOTE_ID", "remote_id": {}}]
        })
        .to_string();
        tokio::spawn(serve_status(listener, body, 1));

        let store = Arc::new(ContactStore::new());
        let status = Arc::new(StatusCache::new());
        let poller = SnapshotPoller::new(
            &format!("http://{addr}"),
            store.clone(),
            status.clone(),
            DEFAULT_POLL_INTERVAL,
        );

        poller.fetch_once().await;
        assert_eq!(store.len(), 1);
        assert!(store.get("snap-1").is_some());
        assert!(status.current().get("system").is_some());
    }

    #[tokio::test]
    async fn empty_snapshot_does_not_wipe_contacts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = json!({"system": {}, "contacts": []}).to_string();
        tokio::spawn(serve_status(listener, body, 1));

        let store = Arc::new(ContactStore::new());
        store.apply_new(
            &json!({"id": "live-1", "type": "REMOTE_ID", "remote_id": {}}),
            None,
            1_000,
        );
        let status = Arc::new(StatusCache::new());
        let poller = SnapshotPoller::new(
            &format!("http://{addr}"),
            store.clone(),
            status,
            DEFAULT_POLL_INTERVAL,
        );

        poller.fetch_once().await;
        assert_eq!(store.len(), 1, "supplement, never a reset");
    }

    #[tokio::test]
    async fn fetch_failure_is_swallowed() {
        let store = Arc::new(ContactStore::new());
        let status = Arc::new(StatusCache::new());
        // Nothing listens here; must log and move on, not panic or error.
        let poller = SnapshotPoller::new(
            "http://127.0.0.1:1",
            store.clone(),
            status,
            DEFAULT_POLL_INTERVAL,
        );
        poller.fetch_once().await;
        assert!(store.is_empty());
    }

    /// Serve canned HTTP responses until the listener is dropped, counting
    /// every request served.
    async fn serve_status_counted(
        listener: TcpListener,
        body: String,
        hits: Arc<std::sync::atomic::AtomicUsize>,
    ) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn down_link_polls_on_the_interval_until_the_link_comes_up() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve_status_counted(
            listener,
            json!({"system": {}}).to_string(),
            hits.clone(),
        ));

        let store = Arc::new(ContactStore::new());
        let status = Arc::new(StatusCache::new());
        let poller = SnapshotPoller::new(
            &format!("http://{addr}"),
            store,
            status,
            Duration::from_millis(50),
        );

        let (link_tx, link_rx) = watch::channel(false);
        let handle = poller.spawn(link_rx);

        // Link down: the startup fetch plus repeated interval polls.
        tokio::time::sleep(Duration::from_millis(320)).await;
        let while_down = hits.load(Ordering::SeqCst);
        assert!(while_down >= 3, "expected repeated polls, got {while_down}");

        // Link up: one reconcile fetch is allowed, then polling stops.
        link_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let after_up = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(320)).await;
        assert_eq!(
            hits.load(Ordering::SeqCst),
            after_up,
            "no polls while the link is up"
        );

        // Link drops again: polling resumes on the next interval.
        link_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(320)).await;
        assert!(hits.load(Ordering::SeqCst) > after_up, "polling resumed");

        drop(link_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn polling_stops_while_the_link_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = json!({"system": {}}).to_string();
        // Allow only the startup fetch; any poll tick would hang on accept
        // anyway, and the assertion below uses time instead.
        tokio::spawn(serve_status(listener, body, 1));

        let store = Arc::new(ContactStore::new());
        let status = Arc::new(StatusCache::new());
        let poller = SnapshotPoller::new(
            &format!("http://{addr}"),
            store,
            status.clone(),
            Duration::from_millis(50),
        );

        let (link_tx, link_rx) = watch::channel(true);
        let handle = poller.spawn(link_rx);

        // Link up: after the startup fetch, no further request should be
        // made even though several intervals elapse.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(status.current().get("system").is_some(), "startup fetch ran");

        drop(link_tx);
        let _ = handle.await;
    }
}
