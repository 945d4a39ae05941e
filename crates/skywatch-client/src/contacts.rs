//! Contact reconciliation engine.
//!
//! Single owner of the working set of tracked contacts. Incremental
//! `CONTACT_NEW` / `CONTACT_UPDATE` / `CONTACT_LOST` events and bulk REST
//! snapshots all funnel through here; everyone else only reads snapshots of
//! the set. New contacts go to the front; when the cap is exceeded the
//! oldest-inserted entries fall off the back.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;

use skywatch_core::{Contact, ContactClass, Envelope};

/// Working-set cap; beyond it the oldest-inserted contacts are evicted.
pub const DEFAULT_CONTACT_CAP: usize = 500;

/// Minimum spacing between audible-alarm triggers.
pub const ALARM_DEBOUNCE_MS: u64 = 3_000;

/// How long an explicit CONTACT_LOST keeps shielding an id from snapshot
/// resurrection.
const TOMBSTONE_TTL_MS: u64 = 300_000;

/// Result of feeding one contact event through the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOutcome {
    /// The payload normalized and the working set was touched.
    pub applied: bool,
    /// The id was not previously tracked.
    pub inserted: bool,
    /// An audible alert should fire for this detection.
    pub alarm: bool,
}

#[derive(Default)]
struct StoreInner {
    /// Front = most recently inserted/newest.
    working: VecDeque<Contact>,
    /// Explicitly lost ids and when they were lost.
    lost: HashMap<String, u64>,
    last_alarm_ms: u64,
}

pub struct ContactStore {
    cap: usize,
    inner: Mutex<StoreInner>,
}

impl Default for ContactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactStore {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_CONTACT_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Handle a `CONTACT_NEW` payload. Also decides whether the audible
    /// alarm should fire: Remote ID and FPV detections trigger it, debounced
    /// so a burst of near-simultaneous detections cannot storm the speaker.
    pub fn apply_new(&self, raw: &Value, envelope: Option<&Envelope>, now_ms: u64) -> ApplyOutcome {
        let Some(contact) = Contact::from_event(raw, envelope, now_ms) else {
            tracing::debug!("ignoring unusable contact payload");
            return ApplyOutcome::default();
        };

        let mut inner = self.inner.lock().unwrap();

        let alarm = matches!(
            contact.class(),
            ContactClass::RemoteId | ContactClass::FpvLink
        ) && now_ms.saturating_sub(inner.last_alarm_ms) > ALARM_DEBOUNCE_MS;
        if alarm {
            inner.last_alarm_ms = now_ms;
        }

        let inserted = self.upsert(&mut inner, contact, now_ms);
        ApplyOutcome {
            applied: true,
            inserted,
            alarm,
        }
    }

    /// Handle a `CONTACT_UPDATE` payload: merge into the existing record, or
    /// insert when the id has never been seen (updates can race ahead of
    /// their CONTACT_NEW).
    pub fn apply_update(
        &self,
        raw: &Value,
        envelope: Option<&Envelope>,
        now_ms: u64,
    ) -> ApplyOutcome {
        let Some(contact) = Contact::from_event(raw, envelope, now_ms) else {
            tracing::debug!("ignoring unusable contact payload");
            return ApplyOutcome::default();
        };

        let mut inner = self.inner.lock().unwrap();
        let inserted = self.upsert(&mut inner, contact, now_ms);
        ApplyOutcome {
            applied: true,
            inserted,
            alarm: false,
        }
    }

    /// Handle a `CONTACT_LOST` payload: remove immediately, no grace period.
    /// Unknown ids are fine (idempotent).
    pub fn apply_lost(&self, raw: &Value, envelope: Option<&Envelope>, now_ms: u64) {
        let id = match raw.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => match Contact::from_event(raw, envelope, now_ms) {
                Some(c) => c.id,
                None => {
                    tracing::debug!("CONTACT_LOST without a usable id");
                    return;
                }
            },
        };

        let mut inner = self.inner.lock().unwrap();
        let before = inner.working.len();
        inner.working.retain(|c| c.id != id);
        if inner.working.len() < before {
            tracing::debug!(id = %id, "contact lost");
        }
        inner.lost.insert(id, now_ms);
        prune_tombstones(&mut inner, now_ms);
    }

    /// Bulk-merge a REST snapshot. An empty batch is a no-op (a snapshot
    /// supplements the working set, it never forces a reset), and ids the
    /// stream has explicitly lost are not resurrected.
    pub fn hydrate(&self, batch: &[Value], now_ms: u64) -> usize {
        let normalized: Vec<Contact> = batch
            .iter()
            .filter_map(|raw| Contact::from_event(raw, None, now_ms))
            .collect();
        if normalized.is_empty() {
            return 0;
        }

        let mut inner = self.inner.lock().unwrap();
        prune_tombstones(&mut inner, now_ms);

        let mut applied = 0;
        for contact in normalized {
            if inner.lost.contains_key(&contact.id) {
                tracing::debug!(id = %contact.id, "snapshot contact already lost, skipping");
                continue;
            }
            self.merge_or_insert(&mut inner, contact);
            applied += 1;
        }
        applied
    }

    /// Most-recent-first snapshot of the working set.
    pub fn snapshot(&self) -> Vec<Contact> {
        self.inner.lock().unwrap().working.iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Contact> {
        self.inner
            .lock()
            .unwrap()
            .working
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Live-stream upsert: a live event for an id always clears its
    /// tombstone (the detection is legitimately back).
    fn upsert(&self, inner: &mut StoreInner, contact: Contact, _now_ms: u64) -> bool {
        inner.lost.remove(&contact.id);
        self.merge_or_insert(inner, contact)
    }

    fn merge_or_insert(&self, inner: &mut StoreInner, contact: Contact) -> bool {
        if let Some(existing) = inner.working.iter_mut().find(|c| c.id == contact.id) {
            existing.merge_update(contact);
            return false;
        }

        inner.working.push_front(contact);
        if inner.working.len() > self.cap {
            let evicted = inner.working.len() - self.cap;
            inner.working.truncate(self.cap);
            tracing::debug!(evicted, cap = self.cap, "working set over cap");
        }
        true
    }
}

fn prune_tombstones(inner: &mut StoreInner, now_ms: u64) {
    inner
        .lost
        .retain(|_, lost_at| now_ms.saturating_sub(*lost_at) < TOMBSTONE_TTL_MS);
}
