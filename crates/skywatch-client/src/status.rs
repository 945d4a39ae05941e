//! Latest device status, merged from REST snapshots and live telemetry.

use std::sync::Mutex;

use serde_json::Value;

/// Written by the client's internal subscriptions and the snapshot poller;
/// everyone else reads.
#[derive(Default)]
pub struct StatusCache {
    inner: Mutex<Value>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh REST snapshot replaces the whole cached object.
    pub fn set_snapshot(&self, snapshot: Value) {
        *self.inner.lock().unwrap() = snapshot;
    }

    /// `TELEMETRY_UPDATE`: shallow-merge top-level keys over the cache.
    pub fn merge_telemetry(&self, patch: &Value) {
        let Some(patch) = patch.as_object() else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        let obj = ensure_object(&mut inner);
        for (k, v) in patch {
            obj.insert(k.clone(), v.clone());
        }
    }

    /// `REPLAY_STATE`: merge under the `replay` key.
    pub fn merge_replay(&self, patch: &Value) {
        let Some(patch) = patch.as_object() else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        let obj = ensure_object(&mut inner);
        let replay = obj
            .entry("replay")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(replay) = replay.as_object_mut() {
            for (k, v) in patch {
                replay.insert(k.clone(), v.clone());
            }
        } else {
            *replay = Value::Object(patch.clone());
        }
    }

    pub fn current(&self) -> Value {
        self.inner.lock().unwrap().clone()
    }
}

fn ensure_object(value: &mut Value) -> &mut serde_json::Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Default::default());
    }
    value.as_object_mut().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn telemetry_merges_shallowly_over_the_snapshot() {
        let cache = StatusCache::new();
        cache.set_snapshot(json!({"system": {"cpu_temp_celsius": 55}, "gps": {"mode": 3}}));
        cache.merge_telemetry(&json!({"gps": {"mode": 2}, "fpv": {"scan": "active"}}));

        let v = cache.current();
        assert_eq!(v["system"]["cpu_temp_celsius"], 55);
        assert_eq!(v["gps"]["mode"], 2);
        assert_eq!(v["fpv"]["scan"], "active");
    }

    #[test]
    fn replay_state_nests_under_the_replay_key() {
        let cache = StatusCache::new();
        cache.merge_replay(&json!({"active": true, "file": "run-4.pcap"}));
        cache.merge_replay(&json!({"active": false}));

        let v = cache.current();
        assert_eq!(v["replay"]["active"], false);
        assert_eq!(v["replay"]["file"], "run-4.pcap");
    }

    #[test]
    fn a_new_snapshot_replaces_the_cache() {
        let cache = StatusCache::new();
        cache.merge_telemetry(&json!({"stale": "field"}));
        cache.set_snapshot(json!({"system": {}}));
        assert!(cache.current().get("stale").is_none());
    }
}
