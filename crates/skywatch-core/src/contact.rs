//! The reconciled detection entity.
//!
//! Contacts arrive as loosely shaped JSON from several producer generations;
//! normalization maps every shape onto one canonical `Contact` keyed by a
//! stable `id`. Staleness is never stored -- it is recomputed from the query
//! time so a contact cannot carry a cached display state.
//!
//! Naming rules inherited from the wire contract: coordinates are `lat`/`lon`
//! (never `lng`), timestamps are milliseconds, frequencies are Hz.

use serde_json::Value;

use crate::envelope::{Envelope, Source};

/// Multiplier applied to `stale_after_ms` for the "lost" display state.
pub const LOST_FACTOR: u64 = 5;

/// Ordinal severity; declaration order gives `Info < Low < ... < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parse, defaulting to `Info` so downstream sorting never needs a null
    /// check.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            Some("critical") => Self::Critical,
            Some("high") => Self::High,
            Some("medium") => Self::Medium,
            Some("low") => Self::Low,
            _ => Self::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

/// A lat/lon pair, altitude optional (meters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
    pub alt_m: Option<f64>,
}

/// FPV receiver lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Scanning,
    Locked,
    Hold,
}

impl LockState {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            Some("locked") => Self::Locked,
            Some("hold") => Self::Hold,
            _ => Self::Scanning,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteIdDetail {
    pub model: Option<String>,
    pub serial_id: Option<String>,
    pub operator_id: Option<String>,
    pub uas_id: Option<String>,
    pub drone_coords: Option<Coordinates>,
    pub pilot_coords: Option<Coordinates>,
    pub home_coords: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FpvLinkDetail {
    /// Always Hz on the wire; display conversion is a consumer concern.
    pub freq_hz: u64,
    pub rssi_dbm: f64,
    pub lock_state: LockState,
    pub band: Option<String>,
    pub channel: Option<u32>,
    pub hit_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnknownRfDetail {
    pub signal_strength: Option<f64>,
    pub notes: Option<String>,
}

/// Per-class payload; the tag doubles as the contact's `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum ContactDetail {
    RemoteId(RemoteIdDetail),
    FpvLink(FpvLinkDetail),
    UnknownRf(UnknownRfDetail),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContactClass {
    RemoteId,
    FpvLink,
    UnknownRf,
}

impl ContactClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteId => "REMOTE_ID",
            Self::FpvLink => "FPV_LINK",
            Self::UnknownRf => "UNKNOWN_RF",
        }
    }
}

/// A tracked detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: String,
    pub source: Source,
    pub severity: Severity,
    /// Sticky: preserved from the earliest known record across merges.
    pub first_seen_ts: u64,
    pub last_seen_ts: u64,
    pub stale_after_ms: u64,
    pub detail: ContactDetail,
}

impl Contact {
    pub fn class(&self) -> ContactClass {
        match self.detail {
            ContactDetail::RemoteId(_) => ContactClass::RemoteId,
            ContactDetail::FpvLink(_) => ContactClass::FpvLink,
            ContactDetail::UnknownRf(_) => ContactClass::UnknownRf,
        }
    }

    /// Past `stale_after_ms` since the last sighting. Pure function of the
    /// query time.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ts) > self.stale_after_ms
    }

    /// Past 5x `stale_after_ms`. Display concept only -- removal happens
    /// solely via an explicit CONTACT_LOST.
    pub fn is_lost(&self, now_ms: u64) -> bool {
        // stale_after_ms is wire-controlled and may be absurdly large.
        let threshold = self.stale_after_ms.saturating_mul(LOST_FACTOR);
        now_ms.saturating_sub(self.last_seen_ts) > threshold
    }

    /// Merge an incoming normalized record into this one.
    ///
    /// Top-level fields take the incoming values; `first_seen_ts` is kept
    /// from the existing record. RemoteId coordinate pairs merge
    /// independently: a valid incoming pair replaces, an absent one never
    /// erases. Other detail classes are replaced wholesale.
    pub fn merge_update(&mut self, incoming: Contact) {
        self.source = incoming.source;
        self.severity = incoming.severity;
        self.last_seen_ts = incoming.last_seen_ts;
        self.stale_after_ms = incoming.stale_after_ms;

        match (&mut self.detail, incoming.detail) {
            (ContactDetail::RemoteId(prev), ContactDetail::RemoteId(next)) => {
                if next.model.is_some() {
                    prev.model = next.model;
                }
                if next.serial_id.is_some() {
                    prev.serial_id = next.serial_id;
                }
                if next.operator_id.is_some() {
                    prev.operator_id = next.operator_id;
                }
                if next.uas_id.is_some() {
                    prev.uas_id = next.uas_id;
                }
                if next.drone_coords.is_some() {
                    prev.drone_coords = next.drone_coords;
                }
                if next.pilot_coords.is_some() {
                    prev.pilot_coords = next.pilot_coords;
                }
                if next.home_coords.is_some() {
                    prev.home_coords = next.home_coords;
                }
            }
            (slot, next) => *slot = next,
        }
    }

    /// Normalize a raw event payload into the canonical shape.
    ///
    /// Accepts the nested contract form (`{type, remote_id: {...}}` etc.),
    /// payloads wrapped in a `contact`/`data` key, and the flat Remote ID
    /// form older receivers emit (`{id, lat, lon, operator_lat, ...}`).
    /// Returns `None` when no usable id can be established.
    pub fn from_event(raw: &Value, envelope: Option<&Envelope>, now_ms: u64) -> Option<Contact> {
        let payload = raw
            .get("contact")
            .filter(|v| v.is_object())
            .or_else(|| raw.get("data").filter(|v| v.is_object()))
            .unwrap_or(raw);
        if !payload.is_object() {
            return None;
        }

        let last_seen = coerce_ms(payload.get("last_seen_ts"))
            .or_else(|| coerce_ms(payload.get("last_ts")))
            .or_else(|| coerce_ms(payload.get("ts_ms")))
            .or_else(|| envelope.map(|e| e.timestamp))
            .unwrap_or(now_ms);
        let first_seen = coerce_ms(payload.get("first_seen_ts")).unwrap_or(last_seen);

        let source = contact_source(
            payload.get("source").and_then(Value::as_str),
            envelope.map(|e| e.source),
        );
        let severity = Severity::parse(payload.get("severity").and_then(Value::as_str));

        let declared = payload.get("type").and_then(Value::as_str);

        if declared == Some("UNKNOWN_RF") || payload.get("unknown_rf").is_some() {
            let rf = payload.get("unknown_rf").cloned().unwrap_or(Value::Null);
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    let hz = rf
                        .get("center_hz")
                        .and_then(Value::as_u64)
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "unknown".into());
                    format!("rf:{hz}")
                });
            return Some(Contact {
                id,
                source,
                severity,
                first_seen_ts: first_seen,
                last_seen_ts: last_seen,
                stale_after_ms: coerce_ms(payload.get("stale_after_ms")).unwrap_or(7_000),
                detail: ContactDetail::UnknownRf(UnknownRfDetail {
                    signal_strength: rf.get("signal_strength").and_then(Value::as_f64),
                    notes: rf.get("notes").and_then(Value::as_str).map(str::to_string),
                }),
            });
        }

        let stale_after = coerce_ms(payload.get("stale_after_ms")).unwrap_or(15_000);

        if declared == Some("FPV_LINK") {
            let fpv = payload.get("fpv_link")?;
            let id = payload.get("id").and_then(Value::as_str)?.to_string();
            return Some(Contact {
                id,
                source,
                severity,
                first_seen_ts: first_seen,
                last_seen_ts: last_seen,
                stale_after_ms: stale_after,
                detail: ContactDetail::FpvLink(FpvLinkDetail {
                    freq_hz: fpv.get("freq_hz").and_then(Value::as_u64).unwrap_or(0),
                    rssi_dbm: fpv.get("rssi_dbm").and_then(Value::as_f64).unwrap_or(0.0),
                    lock_state: LockState::parse(fpv.get("lock_state").and_then(Value::as_str)),
                    band: fpv.get("band").and_then(Value::as_str).map(str::to_string),
                    channel: fpv
                        .get("channel")
                        .and_then(Value::as_u64)
                        .map(|v| v as u32),
                    hit_count: fpv.get("hit_count").and_then(Value::as_u64),
                }),
            });
        }

        if declared == Some("REMOTE_ID") {
            if let Some(rid) = payload.get("remote_id") {
                let id = payload.get("id").and_then(Value::as_str)?.to_string();
                return Some(Contact {
                    id,
                    source,
                    severity,
                    first_seen_ts: first_seen,
                    last_seen_ts: last_seen,
                    stale_after_ms: stale_after,
                    detail: ContactDetail::RemoteId(remote_id_detail(rid)),
                });
            }
        }

        // Flat Remote ID form: coordinates and identifiers at the top level.
        flat_remote_id(payload, source, severity, first_seen, last_seen, stale_after)
    }
}

fn remote_id_detail(rid: &Value) -> RemoteIdDetail {
    let get_str = |key: &str| rid.get(key).and_then(Value::as_str).map(str::to_string);
    RemoteIdDetail {
        model: get_str("model").or_else(|| get_str("msg_type")),
        serial_id: get_str("serial_id").or_else(|| get_str("basic_id")),
        operator_id: get_str("operator_id"),
        uas_id: get_str("uas_id"),
        drone_coords: parse_coords(rid.get("drone_coords")),
        pilot_coords: parse_coords(rid.get("pilot_coords")),
        home_coords: parse_coords(rid.get("home_coords")),
    }
}

fn flat_remote_id(
    payload: &Value,
    source: Source,
    severity: Severity,
    first_seen: u64,
    last_seen: u64,
    stale_after: u64,
) -> Option<Contact> {
    let id = payload.get("id").and_then(Value::as_str)?.to_string();
    let get_str = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);

    let drone_coords = match (num(payload.get("lat")), num(payload.get("lon"))) {
        (Some(lat), Some(lon)) => Some(Coordinates {
            lat,
            lon,
            alt_m: num(payload.get("alt_m")),
        }),
        _ => parse_coords(payload.get("drone_coords")),
    };
    let pilot_coords = parse_coords(payload.get("pilot_coords")).or_else(|| {
        pair_coords(payload.get("operator_lat"), payload.get("operator_lon"))
    });
    let home_coords = parse_coords(payload.get("home_coords"))
        .or_else(|| pair_coords(payload.get("home_lat"), payload.get("home_lon")));

    Some(Contact {
        id,
        source,
        severity,
        first_seen_ts: first_seen,
        last_seen_ts: last_seen,
        stale_after_ms: stale_after,
        detail: ContactDetail::RemoteId(RemoteIdDetail {
            model: get_str("msg_type").or_else(|| get_str("model")),
            serial_id: get_str("serial_id").or_else(|| get_str("basic_id")),
            operator_id: get_str("operator_id"),
            uas_id: get_str("uas_id"),
            drone_coords,
            pilot_coords,
            home_coords,
        }),
    })
}

/// Coerce a wire timestamp/duration to milliseconds. Producers disagree on
/// units; anything below 1e12 is taken as seconds.
pub fn coerce_ms(value: Option<&Value>) -> Option<u64> {
    let n = num(value)?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    if n < 1e12 {
        Some((n * 1000.0).round() as u64)
    } else {
        Some(n.round() as u64)
    }
}

fn num(value: Option<&Value>) -> Option<f64> {
    let v = value?;
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        .filter(|n| n.is_finite())
}

/// A coordinate pair is only accepted when both lat and lon are finite
/// numbers; a partial or null pair is treated as absent.
fn parse_coords(value: Option<&Value>) -> Option<Coordinates> {
    let v = value?;
    let lat = num(v.get("lat"))?;
    let lon = num(v.get("lon"))?;
    Some(Coordinates {
        lat,
        lon,
        alt_m: num(v.get("alt_m")),
    })
}

fn pair_coords(lat: Option<&Value>, lon: Option<&Value>) -> Option<Coordinates> {
    Some(Coordinates {
        lat: num(lat)?,
        lon: num(lon)?,
        alt_m: None,
    })
}

/// Contact-level source only distinguishes live from replay.
fn contact_source(raw: Option<&str>, fallback: Option<Source>) -> Source {
    let parsed = raw.map(Source::parse).or(fallback).unwrap_or(Source::Live);
    match parsed {
        Source::Replay => Source::Replay,
        _ => Source::Live,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rid_contact(last_seen: u64, stale_after: u64) -> Contact {
        Contact {
            id: "rid-1".into(),
            source: Source::Live,
            severity: Severity::Info,
            first_seen_ts: last_seen,
            last_seen_ts: last_seen,
            stale_after_ms: stale_after,
            detail: ContactDetail::RemoteId(RemoteIdDetail::default()),
        }
    }

    #[test]
    fn severity_is_ordinal_and_defaults_to_info() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
        assert_eq!(Severity::parse(None), Severity::Info);
        assert_eq!(Severity::parse(Some("nonsense")), Severity::Info);
        assert_eq!(Severity::parse(Some("CRITICAL")), Severity::Critical);
    }

    #[test]
    fn staleness_is_a_function_of_query_time() {
        let c = rid_contact(10_000, 1_000);
        assert!(!c.is_stale(10_500));
        assert!(c.is_stale(11_500));
        assert!(!c.is_lost(11_500));
        assert!(c.is_lost(15_001 + 1));
        // Exactly at the boundary is not yet past it.
        assert!(!c.is_stale(11_000));
        assert!(!c.is_lost(15_000));
    }

    #[test]
    fn lost_threshold_saturates_on_huge_stale_windows() {
        // A wire payload can carry any stale_after_ms; the 5x lost window
        // must clamp instead of overflowing.
        let mut c = rid_contact(0, 0);
        c.stale_after_ms = u64::MAX;
        assert!(!c.is_lost(u64::MAX));

        let raw = json!({
            "id": "rid-x",
            "type": "REMOTE_ID",
            "remote_id": {},
            "stale_after_ms": 1e300
        });
        let c = Contact::from_event(&raw, None, 0).unwrap();
        assert!(!c.is_lost(u64::MAX));
    }

    #[test]
    fn normalizes_nested_remote_id_payload() {
        let raw = json!({
            "id": "rid-7",
            "type": "REMOTE_ID",
            "severity": "high",
            "last_seen_ts": 1_700_000_000_500u64,
            "remote_id": {
                "model": "Mavic 3",
                "basic_id": "SN123",
                "drone_coords": {"lat": 1.0, "lon": 2.0, "alt_m": 120.0},
                "pilot_coords": null
            }
        });
        let c = Contact::from_event(&raw, None, 0).unwrap();
        assert_eq!(c.id, "rid-7");
        assert_eq!(c.severity, Severity::High);
        assert_eq!(c.class(), ContactClass::RemoteId);
        let ContactDetail::RemoteId(rid) = &c.detail else {
            panic!("wrong class")
        };
        assert_eq!(rid.serial_id.as_deref(), Some("SN123"));
        assert_eq!(
            rid.drone_coords,
            Some(Coordinates {
                lat: 1.0,
                lon: 2.0,
                alt_m: Some(120.0)
            })
        );
        assert_eq!(rid.pilot_coords, None);
    }

    #[test]
    fn normalizes_flat_remote_id_payload() {
        let raw = json!({
            "id": "rid-8",
            "lat": 51.5,
            "lon": -0.1,
            "alt_m": 80,
            "operator_lat": 51.4,
            "operator_lon": -0.2,
            "msg_type": "BasicId",
            "basic_id": "SN9"
        });
        let c = Contact::from_event(&raw, None, 42).unwrap();
        let ContactDetail::RemoteId(rid) = &c.detail else {
            panic!("wrong class")
        };
        assert_eq!(rid.drone_coords.unwrap().lat, 51.5);
        assert_eq!(rid.pilot_coords.unwrap().lon, -0.2);
        assert_eq!(rid.home_coords, None);
        assert_eq!(rid.model.as_deref(), Some("BasicId"));
        assert_eq!(rid.serial_id.as_deref(), Some("SN9"));
    }

    #[test]
    fn unknown_rf_synthesizes_an_id() {
        let raw = json!({"unknown_rf": {"center_hz": 433_920_000u64, "signal_strength": -61.0}});
        let c = Contact::from_event(&raw, None, 5).unwrap();
        assert_eq!(c.id, "rf:433920000");
        assert_eq!(c.stale_after_ms, 7_000);
        assert_eq!(c.class(), ContactClass::UnknownRf);
    }

    #[test]
    fn second_timestamps_are_coerced_to_ms() {
        let raw = json!({
            "id": "rid-9",
            "type": "REMOTE_ID",
            "remote_id": {},
            "last_seen_ts": 1_700_000_000.25
        });
        let c = Contact::from_event(&raw, None, 0).unwrap();
        assert_eq!(c.last_seen_ts, 1_700_000_000_250);
    }

    #[test]
    fn envelope_supplies_timestamp_and_source_fallbacks() {
        let env = Envelope::synthetic("CONTACT_NEW", Value::Null);
        let env = Envelope {
            timestamp: 123_456_789_012_345,
            source: Source::Replay,
            ..env
        };
        let raw = json!({"id": "rid-a", "type": "REMOTE_ID", "remote_id": {}});
        let c = Contact::from_event(&raw, Some(&env), 0).unwrap();
        assert_eq!(c.last_seen_ts, 123_456_789_012_345);
        assert_eq!(c.first_seen_ts, 123_456_789_012_345);
        assert_eq!(c.source, Source::Replay);
    }

    #[test]
    fn merge_keeps_first_seen_and_takes_last_seen() {
        let mut stored = rid_contact(100, 15_000);
        let mut incoming = rid_contact(300, 15_000);
        incoming.first_seen_ts = 200;
        incoming.severity = Severity::Critical;
        stored.merge_update(incoming);
        assert_eq!(stored.first_seen_ts, 100);
        assert_eq!(stored.last_seen_ts, 300);
        assert_eq!(stored.severity, Severity::Critical);
    }

    #[test]
    fn coordinate_pairs_merge_independently() {
        let mut stored = rid_contact(100, 15_000);
        if let ContactDetail::RemoteId(rid) = &mut stored.detail {
            rid.drone_coords = Some(Coordinates {
                lat: 1.0,
                lon: 2.0,
                alt_m: None,
            });
        }

        // Update carries no drone pair (normalized away as invalid) but adds
        // a pilot pair.
        let mut incoming = rid_contact(200, 15_000);
        if let ContactDetail::RemoteId(rid) = &mut incoming.detail {
            rid.pilot_coords = Some(Coordinates {
                lat: 3.0,
                lon: 4.0,
                alt_m: None,
            });
        }
        stored.merge_update(incoming);

        let ContactDetail::RemoteId(rid) = &stored.detail else {
            panic!("wrong class")
        };
        assert_eq!(rid.drone_coords.unwrap().lat, 1.0);
        assert_eq!(rid.pilot_coords.unwrap().lat, 3.0);
    }

    #[test]
    fn invalid_coordinate_pairs_normalize_to_absent() {
        let raw = json!({
            "id": "rid-b",
            "type": "REMOTE_ID",
            "remote_id": {
                "drone_coords": null,
                "pilot_coords": {"lat": "not-a-number", "lon": 4.0},
                "home_coords": {"lat": 3.0, "lon": 4.0}
            }
        });
        let c = Contact::from_event(&raw, None, 0).unwrap();
        let ContactDetail::RemoteId(rid) = &c.detail else {
            panic!("wrong class")
        };
        assert_eq!(rid.drone_coords, None);
        assert_eq!(rid.pilot_coords, None);
        assert!(rid.home_coords.is_some());
    }
}
