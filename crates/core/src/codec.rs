//! Metadata codec: maps raw labels/annotations to a typed [`State`] and back.
//!
//! Decoding never fails. Unparsable values are kept verbatim so that encoding an
//! unchanged state writes back exactly what was read.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Serialize, Serializer};

use crate::Metadata;

pub const DEFAULT_PREFIX: &str = "mycontrollercheck";

/// Value written for presence-only markers.
pub const MARKER_VALUE: &str = "true";

/// Label/annotation keys the state machine owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Keys {
    /// Label toggled by the expiry policy.
    pub marker_label: String,
    pub started: String,
    pub updated: String,
    pub count: String,
    /// Terminal marker of the bounded-count policy.
    pub finished: String,
    pub expires: String,
    /// Terminal marker of the expiry policy.
    pub processed: String,
}

impl Keys {
    pub fn with_prefix(prefix: &str) -> Self {
        let k = |suffix: &str| format!("{}/{}", prefix, suffix);
        Self {
            marker_label: k("ttl"),
            started: k("checktimestart"),
            updated: k("checktimeupdate"),
            count: k("checknum"),
            finished: k("checktimeend"),
            expires: k("checktimeexpiry"),
            processed: k("processed"),
        }
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

/// A timestamp annotation: the raw text plus its parsed value, if it parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    raw: String,
    at: Option<DateTime<Utc>>,
}

impl Stamp {
    pub fn parse(raw: &str) -> Self {
        let at = DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc));
        Self { raw: raw.to_string(), at }
    }

    /// Stamp for `t`, rounded up to the next whole second.
    pub fn at(t: DateTime<Utc>) -> Self {
        let t = ceil_to_second(t);
        Self { raw: format_time(t), at: Some(t) }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Parsed time; `None` when the raw value is malformed.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.at
    }

    pub fn is_malformed(&self) -> bool {
        self.at.is_none()
    }
}

impl Serialize for Stamp {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.raw)
    }
}

/// The counter annotation: raw text plus its value when it is a non-negative integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Count {
    raw: String,
    value: Option<u64>,
}

impl Count {
    pub fn parse(raw: &str) -> Self {
        Self { raw: raw.to_string(), value: raw.parse::<u64>().ok() }
    }

    pub fn of(n: u64) -> Self {
        Self { raw: n.to_string(), value: Some(n) }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn value(&self) -> Option<u64> {
        self.value
    }
}

impl Serialize for Count {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.raw)
    }
}

/// Reconciliation state as persisted on the object. Rebuilt on every pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct State {
    pub marker: bool,
    pub processed: bool,
    pub started: Option<Stamp>,
    pub updated: Option<Stamp>,
    pub expires: Option<Stamp>,
    pub count: Option<Count>,
    pub finished: Option<Stamp>,
}

/// A timestamp annotation that is present but does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Malformed {
    pub key: String,
    pub raw: String,
}

/// Read the state fields out of `meta`.
pub fn decode(keys: &Keys, meta: &Metadata) -> (State, Vec<Malformed>) {
    let mut malformed = Vec::new();
    let mut stamp = |key: &str| {
        let s = Stamp::parse(meta.annotations.get(key)?);
        if s.is_malformed() {
            malformed.push(Malformed { key: key.to_string(), raw: s.raw.clone() });
        }
        Some(s)
    };
    let started = stamp(&keys.started);
    let updated = stamp(&keys.updated);
    let expires = stamp(&keys.expires);

    let state = State {
        marker: meta.labels.contains_key(&keys.marker_label),
        processed: meta.annotations.contains_key(&keys.processed),
        started,
        updated,
        expires,
        count: meta.annotations.get(&keys.count).map(|raw| Count::parse(raw)),
        // presence-only: the value is never interpreted
        finished: meta.annotations.get(&keys.finished).map(|raw| Stamp::parse(raw)),
    };
    (state, malformed)
}

/// Write `state` into `meta`. Keys the state does not own are left alone and
/// state annotations are never deleted; only the marker label can be removed.
pub fn encode(keys: &Keys, state: &State, meta: &mut Metadata) {
    if state.marker {
        meta.labels
            .entry(keys.marker_label.clone())
            .or_insert_with(|| MARKER_VALUE.to_string());
    } else {
        meta.labels.remove(&keys.marker_label);
    }
    if state.processed {
        meta.annotations
            .entry(keys.processed.clone())
            .or_insert_with(|| MARKER_VALUE.to_string());
    }
    let fields = [
        (&keys.started, state.started.as_ref().map(Stamp::raw)),
        (&keys.updated, state.updated.as_ref().map(Stamp::raw)),
        (&keys.expires, state.expires.as_ref().map(Stamp::raw)),
        (&keys.count, state.count.as_ref().map(Count::raw)),
        (&keys.finished, state.finished.as_ref().map(Stamp::raw)),
    ];
    for (key, value) in fields {
        if let Some(v) = value {
            meta.annotations.insert(key.clone(), v.to_string());
        }
    }
}

/// RFC 3339, whole seconds, `Z` suffix (Go's `time.RFC3339` for UTC values).
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn ceil_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    let floor = t.trunc_subsecs(0);
    if floor == t {
        return t;
    }
    floor.checked_add_signed(chrono::Duration::seconds(1)).unwrap_or(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(labels: &[(&str, &str)], annos: &[(&str, &str)]) -> Metadata {
        Metadata {
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            annotations: annos.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn missing_keys_decode_to_empty_state() {
        let keys = Keys::default();
        let (state, malformed) = decode(&keys, &meta(&[("app", "web")], &[("other", "x")]));
        assert_eq!(state, State::default());
        assert!(malformed.is_empty());
    }

    #[test]
    fn decodes_checknum_wire_layout() {
        let keys = Keys::default();
        let m = meta(
            &[],
            &[
                ("mycontrollercheck/checktimestart", "2024-05-01T10:00:00Z"),
                ("mycontrollercheck/checktimeupdate", "2024-05-01T12:00:05+02:00"),
                ("mycontrollercheck/checknum", "17"),
            ],
        );
        let (state, malformed) = decode(&keys, &m);
        assert!(malformed.is_empty());
        assert_eq!(state.count.as_ref().and_then(Count::value), Some(17));
        let updated = state.updated.as_ref().and_then(Stamp::time);
        assert_eq!(updated, Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 5).unwrap()));
        assert!(state.finished.is_none());
    }

    #[test]
    fn malformed_timestamps_are_reported_and_kept_raw() {
        let keys = Keys::default();
        let m = meta(&[], &[("mycontrollercheck/checktimeexpiry", "tomorrow-ish")]);
        let (state, malformed) = decode(&keys, &m);
        assert_eq!(malformed, vec![Malformed { key: keys.expires.clone(), raw: "tomorrow-ish".into() }]);
        let exp = state.expires.as_ref().map(|s| (s.raw(), s.is_malformed()));
        assert_eq!(exp, Some(("tomorrow-ish", true)));
    }

    #[test]
    fn bad_counter_is_carried_not_reported() {
        let keys = Keys::default();
        let (state, malformed) = decode(&keys, &meta(&[], &[("mycontrollercheck/checknum", "-3")]));
        assert!(malformed.is_empty());
        let c = state.count.unwrap();
        assert_eq!(c.raw(), "-3");
        assert_eq!(c.value(), None);
    }

    #[test]
    fn encode_is_idempotent_and_preserves_foreign_keys() {
        let keys = Keys::default();
        let stored = meta(
            &[("app", "web")],
            &[
                ("owner", "team-a"),
                ("mycontrollercheck/checktimeupdate", "2024-05-01T12:00:05+02:00"),
                ("mycontrollercheck/checknum", "007"),
            ],
        );
        let (state, _) = decode(&keys, &stored);
        let mut once = stored.clone();
        encode(&keys, &state, &mut once);
        // unchanged fields go back byte-for-byte
        assert_eq!(once, stored);
        let mut twice = once.clone();
        encode(&keys, &state, &mut twice);
        assert_eq!(twice, once);
    }

    #[test]
    fn encode_toggles_marker_label() {
        let keys = Keys::default();
        let mut m = meta(&[("app", "web")], &[]);
        let mut state = State { marker: true, ..State::default() };
        encode(&keys, &state, &mut m);
        assert_eq!(m.labels.get("mycontrollercheck/ttl").map(String::as_str), Some("true"));

        state.marker = false;
        state.processed = true;
        encode(&keys, &state, &mut m);
        assert!(!m.labels.contains_key("mycontrollercheck/ttl"));
        assert_eq!(m.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(m.annotations.get("mycontrollercheck/processed").map(String::as_str), Some("true"));
    }

    #[test]
    fn stamps_round_up_to_whole_seconds() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(Stamp::at(t).raw(), "2024-05-01T10:00:00Z");
        let frac = t + chrono::Duration::milliseconds(250);
        let s = Stamp::at(frac);
        assert_eq!(s.raw(), "2024-05-01T10:00:01Z");
        assert!(s.time().unwrap() >= frac);
        assert_eq!(Stamp::parse(s.raw()), s);
    }

    #[test]
    fn custom_prefix() {
        let keys = Keys::with_prefix("example.com");
        assert_eq!(keys.count, "example.com/checknum");
        assert_eq!(keys.marker_label, "example.com/ttl");
    }
}
