//! Podtick core types: object identity, metadata snapshots and the pure
//! reconciliation state machine.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod policy;

pub use codec::{Count, Keys, Malformed, Stamp, State};
pub use policy::{Action, Decision, FirstRun, Inconsistency, Phase, Policy, PolicyError};

/// Stable identifier of a watched object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Labels and annotations of an object. Ordered maps keep patches and output stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Point-in-time read of an object, carrying the version writes are conditional on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub key: ObjectKey,
    pub resource_version: Option<String>,
    pub meta: Metadata,
}

/// Minimal metadata change: `Some(v)` sets a key, `None` removes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaPatch {
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
}

impl MetaPatch {
    /// Compute the changes that turn `before` into `after`.
    pub fn between(before: &Metadata, after: &Metadata) -> Self {
        Self {
            labels: map_diff(&before.labels, &after.labels),
            annotations: map_diff(&before.annotations, &after.annotations),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }

    /// Apply onto a metadata copy (used by in-memory stores and previews).
    pub fn apply_to(&self, meta: &mut Metadata) {
        apply_map(&self.labels, &mut meta.labels);
        apply_map(&self.annotations, &mut meta.annotations);
    }
}

fn map_diff(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    let mut out = BTreeMap::new();
    for (k, v) in after {
        if before.get(k) != Some(v) {
            out.insert(k.clone(), Some(v.clone()));
        }
    }
    for k in before.keys() {
        if !after.contains_key(k) {
            out.insert(k.clone(), None);
        }
    }
    out
}

fn apply_map(changes: &BTreeMap<String, Option<String>>, target: &mut BTreeMap<String, String>) {
    for (k, v) in changes {
        match v {
            Some(v) => {
                target.insert(k.clone(), v.clone());
            }
            None => {
                target.remove(k);
            }
        }
    }
}

pub mod prelude {
    pub use super::{
        Action, Decision, Keys, MetaPatch, Metadata, ObjectKey, Phase, Policy, Snapshot, State,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(labels: &[(&str, &str)], annos: &[(&str, &str)]) -> Metadata {
        Metadata {
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            annotations: annos.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn diff_tracks_sets_and_removals_only() {
        let before = meta(&[("app", "web"), ("x/ttl", "true")], &[("keep", "1"), ("n", "1")]);
        let after = meta(&[("app", "web")], &[("keep", "1"), ("n", "2"), ("new", "a")]);
        let p = MetaPatch::between(&before, &after);
        assert_eq!(p.labels.len(), 1);
        assert_eq!(p.labels.get("x/ttl"), Some(&None));
        assert_eq!(p.annotations.len(), 2);
        assert_eq!(p.annotations.get("n"), Some(&Some("2".to_string())));
        assert_eq!(p.annotations.get("new"), Some(&Some("a".to_string())));

        let mut replay = before.clone();
        p.apply_to(&mut replay);
        assert_eq!(replay, after);
    }

    #[test]
    fn identical_metadata_yields_empty_patch() {
        let m = meta(&[("a", "b")], &[("c", "d")]);
        assert!(MetaPatch::between(&m, &m.clone()).is_empty());
    }

    #[test]
    fn key_display() {
        assert_eq!(ObjectKey::namespaced("ns", "p").to_string(), "ns/p");
        assert_eq!(ObjectKey::new(None, "node-1").to_string(), "node-1");
    }
}
