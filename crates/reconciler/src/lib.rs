//! Podtick reconcile driver.
//!
//! One pass reads the object, runs the configured [`Policy`] over the decoded
//! state and applies at most one conditional update. The result is a
//! [`Disposition`] telling the external queue when, if ever, to call again.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use podtick_core::codec::{self, Count, Keys};
use podtick_core::{Action, Decision, Inconsistency, MetaPatch, ObjectKey, Phase, Policy, Snapshot};
use tracing::{debug, error, info, warn};

pub mod store;

pub use store::{Fault, MemStore, ObjectStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("inconsistent state on {key}: {reason}")]
    InconsistentState { key: ObjectKey, reason: Inconsistency },
    #[error("store unavailable for {key}: {error:#}")]
    StoreUnavailable { key: ObjectKey, error: anyhow::Error },
}

/// Scheduling instruction returned to the watch/queue.
#[derive(Debug)]
pub enum Disposition {
    Done,
    RequeueAfter(Duration),
    Error(ReconcileError),
}

impl Disposition {
    /// Metric label for this outcome.
    pub fn outcome(&self) -> &'static str {
        match self {
            Disposition::Done => "done",
            Disposition::RequeueAfter(_) => "requeue",
            Disposition::Error(_) => "error",
        }
    }
}

pub struct Reconciler<S> {
    store: S,
    policy: Policy,
    keys: Keys,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: S, policy: Policy, keys: Keys) -> Self {
        Self { store, policy, keys }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Disposition {
        self.reconcile_at(key, Utc::now()).await
    }

    /// Reconcile against an explicit clock reading.
    pub async fn reconcile_at(&self, key: &ObjectKey, now: DateTime<Utc>) -> Disposition {
        let started = Instant::now();
        let disposition = self.run(key, now).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("reconcile_total", 1, "outcome" => disposition.outcome());
        disposition
    }

    async fn run(&self, key: &ObjectKey, now: DateTime<Utc>) -> Disposition {
        let snap = match self.store.get(key).await {
            Ok(s) => s,
            Err(e) => return self.store_failure(key, "get", e),
        };

        let (state, malformed) = codec::decode(&self.keys, &snap.meta);
        let phase = self.policy.phase(&state);
        let decision = self.policy.decide(&state, now);
        debug!(obj = %key, ?phase, action = ?decision.action, "decided");

        let gating = self.policy.gating_key(&self.keys, &state);
        for m in &malformed {
            if phase == Phase::Active && gating == Some(m.key.as_str()) && decision.action.mutates() {
                counter!("reconcile_malformed_total", 1, "policy" => self.policy.name());
                warn!(obj = %key, key = %m.key, malformed_value = %m.raw, "unparsable timestamp; forcing progress");
            } else {
                debug!(obj = %key, key = %m.key, malformed_value = %m.raw, "ignoring unparsable timestamp");
            }
        }

        match &decision.action {
            Action::NoOp => {
                debug!(obj = %key, "terminal marker present; skipping");
                Disposition::Done
            }
            Action::RequeueOnly(wait) => {
                debug!(obj = %key, requeue_after_ms = wait.as_millis() as u64, "throttling: waiting for next slot");
                Disposition::RequeueAfter(*wait)
            }
            Action::Fail(reason) => {
                error!(obj = %key, error = %reason, "cannot proceed");
                Disposition::Error(ReconcileError::InconsistentState { key: key.clone(), reason: reason.clone() })
            }
            Action::MutateAndStop | Action::MutateAndRequeue(_) => self.apply(&snap, &decision, phase).await,
        }
    }

    async fn apply(&self, snap: &Snapshot, decision: &Decision, phase: Phase) -> Disposition {
        let key = &snap.key;
        let mut meta = snap.meta.clone();
        codec::encode(&self.keys, &decision.next, &mut meta);
        let patch = MetaPatch::between(&snap.meta, &meta);

        if patch.is_empty() {
            debug!(obj = %key, "decided state already persisted");
        } else {
            if let Err(e) = self.store.update(snap, &patch).await {
                return self.store_failure(key, "update", e);
            }
            counter!("reconcile_mutations_total", 1, "policy" => self.policy.name());
        }

        let count = decision.next.count.as_ref().map(Count::raw).unwrap_or("-");
        match decision.action {
            Action::MutateAndRequeue(wait) => {
                if phase == Phase::Uninitialized {
                    info!(obj = %key, policy = self.policy.name(), count, requeue_after_ms = wait.as_millis() as u64, "initialized state");
                } else {
                    info!(obj = %key, count, requeue_after_ms = wait.as_millis() as u64, "advanced state");
                }
                Disposition::RequeueAfter(wait)
            }
            _ => {
                info!(obj = %key, policy = self.policy.name(), count, "completed; terminal marker written");
                Disposition::Done
            }
        }
    }

    fn store_failure(&self, key: &ObjectKey, op: &'static str, e: StoreError) -> Disposition {
        match e {
            StoreError::NotFound => {
                debug!(obj = %key, op, "object not found; nothing to do");
                Disposition::Done
            }
            StoreError::Conflict => {
                info!(obj = %key, op, "concurrent modification; requeueing immediately");
                counter!("reconcile_conflicts_total", 1);
                Disposition::RequeueAfter(Duration::ZERO)
            }
            StoreError::Unavailable(error) => {
                error!(obj = %key, op, error = %format!("{:#}", error), "object store call failed");
                Disposition::Error(ReconcileError::StoreUnavailable { key: key.clone(), error })
            }
        }
    }
}
