//! Reconciliation policies and the pure decision function.
//!
//! Both policies share one shape: a timestamp/counter pair that only moves
//! forward, a throttle that turns an early invocation into a scheduled wait, and
//! a terminal marker after which every invocation is a no-op.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{Count, Keys, Stamp, State};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TARGET: u64 = 120;

/// Upper bound for TTLs and intervals.
pub const MAX_PERIOD: Duration = Duration::from_secs(366 * 24 * 3600);

/// Stamps are rounded up to whole seconds, so a wait can exceed its period by this much.
const ROUNDING_SLACK: Duration = Duration::from_secs(1);

/// What the bounded-count policy writes on the first pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FirstRun {
    /// Counter starts at 0; the first increment happens one interval later.
    #[default]
    Initialize,
    /// Counter starts at 1.
    Increment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    /// Add a marker label, remove it once `ttl` has passed.
    Expiry { ttl: Duration },
    /// Increment a counter once per `interval` until it reaches `target`.
    BoundedCount { target: u64, interval: Duration, first_run: FirstRun },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    Active,
    Completed,
}

/// Persisted state that cannot be repaired without guessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum Inconsistency {
    #[error("counter is not a non-negative integer: {raw:?}")]
    BadCounter { raw: String },
    #[error("timestamp {stamp:?} present without its counter")]
    MissingCounter { stamp: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOp,
    MutateAndStop,
    MutateAndRequeue(Duration),
    RequeueOnly(Duration),
    Fail(Inconsistency),
}

impl Action {
    pub fn mutates(&self) -> bool {
        matches!(self, Action::MutateAndStop | Action::MutateAndRequeue(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub next: State,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{what} of {secs}s exceeds the {max}s limit")]
    TooLong { what: &'static str, secs: u64, max: u64 },
}

impl Default for Policy {
    fn default() -> Self {
        Self::bounded_count(DEFAULT_TARGET, DEFAULT_INTERVAL)
    }
}

impl Policy {
    pub fn expiry(ttl: Duration) -> Self {
        Policy::Expiry { ttl }
    }

    pub fn bounded_count(target: u64, interval: Duration) -> Self {
        Policy::BoundedCount { target, interval, first_run: FirstRun::Initialize }
    }

    pub fn with_first_run(self, first_run: FirstRun) -> Self {
        match self {
            Policy::BoundedCount { target, interval, .. } => {
                Policy::BoundedCount { target, interval, first_run }
            }
            other => other,
        }
    }

    /// Short name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Expiry { .. } => "expiry",
            Policy::BoundedCount { .. } => "count",
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let (what, period) = match self {
            Policy::Expiry { ttl } => ("ttl", *ttl),
            Policy::BoundedCount { interval, .. } => ("interval", *interval),
        };
        if period.is_zero() {
            return Err(PolicyError::Zero(what));
        }
        if period > MAX_PERIOD {
            return Err(PolicyError::TooLong { what, secs: period.as_secs(), max: MAX_PERIOD.as_secs() });
        }
        Ok(())
    }

    pub fn phase(&self, s: &State) -> Phase {
        let (done, started) = match self {
            Policy::Expiry { .. } => (s.processed, s.expires.is_some() || s.started.is_some()),
            Policy::BoundedCount { .. } => (
                s.finished.is_some(),
                s.updated.is_some() || s.count.is_some() || s.started.is_some(),
            ),
        };
        if done {
            Phase::Completed
        } else if started {
            Phase::Active
        } else {
            Phase::Uninitialized
        }
    }

    /// Key of the timestamp that gates the next transition, if the state has one.
    /// When that stamp is malformed the decision forces progress.
    pub fn gating_key<'k>(&self, keys: &'k Keys, s: &State) -> Option<&'k str> {
        match self {
            Policy::Expiry { .. } if s.expires.is_some() => Some(&keys.expires),
            Policy::Expiry { .. } if s.started.is_some() => Some(&keys.started),
            Policy::Expiry { .. } => None,
            Policy::BoundedCount { .. } => s.updated.as_ref().map(|_| keys.updated.as_str()),
        }
    }

    /// Compute the next state and the action that gets there.
    pub fn decide(&self, state: &State, now: DateTime<Utc>) -> Decision {
        match self.phase(state) {
            Phase::Completed => stay(state, Action::NoOp),
            phase => match *self {
                Policy::Expiry { ttl } => decide_expiry(ttl, phase, state, now),
                Policy::BoundedCount { target, interval, first_run } => {
                    decide_count(target, interval, first_run, phase, state, now)
                }
            },
        }
    }
}

fn decide_expiry(ttl: Duration, phase: Phase, state: &State, now: DateTime<Utc>) -> Decision {
    let mut next = state.clone();
    if phase == Phase::Uninitialized {
        let expires = Stamp::at(after(now, ttl));
        let wait = remaining(now, expires.time());
        next.marker = true;
        next.started = Some(Stamp::at(now));
        next.expires = Some(expires);
        return Decision { next, action: Action::MutateAndRequeue(wait) };
    }

    // No usable deadline means the object is treated as already expired.
    let deadline = match &state.expires {
        Some(s) => s.time(),
        None => state.started.as_ref().and_then(Stamp::time).map(|t| after(t, ttl)),
    };
    if let Some(deadline) = deadline {
        if now < deadline {
            let wait = remaining(now, Some(deadline)).min(ttl.saturating_add(ROUNDING_SLACK));
            return stay(state, Action::RequeueOnly(wait));
        }
    }
    next.marker = false;
    next.processed = true;
    Decision { next, action: Action::MutateAndStop }
}

fn decide_count(
    target: u64,
    interval: Duration,
    first_run: FirstRun,
    phase: Phase,
    state: &State,
    now: DateTime<Utc>,
) -> Decision {
    let mut next = state.clone();
    if phase == Phase::Uninitialized {
        let stamp = Stamp::at(now);
        let first = match first_run {
            FirstRun::Increment if target > 0 => 1,
            _ => 0,
        };
        next.started = Some(stamp.clone());
        next.updated = Some(stamp.clone());
        next.count = Some(Count::of(first));
        return advance(next, stamp, first, target, interval, now);
    }

    let count = match &state.count {
        Some(c) => match c.value() {
            Some(v) => v,
            None => {
                let raw = c.raw().to_string();
                return stay(state, Action::Fail(Inconsistency::BadCounter { raw }));
            }
        },
        None => {
            let stamp = state
                .updated
                .as_ref()
                .or(state.started.as_ref())
                .map(|s| s.raw().to_string())
                .unwrap_or_default();
            return stay(state, Action::Fail(Inconsistency::MissingCounter { stamp }));
        }
    };

    // A missing or malformed last-update counts as "interval elapsed".
    if let Some(last) = state.updated.as_ref().and_then(Stamp::time) {
        let due = after(last, interval);
        if now < due {
            let wait = remaining(now, Some(due)).min(interval.saturating_add(ROUNDING_SLACK));
            return stay(state, Action::RequeueOnly(wait));
        }
    }

    let stamp = Stamp::at(now);
    if count >= target {
        next.finished = Some(stamp);
        return Decision { next, action: Action::MutateAndStop };
    }
    let n = count + 1;
    next.count = Some(Count::of(n));
    next.updated = Some(stamp.clone());
    advance(next, stamp, n, target, interval, now)
}

/// Finish in the same write once `count` hits the target, else wait one interval.
fn advance(
    mut next: State,
    stamp: Stamp,
    count: u64,
    target: u64,
    interval: Duration,
    now: DateTime<Utc>,
) -> Decision {
    if count >= target {
        next.finished = Some(stamp);
        return Decision { next, action: Action::MutateAndStop };
    }
    let wait = remaining(now, stamp.time().map(|t| after(t, interval)));
    Decision { next, action: Action::MutateAndRequeue(wait) }
}

fn stay(state: &State, action: Action) -> Decision {
    Decision { next: state.clone(), action }
}

fn after(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn remaining(now: DateTime<Utc>, until: Option<DateTime<Utc>>) -> Duration {
    until.and_then(|t| (t - now).to_std().ok()).unwrap_or(Duration::ZERO)
}
