//! Watch/queue side: drives the reconciler from a kube runtime controller and
//! turns dispositions into requeue actions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use kube::{
    core::DynamicObject,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client,
};
use metrics::counter;
use podtick_core::{codec::Keys, ObjectKey, Policy};
use podtick_reconciler::{Disposition, ReconcileError, Reconciler};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::KubeStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// GVK key of the watched kind, e.g. "v1/Pod".
    pub gvk: String,
    /// Namespace to watch (ignored for cluster-scoped kinds).
    pub namespace: String,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

/// Per-object exponential backoff for failed reconciles.
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempts: Mutex::new(HashMap::new()) }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let n = attempts.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        let factor = 1u32.checked_shl(*n - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&self, key: &ObjectKey) {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }
}

struct Ctx {
    reconciler: Reconciler<KubeStore>,
    backoff: Backoff,
}

async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let Some(key) = crate::object_key(&obj) else {
        warn!("object without metadata.name; ignoring");
        return Ok(Action::await_change());
    };
    let disposition = ctx.reconciler.reconcile(&key).await;
    action_for(disposition, &ctx.backoff, &key)
}

/// Map a pass result onto the runtime's scheduling. Any success clears the backoff.
fn action_for(disposition: Disposition, backoff: &Backoff, key: &ObjectKey) -> Result<Action, ReconcileError> {
    match disposition {
        Disposition::Done => {
            backoff.reset(key);
            Ok(Action::await_change())
        }
        Disposition::RequeueAfter(wait) => {
            backoff.reset(key);
            Ok(Action::requeue(wait))
        }
        Disposition::Error(e) => Err(e),
    }
}

fn error_policy(obj: Arc<DynamicObject>, err: &ReconcileError, ctx: Arc<Ctx>) -> Action {
    let Some(key) = crate::object_key(&obj) else {
        return Action::await_change();
    };
    let delay = ctx.backoff.next_delay(&key);
    counter!("reconcile_backoff_total", 1);
    warn!(obj = %key, error = %err, retry_in_ms = delay.as_millis() as u64, "reconcile failed; backing off");
    Action::requeue(delay)
}

/// Run the controller until SIGINT/SIGTERM.
pub async fn run_controller(client: Client, settings: ControllerSettings, policy: Policy, keys: Keys) -> Result<()> {
    let store = KubeStore::for_gvk(client, &settings.gvk).await?;
    let ns = store.namespaced().then_some(settings.namespace.as_str());
    let api = store.api(ns);
    let ar = store.api_resource().clone();

    let ctx = Arc::new(Ctx {
        reconciler: Reconciler::new(store, policy, keys),
        backoff: Backoff::new(settings.backoff_base, settings.backoff_max),
    });

    info!(gvk = %settings.gvk, ns = ?ns, policy = ?policy, "controller starting");
    Controller::new_with(api, watcher::Config::default(), ar)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(obj = %obj, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
