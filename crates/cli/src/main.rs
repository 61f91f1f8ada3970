use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use podtick_core::codec::{self, Keys, Malformed, State, DEFAULT_PREFIX};
use podtick_core::policy::{DEFAULT_INTERVAL, DEFAULT_TARGET, DEFAULT_TTL};
use podtick_core::{Action, FirstRun, MetaPatch, ObjectKey, Phase, Policy, Snapshot};
use podtick_kubehub::{ControllerSettings, KubeStore};
use podtick_reconciler::{Disposition, MemStore, ObjectStore, Reconciler};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "podtick", version, about = "Annotation-driven reconcile loop")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch
    #[arg(long = "namespace", env = "POD_NAMESPACE", global = true, default_value = "default")]
    namespace: String,

    /// GVK key of the watched kind, e.g. "v1/Pod" or "apps/v1/Deployment"
    #[arg(long = "gvk", env = "PODTICK_GVK", global = true, default_value = "v1/Pod")]
    gvk: String,

    #[command(flatten)]
    policy: PolicyArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PolicyKind { Expiry, Count }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum FirstRunArg { Initialize, Increment }

#[derive(Args, Debug)]
struct PolicyArgs {
    /// Which state machine to run
    #[arg(long = "policy", value_enum, env = "PODTICK_POLICY", global = true, default_value_t = PolicyKind::Count)]
    kind: PolicyKind,
    /// Expiry policy: seconds until the marker label is removed
    #[arg(long = "ttl-secs", env = "PODTICK_TTL_SECS", global = true, default_value_t = DEFAULT_TTL.as_secs())]
    ttl_secs: u64,
    /// Count policy: seconds between increments
    #[arg(long = "interval-secs", env = "PODTICK_INTERVAL_SECS", global = true, default_value_t = DEFAULT_INTERVAL.as_secs())]
    interval_secs: u64,
    /// Count policy: value at which the object is marked complete
    #[arg(long = "target", env = "PODTICK_TARGET", global = true, default_value_t = DEFAULT_TARGET)]
    target: u64,
    /// Count policy: write 0 or 1 on the first pass
    #[arg(long = "first-run", value_enum, env = "PODTICK_FIRST_RUN", global = true, default_value_t = FirstRunArg::Initialize)]
    first_run: FirstRunArg,
    /// Prefix of every label/annotation key the controller owns
    #[arg(long = "key-prefix", env = "PODTICK_KEY_PREFIX", global = true, default_value = DEFAULT_PREFIX)]
    key_prefix: String,
}

impl PolicyArgs {
    fn policy(&self) -> Result<Policy> {
        let policy = match self.kind {
            PolicyKind::Expiry => Policy::expiry(Duration::from_secs(self.ttl_secs)),
            PolicyKind::Count => {
                let first_run = match self.first_run {
                    FirstRunArg::Initialize => FirstRun::Initialize,
                    FirstRunArg::Increment => FirstRun::Increment,
                };
                Policy::bounded_count(self.target, Duration::from_secs(self.interval_secs)).with_first_run(first_run)
            }
        };
        policy.validate().context("invalid policy configuration")?;
        Ok(policy)
    }

    fn keys(&self) -> Keys {
        Keys::with_prefix(self.key_prefix.trim_end_matches('/'))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until SIGINT/SIGTERM
    Run {
        /// First retry delay after a failed reconcile
        #[arg(long = "backoff-base-ms", env = "PODTICK_BACKOFF_BASE_MS", default_value_t = 500)]
        backoff_base_ms: u64,
        /// Upper bound for the retry delay
        #[arg(long = "backoff-max-secs", env = "PODTICK_BACKOFF_MAX_SECS", default_value_t = 300)]
        backoff_max_secs: u64,
    },
    /// Show the decoded state of one live object and what the controller would do now
    Inspect {
        /// Object name
        name: String,
    },
    /// Evaluate one reconcile pass offline over an object read from stdin as JSON
    Decide {
        /// Evaluate at this RFC 3339 time instead of now
        #[arg(long = "at")]
        at: Option<String>,
    },
}

/// What one pass sees and decides for an object.
#[derive(Serialize)]
struct Report {
    object: ObjectKey,
    policy: Policy,
    phase: Phase,
    state: State,
    malformed: Vec<Malformed>,
    action: Action,
    patch: MetaPatch,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<String>,
}

impl Report {
    fn preview(policy: &Policy, keys: &Keys, snap: &Snapshot, now: DateTime<Utc>) -> Self {
        let (state, malformed) = codec::decode(keys, &snap.meta);
        let decision = policy.decide(&state, now);
        let mut after = snap.meta.clone();
        if decision.action.mutates() {
            codec::encode(keys, &decision.next, &mut after);
        }
        Self {
            object: snap.key.clone(),
            policy: *policy,
            phase: policy.phase(&state),
            state,
            malformed,
            action: decision.action,
            patch: MetaPatch::between(&snap.meta, &after),
            outcome: None,
        }
    }

    fn print(&self, output: Output) -> Result<()> {
        match output {
            Output::Json => println!("{}", serde_json::to_string_pretty(self)?),
            Output::Human => {
                println!("object:  {}", self.object);
                println!("policy:  {}", self.policy.name());
                println!("phase:   {:?}", self.phase);
                let s = &self.state;
                let fields = [
                    ("started", s.started.as_ref().map(|v| v.raw())),
                    ("updated", s.updated.as_ref().map(|v| v.raw())),
                    ("expires", s.expires.as_ref().map(|v| v.raw())),
                    ("count", s.count.as_ref().map(|v| v.raw())),
                    ("finished", s.finished.as_ref().map(|v| v.raw())),
                ];
                for (name, value) in fields {
                    if let Some(v) = value {
                        println!("{:<8} {}", format!("{}:", name), v);
                    }
                }
                if s.marker || s.processed {
                    println!("markers: label={} processed={}", s.marker, s.processed);
                }
                for m in &self.malformed {
                    println!("malformed: {} = {:?}", m.key, m.raw);
                }
                println!("action:  {}", render_action(&self.action));
                for (k, v) in self.patch.labels.iter() {
                    println!("  label {}", render_change(k, v));
                }
                for (k, v) in self.patch.annotations.iter() {
                    println!("  annotation {}", render_change(k, v));
                }
                if let Some(outcome) = &self.outcome {
                    println!("outcome: {}", outcome);
                }
            }
        }
        Ok(())
    }
}

fn render_action(a: &Action) -> String {
    match a {
        Action::NoOp => "none (completed)".to_string(),
        Action::MutateAndStop => "write and stop".to_string(),
        Action::MutateAndRequeue(d) => format!("write, requeue in {}", render_wait(*d)),
        Action::RequeueOnly(d) => format!("wait {}", render_wait(*d)),
        Action::Fail(reason) => format!("fail: {}", reason),
    }
}

fn render_change(key: &str, value: &Option<String>) -> String {
    match value {
        Some(v) => format!("+ {}={}", key, v),
        None => format!("- {}", key),
    }
}

fn render_wait(d: Duration) -> String {
    let ms = d.as_millis();
    if ms >= 1000 && ms % 1000 == 0 { format!("{}s", ms / 1000) } else { format!("{}ms", ms) }
}

fn render_disposition(d: &Disposition) -> String {
    match d {
        Disposition::Done => "done".to_string(),
        Disposition::RequeueAfter(w) => format!("requeue after {}", render_wait(*w)),
        Disposition::Error(e) => format!("error: {}", e),
    }
}

fn init_tracing() {
    let env = std::env::var("PODTICK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PODTICK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PODTICK_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_at(at: Option<&str>) -> Result<DateTime<Utc>> {
    match at {
        Some(s) => Ok(DateTime::parse_from_rfc3339(s)
            .map_err(|e| anyhow!("--at {:?}: {}", s, e))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let policy = cli.policy.policy()?;
    let keys = cli.policy.keys();

    match cli.command {
        Commands::Run { backoff_base_ms, backoff_max_secs } => {
            let settings = ControllerSettings {
                gvk: cli.gvk.clone(),
                namespace: cli.namespace.clone(),
                backoff_base: Duration::from_millis(backoff_base_ms.max(1)),
                backoff_max: Duration::from_secs(backoff_max_secs.max(1)),
            };
            info!(ns = %settings.namespace, gvk = %settings.gvk, policy = policy.name(), prefix = %cli.policy.key_prefix, "starting controller");
            let client = podtick_kubehub::get_kube_client().await?;
            podtick_kubehub::run_controller(client, settings, policy, keys).await?;
        }
        Commands::Inspect { name } => {
            let client = podtick_kubehub::get_kube_client().await?;
            let store = KubeStore::for_gvk(client, &cli.gvk).await?;
            let ns = store.namespaced().then_some(cli.namespace.as_str());
            let key = ObjectKey::new(ns, &name);
            let snap = store.get(&key).await.with_context(|| format!("fetching {}", key))?;
            Report::preview(&policy, &keys, &snap, Utc::now()).print(cli.output)?;
        }
        Commands::Decide { at } => {
            let now = parse_at(at.as_deref())?;
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input).context("reading object from stdin")?;
            let raw: serde_json::Value = serde_json::from_str(&input).context("stdin is not JSON")?;
            let snap = podtick_kubehub::snapshot_from_json(&raw)?;

            let store = Arc::new(MemStore::new());
            store.put(snap.key.clone(), snap.meta.clone());
            let rec = Reconciler::new(Arc::clone(&store), policy, keys.clone());
            let disposition = rec.reconcile_at(&snap.key, now).await;

            let mut report = Report::preview(&policy, &keys, &snap, now);
            let after = store.meta(&snap.key).unwrap_or_default();
            report.patch = MetaPatch::between(&snap.meta, &after);
            report.outcome = Some(render_disposition(&disposition));
            report.print(cli.output)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_count_to_120_once_per_second() {
        let cli = Cli::try_parse_from(["podtick", "run"]).unwrap();
        assert_eq!(cli.policy.policy().unwrap(), Policy::bounded_count(120, Duration::from_secs(1)));
        assert_eq!(cli.policy.keys(), Keys::default());
        assert_eq!(cli.gvk, "v1/Pod");
    }

    #[test]
    fn expiry_flags() {
        let cli = Cli::try_parse_from(["podtick", "--policy", "expiry", "--ttl-secs", "90", "--key-prefix", "example.com/", "run"]).unwrap();
        assert_eq!(cli.policy.policy().unwrap(), Policy::expiry(Duration::from_secs(90)));
        assert_eq!(cli.policy.keys().marker_label, "example.com/ttl");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let cli = Cli::try_parse_from(["podtick", "--interval-secs", "0", "run"]).unwrap();
        assert!(cli.policy.policy().is_err());
    }

    #[test]
    fn preview_lists_changes_without_writing() {
        let snap = Snapshot {
            key: ObjectKey::namespaced("default", "web-0"),
            resource_version: Some("1".into()),
            meta: Default::default(),
        };
        let now = parse_at(Some("2024-05-01T10:00:00Z")).unwrap();
        let r = Report::preview(&Policy::expiry(Duration::from_secs(60)), &Keys::default(), &snap, now);
        assert_eq!(r.phase, Phase::Uninitialized);
        assert_eq!(r.action, Action::MutateAndRequeue(Duration::from_secs(60)));
        assert_eq!(r.patch.labels.get("mycontrollercheck/ttl"), Some(&Some("true".to_string())));
        assert_eq!(render_action(&r.action), "write, requeue in 60s");
    }

    #[test]
    fn wait_rendering() {
        assert_eq!(render_wait(Duration::from_millis(600)), "600ms");
        assert_eq!(render_wait(Duration::from_secs(2)), "2s");
        assert_eq!(render_wait(Duration::ZERO), "0ms");
    }
}
