//! Watch loop that feeds `GeneratedSecret` keys to the engine.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gensec_reconcile::{ReconcileError, Reconciler};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::crd::GeneratedSecret;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    /// Requeue converged objects after this long; `None` waits for changes.
    pub resync: Option<Duration>,
    /// Delay before retrying a failed invocation.
    pub retry_after: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { namespace: None, resync: None, retry_after: Duration::from_secs(15) }
    }
}

struct Context {
    reconciler: Reconciler,
    opts: ControllerOptions,
}

async fn reconcile(gs: Arc<GeneratedSecret>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    // The engine re-reads the object itself; the watch event only names the key.
    ctx.reconciler.reconcile(&gs.key()).await?;
    Ok(match ctx.opts.resync {
        Some(every) => Action::requeue(every),
        None => Action::await_change(),
    })
}

fn error_policy(gs: Arc<GeneratedSecret>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    counter!("gensec_controller_requeue_total", 1u64, "kind" => err.kind().as_str());
    debug!(key = %gs.key(), kind = err.kind().as_str(), retry_after = ?ctx.opts.retry_after, "requeue after error");
    Action::requeue(ctx.opts.retry_after)
}

/// Run until SIGINT/SIGTERM. Keys are never reconciled concurrently with themselves.
pub async fn run_controller(client: Client, reconciler: Reconciler, opts: ControllerOptions) -> anyhow::Result<()> {
    let (blueprints, secrets): (Api<GeneratedSecret>, Api<Secret>) = match opts.namespace.as_deref() {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    info!(ns = ?opts.namespace, resync = ?opts.resync, "controller started");
    let ctx = Arc::new(Context { reconciler, opts });
    Controller::new(blueprints, watcher::Config::default())
        // Secret deletions and edits redeliver the owning key.
        .owns(secrets, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(obj = %obj, "reconciled"),
                Err(kube::runtime::controller::Error::ReconcilerFailed(_, _)) => {}
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
