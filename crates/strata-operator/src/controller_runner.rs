//! Controller runner - builds one controller future per resource kind
//!
//! `build_controllers` returns boxed futures that the caller joins. All
//! controllers share one [`Context`], so the crontab and the agent connector
//! are common to every kind.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use strata_common::crd::{
    Backup, Chat, Database, Grant, Instance, Managed, Operation, Store, User,
};
use strata_common::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_STRATA};

use crate::context::Context;
use crate::controller::{self, error_policy};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build controller futures for every Strata resource kind.
///
/// With `namespace` set, only that namespace is watched.
pub fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<String>,
) -> Vec<ControllerFuture> {
    let ns = namespace.as_deref();
    match ns {
        Some(ns) => tracing::info!(namespace = %ns, "Watching a single namespace"),
        None => tracing::info!("Watching all namespaces"),
    }

    let workloads = watcher().labels(&format!("{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_STRATA}"));

    tracing::info!("- Instance controller");
    let instances = Box::pin(
        Controller::new(api::<Instance>(&client, ns), watcher())
            .owns(api::<StatefulSet>(&client, ns), workloads)
            .shutdown_on_signal()
            .run(controller::instance::reconcile, error_policy::<Instance>, ctx.clone())
            .for_each(log_reconcile_result("Instance")),
    );

    vec![
        instances,
        simple::<Store, _, _>(&client, ns, controller::store::reconcile, ctx.clone(), "Store"),
        simple::<Chat, _, _>(&client, ns, controller::chat::reconcile, ctx.clone(), "Chat"),
        simple::<Database, _, _>(
            &client,
            ns,
            controller::database::reconcile,
            ctx.clone(),
            "Database",
        ),
        simple::<User, _, _>(&client, ns, controller::user::reconcile, ctx.clone(), "User"),
        simple::<Grant, _, _>(&client, ns, controller::grant::reconcile, ctx.clone(), "Grant"),
        simple::<Backup, _, _>(&client, ns, controller::backup::reconcile, ctx.clone(), "Backup"),
        simple::<Operation, _, _>(
            &client,
            ns,
            controller::operation::reconcile,
            ctx,
            "Operation",
        ),
    ]
}

/// Controller for a kind that watches nothing but itself
fn simple<K, F, Fut>(
    client: &Client,
    namespace: Option<&str>,
    reconcile: F,
    ctx: Arc<Context>,
    name: &'static str,
) -> ControllerFuture
where
    K: Managed + Resource<Scope = k8s_openapi::NamespaceResourceScope> + DeserializeOwned,
    F: FnMut(Arc<K>, Arc<Context>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<kube::runtime::controller::Action, strata_common::Error>>
        + Send
        + 'static,
{
    tracing::info!("- {} controller", name);
    Box::pin(
        Controller::new(api::<K>(client, namespace), watcher())
            .shutdown_on_signal()
            .run(reconcile, error_policy::<K>, ctx)
            .for_each(log_reconcile_result(name)),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
