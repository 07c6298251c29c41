//! Controller runner - builds the controller futures for both CRDs
//!
//! The caller decides how to drive the returned futures; this keeps controller
//! construction free of process concerns like signal handling.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use super::{buildkit, template, Context};
use crate::crd::{Buildkit, BuildkitTemplate};

/// A controller loop, boxed so loops of different object types share a type
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the Buildkit and BuildkitTemplate controller futures
///
/// Both controllers share one context. Pods and ConfigMaps are watched through
/// their owner references so a deleted or failed pod triggers its instance.
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let namespace = ctx.config.watch_namespace.as_deref();
    let watcher = || WatcherConfig::default().timeout(ctx.config.watch_timeout_secs);

    match namespace {
        Some(ns) => tracing::info!(namespace = %ns, "watching a single namespace"),
        None => tracing::info!("watching all namespaces"),
    }

    let buildkits: Api<Buildkit> = scoped(&client, namespace);
    let pods: Api<Pod> = scoped(&client, namespace);
    let templates: Api<BuildkitTemplate> = scoped(&client, namespace);
    let config_maps: Api<ConfigMap> = scoped(&client, namespace);

    tracing::info!("- Buildkit controller");
    let buildkit_ctrl = Controller::new(buildkits, watcher())
        .owns(pods, watcher())
        .shutdown_on_signal()
        .run(buildkit::reconcile, buildkit::error_policy, ctx.clone())
        .for_each(log_reconcile_result("Buildkit"));

    tracing::info!("- BuildkitTemplate controller");
    let template_ctrl = Controller::new(templates, watcher())
        .owns(config_maps, watcher())
        .shutdown_on_signal()
        .run(template::reconcile, template::error_policy, ctx.clone())
        .for_each(log_reconcile_result("BuildkitTemplate"));

    vec![Box::pin(buildkit_ctrl), Box::pin(template_ctrl)]
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
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
