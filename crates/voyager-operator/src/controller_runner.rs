//! Controller runner - builds the Ingress controller future
//!
//! Referenced Services, Endpoints, Secrets and ConfigMaps are mapped back to
//! Ingresses through the shared [`ReferenceIndex`]; offshoots are mapped back
//! through their `origin-name` label so out-of-band edits and deletions are
//! repaired without waiting for the periodic resync.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use voyager_common::crd::Ingress;
use voyager_common::kube_utils::owning_ingress;
use voyager_common::OFFSHOOT_SELECTOR;
use voyager_ingress::controller::{error_policy, reconcile, IngressContext};
use voyager_ingress::{ObjectKey, OperatorConfig, RefKind, ReferenceIndex};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Ingresses to requeue when the object described by `meta` changes.
///
/// `kind` is `None` for kinds the controller only ever creates itself.
fn affected_ingresses(
    index: &ReferenceIndex,
    kind: Option<RefKind>,
    meta: &ObjectMeta,
) -> Vec<ObjectRef<Ingress>> {
    let (Some(namespace), Some(name)) = (meta.namespace.as_deref(), meta.name.as_deref()) else {
        return vec![];
    };

    let mut affected: BTreeSet<ObjectKey> = BTreeSet::new();
    if let Some(kind) = kind {
        affected.extend(index.ingresses_for(kind, &ObjectKey::new(namespace, name)));
    }
    if let Some(owner) = owning_ingress(meta) {
        affected.insert(ObjectKey::new(namespace, owner));
    }

    if !affected.is_empty() {
        tracing::debug!(
            object = %name,
            namespace = %namespace,
            affected_count = affected.len(),
            "Triggering re-reconciliation of affected ingresses"
        );
    }

    affected
        .into_iter()
        .map(|key| ObjectRef::<Ingress>::new(&key.name).within(&key.namespace))
        .collect()
}

/// Build the Ingress controller future
pub fn build_ingress_controller(
    client: Client,
    config: OperatorConfig,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let ctx = Arc::new(IngressContext::from_client(client.clone(), config));
    let namespace = ctx.config.watch_namespace.clone();
    let ns = namespace.as_deref();

    match ns {
        Some(ns) => tracing::info!(namespace = %ns, "- Ingress controller (single namespace)"),
        None => tracing::info!("- Ingress controller (all namespaces)"),
    }

    let index = ctx.index.clone();
    let services_index = index.clone();
    let endpoints_index = index.clone();
    let secrets_index = index.clone();
    let config_maps_index = index.clone();
    let deployments_index = index.clone();
    let daemon_sets_index = index;

    Box::pin(
        Controller::new(scoped::<Ingress>(&client, ns), watcher_config())
            .watches(scoped::<Service>(&client, ns), watcher_config(), move |svc| {
                affected_ingresses(&services_index, Some(RefKind::Service), &svc.metadata)
            })
            .watches(scoped::<Endpoints>(&client, ns), watcher_config(), move |ep| {
                affected_ingresses(&endpoints_index, Some(RefKind::Endpoints), &ep.metadata)
            })
            .watches(scoped::<Secret>(&client, ns), watcher_config(), move |secret| {
                affected_ingresses(&secrets_index, Some(RefKind::Secret), &secret.metadata)
            })
            .watches(scoped::<ConfigMap>(&client, ns), watcher_config(), move |cm| {
                affected_ingresses(&config_maps_index, Some(RefKind::ConfigMap), &cm.metadata)
            })
            .watches(
                scoped::<Deployment>(&client, ns),
                watcher_config().labels(OFFSHOOT_SELECTOR),
                move |deploy| affected_ingresses(&deployments_index, None, &deploy.metadata),
            )
            .watches(
                scoped::<DaemonSet>(&client, ns),
                watcher_config().labels(OFFSHOOT_SELECTOR),
                move |ds| affected_ingresses(&daemon_sets_index, None, &ds.metadata),
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Ingress")),
    )
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
