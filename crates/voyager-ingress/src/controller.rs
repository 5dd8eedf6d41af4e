//! Ingress controller implementation
//!
//! Each pass recomputes the full desired state from live inputs: resolve every
//! referenced object, compile the routing model into `haproxy.cfg`, build the
//! offshoots and server-side apply whichever of them drifted from the desired
//! spec hash. A compile failure stops the pass before anything is applied, so
//! the last good config stays live.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use voyager_common::crd::{
    Condition, ConditionStatus, Ingress, IngressPhase, IngressStatus, LoadBalancerStatus,
};
use voyager_common::events::{actions, reasons, EventPublisher};
use voyager_common::kube_utils::{is_not_found, offshoot_name, owning_ingress};
use voyager_common::metrics::{record_offshoot_restored, ReconcileTimer};
use voyager_common::KubeEventPublisher;
#[cfg(test)]
use voyager_common::NoopEventPublisher;
use voyager_common::{CLEANUP_FINALIZER, FIELD_MANAGER};

use crate::compiler::{references, CompiledIngress, IngressCompiler, ObjectKey, ResolvedInputs};
use crate::config::OperatorConfig;
use crate::index::ReferenceIndex;
use crate::retry::RetryTracker;
use crate::workload::{
    load_balancer_status, possible_offshoots, Offshoot, OffshootKind, WorkloadCompiler,
};
use crate::Error;

const CONTROLLER_NAME: &str = "voyager-ingress-controller";
const SYNCED_MESSAGE: &str = "HAProxy configuration applied";

// =============================================================================
// Kubernetes client seam
// =============================================================================

/// Kubernetes operations the reconciler needs
///
/// Mocked in unit tests and backed by an in-memory cluster in the
/// convergence tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngressKubeClient: Send + Sync {
    /// Merge-patch the status subresource of an Ingress
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &IngressStatus,
    ) -> Result<(), Error>;

    /// Replace the finalizer list of an Ingress
    async fn set_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    async fn get_endpoints(&self, name: &str, namespace: &str)
        -> Result<Option<Endpoints>, Error>;

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error>;

    /// Pods matching a Service selector
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, Error>;

    async fn get_offshoot(
        &self,
        kind: OffshootKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Offshoot>, Error>;

    /// Server-side apply an offshoot, returning the object the API server stored
    async fn apply(&self, namespace: &str, offshoot: &Offshoot) -> Result<Offshoot, Error>;

    /// Delete an offshoot; a missing object is not an error
    async fn delete(&self, kind: OffshootKind, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeIngressClient {
    client: Client,
}

impl KubeIngressClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_opt<K>(&self, name: &str, namespace: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_typed<K>(&self, namespace: &str, obj: &K) -> Result<K, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::internal_with_context("apply", "offshoot has no name"))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(api.patch(&name, &params, &Patch::Apply(obj)).await?)
    }

    async fn delete_typed<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl IngressKubeClient for KubeIngressClient {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &IngressStatus,
    ) -> Result<(), Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn set_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        self.get_opt(name, namespace).await
    }

    async fn get_endpoints(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Endpoints>, Error> {
        self.get_opt(name, namespace).await
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        self.get_opt(name, namespace).await
    }

    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        self.get_opt(name, namespace).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    async fn get_offshoot(
        &self,
        kind: OffshootKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Offshoot>, Error> {
        Ok(match kind {
            OffshootKind::ServiceAccount => self
                .get_opt::<ServiceAccount>(name, namespace)
                .await?
                .map(Offshoot::ServiceAccount),
            OffshootKind::Role => self
                .get_opt::<Role>(name, namespace)
                .await?
                .map(Offshoot::Role),
            OffshootKind::RoleBinding => self
                .get_opt::<RoleBinding>(name, namespace)
                .await?
                .map(Offshoot::RoleBinding),
            OffshootKind::ConfigMap => self
                .get_opt::<ConfigMap>(name, namespace)
                .await?
                .map(Offshoot::ConfigMap),
            OffshootKind::Secret => self
                .get_opt::<Secret>(name, namespace)
                .await?
                .map(Offshoot::Secret),
            OffshootKind::Service => self
                .get_opt::<Service>(name, namespace)
                .await?
                .map(Offshoot::Service),
            OffshootKind::Deployment => self
                .get_opt::<Deployment>(name, namespace)
                .await?
                .map(Offshoot::Deployment),
            OffshootKind::DaemonSet => self
                .get_opt::<DaemonSet>(name, namespace)
                .await?
                .map(Offshoot::DaemonSet),
        })
    }

    async fn apply(&self, namespace: &str, offshoot: &Offshoot) -> Result<Offshoot, Error> {
        Ok(match offshoot {
            Offshoot::ServiceAccount(o) => {
                Offshoot::ServiceAccount(self.apply_typed(namespace, o).await?)
            }
            Offshoot::Role(o) => Offshoot::Role(self.apply_typed(namespace, o).await?),
            Offshoot::RoleBinding(o) => {
                Offshoot::RoleBinding(self.apply_typed(namespace, o).await?)
            }
            Offshoot::ConfigMap(o) => Offshoot::ConfigMap(self.apply_typed(namespace, o).await?),
            Offshoot::Secret(o) => Offshoot::Secret(self.apply_typed(namespace, o).await?),
            Offshoot::Service(o) => Offshoot::Service(self.apply_typed(namespace, o).await?),
            Offshoot::Deployment(o) => {
                Offshoot::Deployment(self.apply_typed(namespace, o).await?)
            }
            Offshoot::DaemonSet(o) => Offshoot::DaemonSet(self.apply_typed(namespace, o).await?),
        })
    }

    async fn delete(&self, kind: OffshootKind, namespace: &str, name: &str) -> Result<(), Error> {
        match kind {
            OffshootKind::ServiceAccount => self.delete_typed::<ServiceAccount>(namespace, name).await,
            OffshootKind::Role => self.delete_typed::<Role>(namespace, name).await,
            OffshootKind::RoleBinding => self.delete_typed::<RoleBinding>(namespace, name).await,
            OffshootKind::ConfigMap => self.delete_typed::<ConfigMap>(namespace, name).await,
            OffshootKind::Secret => self.delete_typed::<Secret>(namespace, name).await,
            OffshootKind::Service => self.delete_typed::<Service>(namespace, name).await,
            OffshootKind::Deployment => self.delete_typed::<Deployment>(namespace, name).await,
            OffshootKind::DaemonSet => self.delete_typed::<DaemonSet>(namespace, name).await,
        }
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context shared across all reconciliation calls
pub struct IngressContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn IngressKubeClient>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Referenced object → ingress index, shared with the watch mappers
    pub index: Arc<ReferenceIndex>,
    /// Per-ingress backoff for retryable failures
    pub retries: Arc<RetryTracker>,
    pub config: OperatorConfig,
}

impl IngressContext {
    pub fn new(
        kube: Arc<dyn IngressKubeClient>,
        events: Arc<dyn EventPublisher>,
        index: Arc<ReferenceIndex>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            kube,
            events,
            index,
            retries: Arc::new(RetryTracker::new()),
            config,
        }
    }

    /// Create a context backed by a real client.
    ///
    /// The returned context owns a fresh [`ReferenceIndex`]; the operator hands
    /// the same `Arc` to its watch mappers.
    pub fn from_client(client: Client, config: OperatorConfig) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self::new(
            Arc::new(KubeIngressClient::new(client)),
            events,
            Arc::new(ReferenceIndex::new()),
            config,
        )
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn IngressKubeClient>) -> Self {
        Self::new(
            kube,
            Arc::new(NoopEventPublisher),
            Arc::new(ReferenceIndex::new()),
            OperatorConfig::default(),
        )
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile an Ingress
///
/// The pass is bounded by `reconcile_timeout`; an abandoned pass surfaces as a
/// retryable internal error and is requeued through [`error_policy`].
#[instrument(skip(ingress, ctx), fields(ingress = %ingress.name_any()))]
pub async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<IngressContext>) -> Result<Action, Error> {
    let key = ingress_key(&ingress)?;
    let timer = ReconcileTimer::start(key.to_string());

    let result = match tokio::time::timeout(
        ctx.config.reconcile_timeout,
        reconcile_pass(&ingress, &key, &ctx),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::internal_with_context(
            "reconcile",
            format!(
                "pass exceeded {}s and was abandoned",
                ctx.config.reconcile_timeout.as_secs()
            ),
        )),
    };

    match &result {
        Ok(_) => {
            ctx.retries.reset(&key);
            timer.success();
        }
        Err(e) => timer.error(e.class()),
    }
    result
}

/// Error policy for the ingress controller
///
/// Config and reference errors wait for a change (the reference index
/// requeues the ingress once a missing object appears). Everything else backs
/// off per ingress.
pub fn error_policy(ingress: Arc<Ingress>, error: &Error, ctx: Arc<IngressContext>) -> Action {
    error!(
        ?error,
        ingress = %ingress.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if !error.is_retryable() {
        return Action::await_change();
    }
    match ingress_key(&ingress) {
        Ok(key) => ctx.retries.next_action(&key),
        Err(_) => Action::await_change(),
    }
}

fn ingress_key(ingress: &Ingress) -> Result<ObjectKey, Error> {
    let name = ingress.name_any();
    let namespace = ingress
        .namespace()
        .ok_or_else(|| Error::config_for(name.as_str(), "ingress is missing a namespace"))?;
    Ok(ObjectKey::new(namespace, name))
}

fn has_finalizer(ingress: &Ingress) -> bool {
    ingress.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
}

fn current_phase(ingress: &Ingress) -> IngressPhase {
    ingress
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or_default()
}

async fn reconcile_pass(
    ingress: &Ingress,
    key: &ObjectKey,
    ctx: &IngressContext,
) -> Result<Action, Error> {
    if ingress.metadata.deletion_timestamp.is_some() {
        info!("ingress deleted, releasing offshoots");
        return release(ingress, key, ctx).await;
    }

    if !ctx.config.accepts(ingress) {
        if has_finalizer(ingress) {
            info!("ingress class no longer matches, releasing offshoots");
            return release(ingress, key, ctx).await;
        }
        debug!("ingress class not handled by this operator");
        return Ok(Action::await_change());
    }

    if !has_finalizer(ingress) {
        let mut finalizers = ingress.finalizers().to_vec();
        finalizers.push(CLEANUP_FINALIZER.to_string());
        ctx.kube
            .set_finalizers(&key.name, &key.namespace, finalizers)
            .await?;
    }

    let phase = current_phase(ingress);
    if phase == IngressPhase::Pending {
        update_status(ingress, ctx, StatusUpdate::syncing()).await?;
    }

    let compiled = match compile(ingress, key, ctx).await {
        Ok(compiled) => compiled,
        Err(e) => return Err(fail(ingress, ctx, e).await),
    };
    debug!(checksum = %compiled.checksum, "compiled ingress");

    let load_balancer = sync_offshoots(ingress, key, ctx, &compiled, phase).await?;

    update_status(
        ingress,
        ctx,
        StatusUpdate::synced(&compiled.checksum, load_balancer),
    )
    .await?;
    Ok(Action::requeue(ctx.config.resync_period))
}

/// Resolve every referenced object, record the references and compile.
///
/// Secrets named by Service annotations only become visible once the Services
/// are fetched, so references are gathered in two passes.
async fn compile(
    ingress: &Ingress,
    key: &ObjectKey,
    ctx: &IngressContext,
) -> Result<CompiledIngress, Error> {
    let mut inputs = ResolvedInputs::default();

    let direct = references(ingress, &BTreeMap::new()).map_err(|e| e.into_error(&key.name))?;
    for svc in &direct.services {
        if let Some(service) = ctx.kube.get_service(&svc.name, &svc.namespace).await? {
            inputs.services.insert(svc.clone(), service);
        }
    }

    let refs = references(ingress, &inputs.services).map_err(|e| e.into_error(&key.name))?;
    ctx.index.update(key, &refs);

    for svc in &refs.services {
        if let Some(endpoints) = ctx.kube.get_endpoints(&svc.name, &svc.namespace).await? {
            inputs.endpoints.insert(svc.clone(), endpoints);
        }
        let selector = inputs
            .services
            .get(svc)
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.selector.clone())
            .unwrap_or_default();
        if selector.is_empty() {
            continue;
        }
        for pod in ctx.kube.list_pods(&svc.namespace, &selector).await? {
            inputs
                .pods
                .insert(ObjectKey::new(svc.namespace.as_str(), pod.name_any()), pod);
        }
    }
    for secret in &refs.secrets {
        if let Some(s) = ctx.kube.get_secret(&secret.name, &secret.namespace).await? {
            inputs.secrets.insert(secret.clone(), s);
        }
    }
    for cm in &refs.config_maps {
        if let Some(c) = ctx.kube.get_config_map(&cm.name, &cm.namespace).await? {
            inputs.config_maps.insert(cm.clone(), c);
        }
    }

    IngressCompiler::new(&inputs)
        .compile(ingress)
        .map_err(|e| e.into_error(&key.name))
}

/// Surface a failed pass on the ingress and hand the error back.
///
/// API errors are transient and only logged; everything else marks the
/// ingress Failed without touching the applied offshoots.
async fn fail(ingress: &Ingress, ctx: &IngressContext, err: Error) -> Error {
    if matches!(err, Error::Kube { .. }) {
        return err;
    }
    let message = err.to_string();
    warn!(error = %message, "compilation failed, keeping last applied config");

    if !is_status_unchanged(ingress, IngressPhase::Failed, &message) {
        let reason = match err {
            Error::Reference { .. } => reasons::REFERENCE_MISSING,
            _ => reasons::COMPILATION_FAILED,
        };
        ctx.events
            .publish(
                &ingress.object_ref(&()),
                EventType::Warning,
                reason,
                actions::COMPILE,
                Some(message.clone()),
            )
            .await;
    }
    if let Err(patch_err) = update_status(ingress, ctx, StatusUpdate::failed(&message)).await {
        return patch_err;
    }
    err
}

/// Apply every drifted offshoot and delete stale ones.
///
/// Returns the load balancer addresses of the main Service, when assigned.
async fn sync_offshoots(
    ingress: &Ingress,
    key: &ObjectKey,
    ctx: &IngressContext,
    compiled: &CompiledIngress,
    phase: IngressPhase,
) -> Result<Option<LoadBalancerStatus>, Error> {
    let namespace = key.namespace.as_str();
    let main_service = offshoot_name(&key.name);
    let offshoots = WorkloadCompiler::compile(compiled, &ingress.spec, &ctx.config).into_offshoots();

    let mut wanted = BTreeSet::new();
    let mut load_balancer = None;

    for mut desired in offshoots {
        desired.stamp_spec_hash()?;
        let kind = desired.kind();
        let name = desired.name().to_string();
        wanted.insert((kind, name.clone()));

        let live = ctx.kube.get_offshoot(kind, namespace, &name).await?;
        let stored = match &live {
            Some(live) if desired.is_current(live) => live.clone(),
            _ => {
                let restored = live.is_none() && phase == IngressPhase::Synced;
                if let Some(live) = &live {
                    desired.preserve_live(live);
                }
                let stored = ctx.kube.apply(namespace, &desired).await?;
                debug!(%kind, %name, "applied offshoot");

                if restored {
                    info!(%kind, %name, "restored missing offshoot");
                    record_offshoot_restored(kind.as_str());
                    ctx.events
                        .publish(
                            &ingress.object_ref(&()),
                            EventType::Normal,
                            reasons::OFFSHOOT_RESTORED,
                            actions::APPLY,
                            Some(format!("recreated {} {}", kind, name)),
                        )
                        .await;
                } else if kind == OffshootKind::ConfigMap {
                    ctx.events
                        .publish(
                            &ingress.object_ref(&()),
                            EventType::Normal,
                            reasons::CONFIG_UPDATED,
                            actions::APPLY,
                            Some(format!("config checksum {}", compiled.checksum)),
                        )
                        .await;
                }
                stored
            }
        };

        if let Offshoot::Service(service) = &stored {
            if name == main_service {
                load_balancer = load_balancer_status(service);
            }
        }
    }

    let stale = delete_owned(ctx, key, &wanted).await?;
    if stale > 0 {
        info!(count = stale, "deleted stale offshoots");
    }
    Ok(load_balancer)
}

/// Delete every offshoot owned by `key` that is not in `keep`
async fn delete_owned(
    ctx: &IngressContext,
    key: &ObjectKey,
    keep: &BTreeSet<(OffshootKind, String)>,
) -> Result<usize, Error> {
    let mut deleted = 0;
    for (kind, name) in possible_offshoots(&key.name) {
        if keep.contains(&(kind, name.clone())) {
            continue;
        }
        let Some(live) = ctx.kube.get_offshoot(kind, &key.namespace, &name).await? else {
            continue;
        };
        if owning_ingress(live.meta()) != Some(key.name.as_str()) {
            warn!(%kind, %name, "offshoot name taken by an object this ingress does not own");
            continue;
        }
        ctx.kube.delete(kind, &key.namespace, &name).await?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Tear down offshoots (when allowed) and drop the finalizer
async fn release(ingress: &Ingress, key: &ObjectKey, ctx: &IngressContext) -> Result<Action, Error> {
    ctx.index.remove(key);
    if !has_finalizer(ingress) {
        return Ok(Action::await_change());
    }

    if ctx.config.cleanup_offshoots {
        let deleted = delete_owned(ctx, key, &BTreeSet::new()).await?;
        if deleted > 0 {
            ctx.events
                .publish(
                    &ingress.object_ref(&()),
                    EventType::Normal,
                    reasons::OFFSHOOTS_DELETED,
                    actions::DELETE,
                    Some(format!("deleted {} offshoots", deleted)),
                )
                .await;
        }
    }

    let finalizers: Vec<String> = ingress
        .finalizers()
        .iter()
        .filter(|f| *f != CLEANUP_FINALIZER)
        .cloned()
        .collect();
    ctx.kube
        .set_finalizers(&key.name, &key.namespace, finalizers)
        .await?;
    Ok(Action::await_change())
}

// =============================================================================
// Status helpers
// =============================================================================

struct StatusUpdate<'a> {
    phase: IngressPhase,
    message: &'a str,
    condition_status: ConditionStatus,
    reason: &'a str,
    checksum: Option<&'a str>,
    load_balancer: Option<LoadBalancerStatus>,
}

impl<'a> StatusUpdate<'a> {
    fn syncing() -> Self {
        Self {
            phase: IngressPhase::Syncing,
            message: "Compiling HAProxy configuration",
            condition_status: ConditionStatus::False,
            reason: "Syncing",
            checksum: None,
            load_balancer: None,
        }
    }

    fn synced(checksum: &'a str, load_balancer: Option<LoadBalancerStatus>) -> Self {
        Self {
            phase: IngressPhase::Synced,
            message: SYNCED_MESSAGE,
            condition_status: ConditionStatus::True,
            reason: "Synced",
            checksum: Some(checksum),
            load_balancer,
        }
    }

    fn failed(message: &'a str) -> Self {
        Self {
            phase: IngressPhase::Failed,
            message,
            condition_status: ConditionStatus::False,
            reason: "CompilationFailed",
            checksum: None,
            load_balancer: None,
        }
    }
}

fn is_status_unchanged(ingress: &Ingress, phase: IngressPhase, message: &str) -> bool {
    ingress
        .status
        .as_ref()
        .map(|s| s.phase == phase && s.message.as_deref() == Some(message))
        .unwrap_or(false)
}

/// Patch the ingress status unless nothing observable changed.
///
/// A failed pass keeps the checksum of the config that is still live.
async fn update_status(
    ingress: &Ingress,
    ctx: &IngressContext,
    update: StatusUpdate<'_>,
) -> Result<(), Error> {
    let current = ingress.status.as_ref();
    let checksum = update
        .checksum
        .map(str::to_string)
        .or_else(|| current.and_then(|s| s.config_checksum.clone()));
    let load_balancer = match update.phase {
        IngressPhase::Synced => update.load_balancer,
        _ => current.and_then(|s| s.load_balancer.clone()),
    };
    let observed = match update.phase {
        IngressPhase::Syncing => current.and_then(|s| s.observed_generation),
        _ => ingress.metadata.generation,
    };

    if is_status_unchanged(ingress, update.phase, update.message)
        && current.is_some_and(|s| {
            s.config_checksum == checksum
                && s.observed_generation == observed
                && s.load_balancer == load_balancer
        })
    {
        debug!("status unchanged, skipping update");
        return Ok(());
    }

    let mut status = IngressStatus::with_phase(update.phase)
        .message(update.message)
        .condition(Condition::new(
            "Ready",
            update.condition_status,
            update.reason,
            update.message,
        ))
        .observed(observed);
    if let Some(checksum) = checksum {
        status = status.checksum(checksum);
    }
    status.load_balancer = load_balancer;
    status.last_synced_at = current.and_then(|s| s.last_synced_at);
    if update.phase == IngressPhase::Synced {
        status = status.synced_at(Utc::now());
    }

    let name = ingress.name_any();
    let namespace = ingress.namespace().unwrap_or_default();
    ctx.kube.patch_status(&name, &namespace, &status).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress as CoreLbIngress, LoadBalancerStatus as CoreLbStatus, ObjectReference,
        ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use pretty_assertions::assert_eq;
    use voyager_common::crd::IngressSpec;
    use voyager_common::kube_utils::{deterministic_hash, offshoot_meta};
    use voyager_common::INGRESS_CLASS_ANNOTATION;

    use crate::annotations::keys;
    use crate::compiler::fixtures::{annotate, backend, http_rule, inputs, ingress, tcp_rule};
    use crate::retry::BASE_DELAY;
    use crate::workload::CONFIG_KEY;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn web_ingress() -> Ingress {
        ingress(
            "web",
            IngressSpec {
                rules: vec![http_rule("app.example.com", vec![("/", backend("web", 80))])],
                ..Default::default()
            },
        )
    }

    fn with_finalizer(mut ing: Ingress) -> Ingress {
        ing.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.to_string()]);
        ing
    }

    fn with_phase(mut ing: Ingress, phase: IngressPhase) -> Ingress {
        ing.status = Some(IngressStatus::with_phase(phase).message(SYNCED_MESSAGE));
        ing
    }

    fn deleted(mut ing: Ingress) -> Ingress {
        ing.metadata.deletion_timestamp = Some(Time(Utc::now()));
        ing
    }

    fn owned_config_map(ingress: &str) -> Offshoot {
        Offshoot::ConfigMap(ConfigMap {
            metadata: offshoot_meta(offshoot_name(ingress), "default", ingress),
            ..Default::default()
        })
    }

    /// Records event reasons in publish order
    #[derive(Default)]
    struct RecordingEvents {
        reasons: Mutex<Vec<String>>,
    }

    impl RecordingEvents {
        fn reasons(&self) -> Vec<String> {
            self.reasons.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    // =========================================================================
    // Mock Setup
    // =========================================================================

    /// Mock answering every read from the shared compiler fixtures.
    ///
    /// Writes are left to each test so their counts can be asserted.
    fn mock_reads() -> MockIngressKubeClient {
        let mut mock = MockIngressKubeClient::new();
        mock.expect_get_service()
            .returning(|name, ns| Ok(inputs().services.get(&ObjectKey::new(ns, name)).cloned()));
        mock.expect_get_endpoints()
            .returning(|name, ns| Ok(inputs().endpoints.get(&ObjectKey::new(ns, name)).cloned()));
        mock.expect_get_secret().returning(|_, _| Ok(None));
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        mock.expect_list_pods().returning(|_, _| Ok(vec![]));
        mock.expect_get_offshoot().returning(|_, _, _| Ok(None));
        mock
    }

    fn ctx_with(mock: MockIngressKubeClient) -> Arc<IngressContext> {
        Arc::new(IngressContext::for_testing(Arc::new(mock)))
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: a new ingress gets the cleanup finalizer, passes through Syncing
    /// and ends Synced with its offshoots applied
    #[tokio::test]
    async fn story_new_ingress_gets_finalizer_and_syncs() {
        let mut mock = mock_reads();
        mock.expect_set_finalizers()
            .withf(|name, _, finalizers| {
                name == "web" && finalizers == &vec![CLEANUP_FINALIZER.to_string()]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_patch_status()
            .withf(|_, _, s| s.phase == IngressPhase::Syncing)
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_patch_status()
            .withf(|_, _, s| s.phase == IngressPhase::Synced && s.config_checksum.is_some())
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_apply()
            .returning(|_, offshoot| Ok(offshoot.clone()));

        let ctx = ctx_with(mock);
        let action = reconcile(Arc::new(web_ingress()), ctx.clone())
            .await
            .expect("reconcile should succeed");

        assert_eq!(action, Action::requeue(ctx.config.resync_period));
        assert_eq!(
            ctx.index.ingresses_for(crate::index::RefKind::Service, &ObjectKey::new("default", "web")),
            vec![ObjectKey::new("default", "web")]
        );
    }

    /// Story: an ingress for another controller's class is left alone
    #[tokio::test]
    async fn story_other_class_is_skipped() {
        let mut ctx = IngressContext::for_testing(Arc::new(MockIngressKubeClient::new()));
        ctx.config.ingress_class = Some("voyager".to_string());
        let ing = annotate(web_ingress(), &[(INGRESS_CLASS_ANNOTATION, "nginx")]);

        let action = reconcile(Arc::new(ing), Arc::new(ctx))
            .await
            .expect("reconcile should succeed");

        assert_eq!(action, Action::await_change());
    }

    /// Story: deleting an ingress deletes its offshoots and releases the finalizer
    #[tokio::test]
    async fn story_deleted_ingress_cleans_up_offshoots() {
        let mut mock = MockIngressKubeClient::new();
        mock.expect_get_offshoot().returning(|kind, _, name| {
            Ok((kind == OffshootKind::ConfigMap && name == "voyager-web")
                .then(|| owned_config_map("web")))
        });
        mock.expect_delete()
            .withf(|kind, _, name| *kind == OffshootKind::ConfigMap && name == "voyager-web")
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_set_finalizers()
            .withf(|_, _, finalizers| finalizers.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(deleted(with_finalizer(web_ingress()))), ctx_with(mock))
            .await
            .expect("cleanup should succeed");

        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn cleanup_disabled_keeps_offshoots() {
        let mut mock = MockIngressKubeClient::new();
        mock.expect_delete().times(0);
        mock.expect_set_finalizers()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut ctx = IngressContext::for_testing(Arc::new(mock));
        ctx.config.cleanup_offshoots = false;

        reconcile(Arc::new(deleted(with_finalizer(web_ingress()))), Arc::new(ctx))
            .await
            .expect("cleanup should succeed");
    }

    #[tokio::test]
    async fn offshoots_owned_by_someone_else_are_not_deleted() {
        let mut mock = MockIngressKubeClient::new();
        mock.expect_get_offshoot().returning(|kind, _, _| {
            Ok((kind == OffshootKind::ConfigMap).then(|| owned_config_map("other")))
        });
        mock.expect_delete().times(0);
        mock.expect_set_finalizers().returning(|_, _, _| Ok(()));

        reconcile(Arc::new(deleted(with_finalizer(web_ingress()))), ctx_with(mock))
            .await
            .expect("cleanup should succeed");
    }

    /// Story: a bad annotation fails the pass before anything is applied
    #[tokio::test]
    async fn story_invalid_annotation_fails_without_applying() {
        let mut mock = mock_reads();
        mock.expect_apply().times(0);
        mock.expect_patch_status()
            .withf(|_, _, s| s.phase == IngressPhase::Failed)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ing = annotate(
            with_phase(with_finalizer(web_ingress()), IngressPhase::Synced),
            &[(keys::LB_TYPE, "Ingress")],
        );

        let err = reconcile(Arc::new(ing), ctx_with(mock))
            .await
            .expect_err("bad annotation must fail");

        assert!(matches!(err, Error::Config { .. }));
        assert!(!err.is_retryable());
    }

    // =========================================================================
    // Error Policy Tests
    // =========================================================================

    fn server_error() -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd unavailable".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }))
    }

    /// Story: transient failures back off per ingress, terminal ones wait
    #[test]
    fn story_error_policy_backs_off_transient_errors() {
        let ctx = ctx_with(MockIngressKubeClient::new());
        let ing = Arc::new(web_ingress());

        let config = Error::config_for("web", "bad annotation");
        assert_eq!(
            error_policy(ing.clone(), &config, ctx.clone()),
            Action::await_change()
        );

        assert_eq!(
            error_policy(ing.clone(), &server_error(), ctx.clone()),
            Action::requeue(BASE_DELAY)
        );
        assert_eq!(
            error_policy(ing, &server_error(), ctx),
            Action::requeue(BASE_DELAY * 2)
        );
    }

    // =========================================================================
    // Fake cluster
    // =========================================================================

    const ASSIGNED_LB_IP: &str = "203.0.113.10";

    #[derive(Default)]
    struct FakeState {
        offshoots: BTreeMap<(OffshootKind, String), Offshoot>,
        finalizers: Option<Vec<String>>,
        status: Option<IngressStatus>,
        writes: usize,
        next_node_port: i32,
    }

    /// In-memory cluster serving the compiler fixtures and storing offshoots.
    ///
    /// Applying a NodePort or LoadBalancer Service allocates node ports the
    /// way the API server does, so preservation of live values is observable.
    struct FakeCluster {
        inputs: ResolvedInputs,
        state: Mutex<FakeState>,
    }

    impl FakeCluster {
        fn new() -> Self {
            Self {
                inputs: inputs(),
                state: Mutex::new(FakeState {
                    next_node_port: 30000,
                    ..Default::default()
                }),
            }
        }

        /// `ing` as the API server would now return it
        fn observe(&self, ing: &Ingress) -> Arc<Ingress> {
            let state = self.state.lock().unwrap();
            let mut ing = ing.clone();
            if let Some(finalizers) = &state.finalizers {
                ing.metadata.finalizers = Some(finalizers.clone());
            }
            ing.status = state.status.clone();
            Arc::new(ing)
        }

        fn writes(&self) -> usize {
            self.state.lock().unwrap().writes
        }

        fn status(&self) -> IngressStatus {
            self.state.lock().unwrap().status.clone().unwrap_or_default()
        }

        fn offshoot(&self, kind: OffshootKind, name: &str) -> Option<Offshoot> {
            self.state
                .lock()
                .unwrap()
                .offshoots
                .get(&(kind, name.to_string()))
                .cloned()
        }

        fn remove(&self, kind: OffshootKind, name: &str) {
            self.state
                .lock()
                .unwrap()
                .offshoots
                .remove(&(kind, name.to_string()));
        }

        fn edit(&self, kind: OffshootKind, name: &str, change: impl FnOnce(&mut Offshoot)) {
            if let Some(live) = self
                .state
                .lock()
                .unwrap()
                .offshoots
                .get_mut(&(kind, name.to_string()))
            {
                change(live);
            }
        }

        fn config(&self, ingress: &str) -> String {
            match self.offshoot(OffshootKind::ConfigMap, &offshoot_name(ingress)) {
                Some(Offshoot::ConfigMap(cm)) => cm
                    .data
                    .and_then(|d| d.get(CONFIG_KEY).cloned())
                    .unwrap_or_default(),
                _ => String::new(),
            }
        }

        fn node_ports(&self, ingress: &str) -> BTreeMap<i32, i32> {
            match self.offshoot(OffshootKind::Service, &offshoot_name(ingress)) {
                Some(Offshoot::Service(svc)) => svc
                    .spec
                    .and_then(|s| s.ports)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.node_port.map(|np| (p.port, np)))
                    .collect(),
                _ => BTreeMap::new(),
            }
        }
    }

    #[async_trait]
    impl IngressKubeClient for FakeCluster {
        async fn patch_status(
            &self,
            _name: &str,
            _namespace: &str,
            status: &IngressStatus,
        ) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            state.status = Some(status.clone());
            state.writes += 1;
            Ok(())
        }

        async fn set_finalizers(
            &self,
            _name: &str,
            _namespace: &str,
            finalizers: Vec<String>,
        ) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            state.finalizers = Some(finalizers);
            state.writes += 1;
            Ok(())
        }

        async fn get_service(&self, name: &str, ns: &str) -> Result<Option<Service>, Error> {
            Ok(self.inputs.services.get(&ObjectKey::new(ns, name)).cloned())
        }

        async fn get_endpoints(&self, name: &str, ns: &str) -> Result<Option<Endpoints>, Error> {
            Ok(self.inputs.endpoints.get(&ObjectKey::new(ns, name)).cloned())
        }

        async fn get_secret(&self, name: &str, ns: &str) -> Result<Option<Secret>, Error> {
            Ok(self.inputs.secrets.get(&ObjectKey::new(ns, name)).cloned())
        }

        async fn get_config_map(&self, name: &str, ns: &str) -> Result<Option<ConfigMap>, Error> {
            Ok(self.inputs.config_maps.get(&ObjectKey::new(ns, name)).cloned())
        }

        async fn list_pods(
            &self,
            _namespace: &str,
            _selector: &BTreeMap<String, String>,
        ) -> Result<Vec<Pod>, Error> {
            Ok(vec![])
        }

        async fn get_offshoot(
            &self,
            kind: OffshootKind,
            _namespace: &str,
            name: &str,
        ) -> Result<Option<Offshoot>, Error> {
            Ok(self.offshoot(kind, name))
        }

        async fn apply(&self, _namespace: &str, offshoot: &Offshoot) -> Result<Offshoot, Error> {
            let mut state = self.state.lock().unwrap();
            let mut stored = offshoot.clone();
            if let Offshoot::Service(svc) = &mut stored {
                let is_lb = svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer");
                if let Some(spec) = svc.spec.as_mut() {
                    if matches!(spec.type_.as_deref(), Some("LoadBalancer" | "NodePort")) {
                        for port in spec.ports.iter_mut().flatten() {
                            if port.node_port.is_none() {
                                port.node_port = Some(state.next_node_port);
                                state.next_node_port += 1;
                            }
                        }
                    }
                }
                if is_lb {
                    svc.status = Some(ServiceStatus {
                        load_balancer: Some(CoreLbStatus {
                            ingress: Some(vec![CoreLbIngress {
                                ip: Some(ASSIGNED_LB_IP.to_string()),
                                ..Default::default()
                            }]),
                        }),
                        ..Default::default()
                    });
                }
            }
            state
                .offshoots
                .insert((stored.kind(), stored.name().to_string()), stored.clone());
            state.writes += 1;
            Ok(stored)
        }

        async fn delete(&self, kind: OffshootKind, _namespace: &str, name: &str) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            state.offshoots.remove(&(kind, name.to_string()));
            state.writes += 1;
            Ok(())
        }
    }

    fn fake_ctx(cluster: &Arc<FakeCluster>, events: &Arc<RecordingEvents>) -> Arc<IngressContext> {
        Arc::new(IngressContext::new(
            cluster.clone(),
            events.clone(),
            Arc::new(ReferenceIndex::new()),
            OperatorConfig::default(),
        ))
    }

    // =========================================================================
    // Convergence Story Tests
    // =========================================================================

    /// Story: a second pass with no external change writes nothing
    #[tokio::test]
    async fn story_second_pass_makes_no_writes() {
        let cluster = Arc::new(FakeCluster::new());
        let events = Arc::new(RecordingEvents::default());
        let ctx = fake_ctx(&cluster, &events);
        let ing = web_ingress();

        reconcile(cluster.observe(&ing), ctx.clone())
            .await
            .expect("first pass should succeed");
        let after_first = cluster.writes();
        assert!(after_first > 0);

        let status = cluster.status();
        assert_eq!(status.phase, IngressPhase::Synced);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(
            status.config_checksum.as_deref(),
            Some(deterministic_hash(&cluster.config("web")).as_str())
        );
        assert_eq!(
            status.load_balancer.map(|lb| lb.ingress[0].ip.clone()),
            Some(Some(ASSIGNED_LB_IP.to_string()))
        );

        reconcile(cluster.observe(&ing), ctx)
            .await
            .expect("second pass should succeed");
        assert_eq!(cluster.writes(), after_first);
        assert_eq!(events.reasons(), vec![reasons::CONFIG_UPDATED.to_string()]);
    }

    /// Story: a ConfigMap deleted out-of-band comes back with the same content
    #[tokio::test]
    async fn story_deleted_config_map_is_restored() {
        let cluster = Arc::new(FakeCluster::new());
        let events = Arc::new(RecordingEvents::default());
        let ctx = fake_ctx(&cluster, &events);
        let ing = web_ingress();

        reconcile(cluster.observe(&ing), ctx.clone()).await.unwrap();
        let original = cluster.config("web");
        cluster.remove(OffshootKind::ConfigMap, "voyager-web");
        let before = cluster.writes();

        reconcile(cluster.observe(&ing), ctx).await.unwrap();

        assert_eq!(cluster.config("web"), original);
        assert_eq!(cluster.writes(), before + 1);
        assert!(events
            .reasons()
            .contains(&reasons::OFFSHOOT_RESTORED.to_string()));
    }

    /// Story: adding a header rule changes only the config, never the node
    /// ports already handed out
    #[tokio::test]
    async fn story_node_ports_survive_header_rule_change() {
        let cluster = Arc::new(FakeCluster::new());
        let events = Arc::new(RecordingEvents::default());
        let ctx = fake_ctx(&cluster, &events);
        let mut ing = web_ingress();

        reconcile(cluster.observe(&ing), ctx.clone()).await.unwrap();
        let before = cluster.node_ports("web");
        let old_config = cluster.config("web");
        assert_eq!(before.len(), 1);

        if let Some(http) = ing.spec.rules[0].http.as_mut() {
            http.paths[0]
                .backend
                .header_rules
                .push("X-Forwarded-Team edge".to_string());
        }
        ing.metadata.generation = Some(2);
        reconcile(cluster.observe(&ing), ctx).await.unwrap();

        assert_ne!(cluster.config("web"), old_config);
        assert_eq!(cluster.node_ports("web"), before);
    }

    /// Story: out-of-band edits to the Service and Deployment are reverted on
    /// the next pass while the allocated node port stays put
    #[tokio::test]
    async fn story_edited_offshoots_are_reverted() {
        let cluster = Arc::new(FakeCluster::new());
        let events = Arc::new(RecordingEvents::default());
        let ctx = fake_ctx(&cluster, &events);
        let ing = web_ingress();

        reconcile(cluster.observe(&ing), ctx.clone()).await.unwrap();
        let ports = cluster.node_ports("web");
        let image = |cluster: &FakeCluster| match cluster.offshoot(OffshootKind::Deployment, "voyager-web") {
            Some(Offshoot::Deployment(deploy)) => deploy
                .spec
                .and_then(|s| s.template.spec)
                .and_then(|p| p.containers[0].image.clone()),
            _ => None,
        };
        let original_image = image(&cluster);

        cluster.edit(OffshootKind::Service, "voyager-web", |svc| {
            if let Offshoot::Service(svc) = svc {
                if let Some(port) = svc
                    .spec
                    .as_mut()
                    .and_then(|s| s.ports.as_mut())
                    .and_then(|p| p.first_mut())
                {
                    port.port = 9999;
                }
            }
        });
        cluster.edit(OffshootKind::Deployment, "voyager-web", |deploy| {
            if let Offshoot::Deployment(deploy) = deploy {
                if let Some(pod) = deploy.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
                    pod.containers[0].image = Some("haproxy:tampered".to_string());
                }
            }
        });
        let before = cluster.writes();

        reconcile(cluster.observe(&ing), ctx).await.unwrap();

        assert_eq!(cluster.writes(), before + 2);
        assert_eq!(cluster.node_ports("web"), ports);
        assert_eq!(image(&cluster), original_image);
    }

    /// Story: adding a listener keeps the node ports already handed out
    #[tokio::test]
    async fn story_node_ports_survive_unrelated_change() {
        let cluster = Arc::new(FakeCluster::new());
        let events = Arc::new(RecordingEvents::default());
        let ctx = fake_ctx(&cluster, &events);
        let mut ing = web_ingress();

        reconcile(cluster.observe(&ing), ctx.clone()).await.unwrap();
        let before = cluster.node_ports("web");
        assert_eq!(before.len(), 1);

        ing.spec.rules.push(tcp_rule("", 5432, backend("api", 8080)));
        ing.metadata.generation = Some(2);
        reconcile(cluster.observe(&ing), ctx).await.unwrap();

        let after = cluster.node_ports("web");
        assert_eq!(after.get(&80), before.get(&80));
        assert!(after.contains_key(&5432));
        assert_ne!(after.get(&5432), before.get(&80));
    }

    /// Story: a broken edit leaves the last good config live and marks the
    /// ingress Failed
    #[tokio::test]
    async fn story_failed_compile_keeps_last_good_config() {
        let cluster = Arc::new(FakeCluster::new());
        let events = Arc::new(RecordingEvents::default());
        let ctx = fake_ctx(&cluster, &events);
        let mut ing = web_ingress();

        reconcile(cluster.observe(&ing), ctx.clone()).await.unwrap();
        let good = cluster.config("web");
        let good_checksum = cluster.status().config_checksum;

        ing.spec.rules.push(http_rule("ghost.example.com", vec![("/", backend("ghost", 80))]));
        ing.metadata.generation = Some(2);
        let err = reconcile(cluster.observe(&ing), ctx)
            .await
            .expect_err("missing service must fail the pass");

        assert!(matches!(err, Error::Reference { .. }));
        assert_eq!(cluster.config("web"), good);
        let status = cluster.status();
        assert_eq!(status.phase, IngressPhase::Failed);
        assert_eq!(status.config_checksum, good_checksum);
        assert!(events
            .reasons()
            .contains(&reasons::REFERENCE_MISSING.to_string()));
    }

    /// Story: switching to host ports swaps the Deployment for a DaemonSet
    #[tokio::test]
    async fn story_switching_lb_type_removes_stale_workload() {
        let cluster = Arc::new(FakeCluster::new());
        let events = Arc::new(RecordingEvents::default());
        let ctx = fake_ctx(&cluster, &events);
        let ing = web_ingress();

        reconcile(cluster.observe(&ing), ctx.clone()).await.unwrap();
        assert!(cluster.offshoot(OffshootKind::Deployment, "voyager-web").is_some());

        let host_port = annotate(ing, &[(keys::LB_TYPE, "HostPort")]);
        reconcile(cluster.observe(&host_port), ctx).await.unwrap();

        assert!(cluster.offshoot(OffshootKind::Deployment, "voyager-web").is_none());
        assert!(cluster.offshoot(OffshootKind::DaemonSet, "voyager-web").is_some());
    }
}
