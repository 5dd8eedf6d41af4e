//! Ingress compiler
//!
//! Turns one `Ingress` plus resolved copies of everything it references into
//! a rendered HAProxy config and the data the workload offshoots need.
//!
//! ```text
//! annotations ─► IngressPolicy ─┐
//! spec + inputs ────────────────┼─► ModelBuilder ─► RoutingModel ─► render ─► haproxy.cfg
//! Service annotations ─► BackendPolicy ┘        (naming)
//! ```
//!
//! Compilation is pure: it never talks to the API server. The controller
//! gathers [`ResolvedInputs`] first, using [`references`] to learn what to
//! fetch.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use kube::ResourceExt;

use voyager_common::crd::Ingress;
use voyager_common::kube_utils::deterministic_hash;

use crate::annotations::{BackendPolicy, IngressPolicy};
use crate::model::{CertBundle, ModelBuilder, RoutingModel};
use crate::render;

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur while compiling an Ingress
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// Ingress is missing required metadata
    #[error("Ingress missing {field}")]
    MissingMetadata { field: &'static str },

    /// Spec failed structural validation
    #[error("invalid spec at {field}: {message}")]
    InvalidSpec { field: String, message: String },

    /// An annotation value could not be parsed
    #[error("invalid annotation {key}='{value}': {reason}")]
    InvalidAnnotation {
        key: String,
        value: String,
        reason: String,
    },

    /// A referenced object is absent from the resolved inputs
    #[error("{kind} '{name}' not found")]
    MissingReference { kind: &'static str, name: String },

    /// A referenced Secret lacks a required key or holds malformed data
    #[error("secret '{secret}': {reason}")]
    InvalidSecret { secret: String, reason: String },

    /// An error-file ConfigMap key is not `<code>.http` or `<code>.errorloc*`
    #[error("errorfiles configmap '{config_map}' has unsupported key '{key}'")]
    InvalidErrorFile { config_map: String, key: String },

    /// Backend port is not exposed by its Service
    #[error("backend {backend}: service '{service}' has no port '{port}'")]
    PortNotFound {
        backend: String,
        service: String,
        port: String,
    },

    /// Two distinct backends resolve to the same HAProxy section name
    #[error("duplicate backend name '{name}'")]
    DuplicateBackendName { name: String },

    /// HTTP and TCP rules (or two catch-all TCP rules) share a bind address and port
    #[error("conflicting rules on {address}:{port}: {reason}")]
    ListenerConflict {
        address: String,
        port: i32,
        reason: String,
    },

    /// A FrontendRule targets a port with no listener
    #[error("frontend rule for port {port} matches no listener")]
    FrontendRuleWithoutListener { port: i32 },

    /// The template engine failed
    #[error("render failed: {0}")]
    Render(String),
}

impl CompileError {
    /// Map into the controller's error taxonomy, attributing it to `ingress`
    pub fn into_error(self, ingress: &str) -> crate::Error {
        match self {
            Self::MissingReference { kind, name } => crate::Error::reference(ingress, kind, name),
            Self::InvalidSpec { ref field, .. } => {
                crate::Error::config_for_field(ingress, field.clone(), self.to_string())
            }
            Self::InvalidAnnotation { ref key, .. } => {
                crate::Error::config_for_field(ingress, key.clone(), self.to_string())
            }
            Self::Render(msg) => crate::Error::internal_with_context("render", msg),
            other => crate::Error::config_for(ingress, other.to_string()),
        }
    }
}

impl From<CompileError> for crate::Error {
    fn from(err: CompileError) -> Self {
        err.into_error(voyager_common::error::UNKNOWN_CONTEXT)
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// Namespaced object key, displayed as `namespace/name`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of every object an Ingress references, fetched by the controller
#[derive(Clone, Debug, Default)]
pub struct ResolvedInputs {
    pub services: BTreeMap<ObjectKey, Service>,
    pub endpoints: BTreeMap<ObjectKey, Endpoints>,
    pub secrets: BTreeMap<ObjectKey, Secret>,
    pub config_maps: BTreeMap<ObjectKey, ConfigMap>,
    /// Pods backing the referenced Services, keyed by pod name
    pub pods: BTreeMap<ObjectKey, Pod>,
}

impl ResolvedInputs {
    pub fn service(&self, namespace: &str, name: &str) -> Option<&Service> {
        self.services.get(&ObjectKey::new(namespace, name))
    }

    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<&Endpoints> {
        self.endpoints.get(&ObjectKey::new(namespace, name))
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<&Secret> {
        self.secrets.get(&ObjectKey::new(namespace, name))
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<&ConfigMap> {
        self.config_maps.get(&ObjectKey::new(namespace, name))
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<&Pod> {
        self.pods.get(&ObjectKey::new(namespace, name))
    }
}

/// Objects an Ingress depends on, grouped by kind
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct References {
    pub services: BTreeSet<ObjectKey>,
    pub secrets: BTreeSet<ObjectKey>,
    pub config_maps: BTreeSet<ObjectKey>,
}

/// Split a backend `serviceName` into `(name, namespace)`.
///
/// `web.other` targets Service `web` in namespace `other`; a bare name stays
/// in the Ingress namespace.
pub fn service_target<'a>(service_name: &'a str, namespace: &'a str) -> (&'a str, &'a str) {
    match service_name.split_once('.') {
        Some((name, ns)) if !ns.is_empty() => (name, ns),
        _ => (service_name, namespace),
    }
}

/// Every object the Ingress references.
///
/// Secrets named by Service annotations are only known once those Services
/// are fetched, so the controller calls this twice: first with no Services,
/// then with the Services it resolved.
pub fn references(
    ingress: &Ingress,
    services: &BTreeMap<ObjectKey, Service>,
) -> Result<References, CompileError> {
    let namespace = ingress
        .namespace()
        .ok_or(CompileError::MissingMetadata { field: "namespace" })?;
    let key = |name: &str| ObjectKey::new(namespace.as_str(), name);
    let policy = IngressPolicy::parse(ingress.annotations())?;
    let mut refs = References::default();

    let spec = &ingress.spec;
    let backends = spec.backend.iter().chain(spec.rules.iter().flat_map(|r| {
        r.http
            .iter()
            .flat_map(|h| h.paths.iter().map(|p| &p.backend))
            .chain(r.tcp.iter().map(|t| &t.backend))
    }));
    for backend in backends {
        let (name, ns) = service_target(&backend.service_name, &namespace);
        refs.services.insert(ObjectKey::new(ns, name));
    }

    for tls in &spec.tls {
        if let Some(secret) = tls.secret() {
            refs.secrets.insert(key(&secret));
        }
    }
    for fr in &spec.frontend_rules {
        if let Some(auth) = &fr.auth {
            if let Some(basic) = &auth.basic {
                refs.secrets.extend(basic.secrets().iter().map(|s| key(s)));
            }
            if let Some(tls) = &auth.tls {
                refs.secrets.insert(key(&tls.secret_name));
            }
        }
    }

    if let Some(auth) = &policy.basic_auth {
        refs.secrets.extend(auth.secrets.iter().map(|s| key(s)));
    }
    if let Some(tls) = &policy.tls_auth {
        refs.secrets.insert(key(&tls.secret));
    }
    if let Some(secret) = policy.stats.as_ref().and_then(|s| s.secret.as_ref()) {
        refs.secrets.insert(key(secret));
    }
    if let Some(cm) = &policy.error_files {
        refs.config_maps.insert(key(cm));
    }

    for svc_key in &refs.services {
        if let Some(service) = services.get(svc_key) {
            let backend = BackendPolicy::parse(ingress.annotations(), service.annotations())?;
            if let Some(auth) = backend.basic_auth {
                refs.secrets.extend(
                    auth.secrets
                        .iter()
                        .map(|s| ObjectKey::new(svc_key.namespace.as_str(), s.as_str())),
                );
            }
        }
    }

    Ok(refs)
}

// =============================================================================
// Output
// =============================================================================

/// Result of compiling an Ingress
#[derive(Clone, Debug)]
pub struct CompiledIngress {
    /// Ingress name
    pub name: String,
    /// Ingress namespace
    pub namespace: String,
    /// Parsed Ingress-scope policy, consumed by the workload builder
    pub policy: IngressPolicy,
    /// Canonical routing model the config was rendered from
    pub model: RoutingModel,
    /// Rendered `haproxy.cfg`
    pub config: String,
    /// Truncated SHA-256 of `config`
    pub checksum: String,
    /// Certificate files materialised into the offshoot Secret
    pub certificates: CertBundle,
}

impl CompiledIngress {
    /// Listener ports exposed by the proxy, deduplicated and sorted
    pub fn listener_ports(&self) -> Vec<(i32, Option<i32>)> {
        let mut ports: BTreeMap<i32, Option<i32>> = BTreeMap::new();
        for fe in &self.model.frontends {
            let entry = ports.entry(fe.port).or_insert(None);
            if entry.is_none() {
                *entry = fe.node_port;
            }
        }
        ports.into_iter().collect()
    }
}

/// Compiles Ingresses against a snapshot of their references
pub struct IngressCompiler<'a> {
    inputs: &'a ResolvedInputs,
}

impl<'a> IngressCompiler<'a> {
    pub fn new(inputs: &'a ResolvedInputs) -> Self {
        Self { inputs }
    }

    /// Compile an Ingress into a rendered config.
    ///
    /// Any failure aborts the whole compilation; there is no partial output.
    pub fn compile(&self, ingress: &Ingress) -> Result<CompiledIngress, CompileError> {
        let name = ingress
            .metadata
            .name
            .clone()
            .ok_or(CompileError::MissingMetadata { field: "name" })?;
        let namespace = ingress
            .namespace()
            .ok_or(CompileError::MissingMetadata { field: "namespace" })?;

        ingress.spec.validate().map_err(|e| match e {
            crate::Error::Config { field, message, .. } => CompileError::InvalidSpec {
                field: field.unwrap_or_else(|| "spec".to_string()),
                message,
            },
            other => CompileError::InvalidSpec {
                field: "spec".to_string(),
                message: other.to_string(),
            },
        })?;

        let policy = IngressPolicy::parse(ingress.annotations())?;
        let (model, certificates) =
            ModelBuilder::new(ingress, &namespace, self.inputs, &policy).build()?;
        let config = render::render(&model, &ObjectKey::new(namespace.as_str(), name.as_str()))?;
        let checksum = deterministic_hash(&config);
        voyager_common::metrics::record_rendered_config(config.len());

        Ok(CompiledIngress {
            name,
            namespace,
            policy,
            model,
            config,
            checksum,
            certificates,
        })
    }
}
