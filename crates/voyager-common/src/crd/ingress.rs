//! Voyager Ingress Custom Resource Definition
//!
//! An `Ingress` declares host/path routing rules, TCP listeners, TLS bindings
//! and raw frontend rules. The operator compiles it into an HAProxy config and
//! runs the proxy as a Deployment or DaemonSet ("offshoots").

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, PortRef};

// =============================================================================
// Spec
// =============================================================================

/// Specification for a Voyager Ingress
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "voyager.appscode.com",
    version = "v1",
    kind = "Ingress",
    plural = "ingresses",
    shortname = "ing",
    namespaced,
    status = "IngressStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Checksum","type":"string","jsonPath":".status.configChecksum"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Backend used when no rule matches a request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<IngressBackend>,

    /// TLS bindings: certificate secret plus the hosts it covers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTls>,

    /// Raw HAProxy lines and auth injected into a listener by port
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frontend_rules: Vec<FrontendRule>,

    /// Host rules, each HTTP or TCP
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<IngressRule>,

    /// Client CIDRs allowed through a LoadBalancer Service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_source_ranges: Vec<String>,

    /// External IPs set on the offshoot Service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_ips: Vec<String>,

    /// Node selector for the proxy pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for the proxy pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Compute resources for the HAProxy container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Image pull secret names for the proxy pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// Extra ConfigMaps/Secrets mounted into the proxy pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_volumes: Vec<ConfigVolume>,
}

/// A host rule: exactly one of `http` or `tcp` must be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    /// Host pattern: exact, empty (match all) or leading wildcard (`*.example.com`)
    #[serde(default)]
    pub host: String,

    /// HTTP routing for this host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpIngressRuleValue>,

    /// TCP routing for this host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpIngressRuleValue>,
}

/// HTTP rule value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressRuleValue {
    /// Listener port; defaults to 443 when TLS covers the host, 80 otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Bind address; defaults to all interfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Fixed NodePort for this listener (NodePort/LoadBalancer types)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,

    /// Serve plaintext even if a TLS binding covers the host
    #[serde(default, rename = "noTLS")]
    pub no_tls: bool,

    /// ALPN protocols advertised on the bind line
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,

    /// Protocol hint for the bind line (e.g. `h2`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,

    /// Ordered path rules
    #[serde(default)]
    pub paths: Vec<HttpIngressPath>,
}

/// A path prefix routed to a backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressPath {
    /// Path prefix; empty matches every path
    #[serde(default)]
    pub path: String,

    /// Target backend
    pub backend: IngressBackend,
}

/// TCP rule value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TcpIngressRuleValue {
    /// Listener port
    pub port: i32,

    /// Bind address; defaults to all interfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Fixed NodePort for this listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,

    /// Skip TLS termination even if a TLS binding covers the host
    #[serde(default, rename = "noTLS")]
    pub no_tls: bool,

    /// ALPN protocols advertised on the bind line
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,

    /// Protocol hint for the bind line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,

    /// Target backend
    pub backend: IngressBackend,
}

/// A routing target: a Service port plus per-backend HAProxy tuning
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackend {
    /// Explicit HAProxy backend name; synthesized from the target when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Target Service name (may be `name.namespace`)
    pub service_name: String,

    /// Target Service port, numeric or named
    #[serde(default)]
    pub service_port: PortRef,

    /// Restrict endpoints to pods whose name starts with one of these
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_names: Vec<String>,

    /// Raw lines injected into the backend section
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_rules: Vec<String>,

    /// Request headers to add (`Name value`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_rules: Vec<String>,

    /// Request path rewrites (`regex replacement`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrite_rules: Vec<String>,

    /// ALPN protocols towards the servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,

    /// Protocol towards the servers (e.g. `h2`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,

    /// Load-balancing algorithm (`roundrobin`, `leastconn`, `source`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balance_on: Option<String>,
}

/// A TLS binding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    /// Secret holding `tls.crt`/`tls.key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// Typed reference to a Secret or a Certificate
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_: Option<LocalTypedReference>,

    /// Host patterns served with this certificate
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl IngressTls {
    /// Name of the Secret holding the certificate.
    ///
    /// A `Certificate` reference resolves to the `tls-<name>` Secret written
    /// by the certificate issuer.
    pub fn secret(&self) -> Option<String> {
        if let Some(r) = &self.ref_ {
            return Some(match r.kind.as_str() {
                "Certificate" => format!("tls-{}", r.name),
                _ => r.name.clone(),
            });
        }
        self.secret_name.clone()
    }
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LocalTypedReference {
    /// Kind of the referent (`Secret` or `Certificate`)
    #[serde(default = "default_tls_ref_kind")]
    pub kind: String,
    /// Name of the referent
    pub name: String,
}

fn default_tls_ref_kind() -> String {
    "Secret".to_string()
}

/// Raw rules and auth for the listener bound on `port`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrontendRule {
    /// Listener port the rules apply to
    pub port: i32,

    /// Raw lines injected into the frontend, ahead of generated routing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,

    /// Listener-wide authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthOption>,
}

/// Authentication attached to a listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AuthOption {
    /// HTTP Basic authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuth>,

    /// TLS client certificate authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsAuth>,
}

/// HTTP Basic auth backed by one or more Secrets of user lists
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    /// Secret whose keys each hold a `user:hash` list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// Additional credential Secrets, unioned with `secretName`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_names: Vec<String>,

    /// Realm presented in the challenge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

impl BasicAuth {
    /// All credential Secrets in declaration order, deduplicated
    pub fn secrets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in self.secret_name.iter().chain(self.secret_names.iter()) {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        out
    }
}

/// TLS client certificate verification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsAuth {
    /// Secret holding `ca.crt` (and optionally `crl.pem`)
    pub secret_name: String,

    /// Whether a client certificate is required
    #[serde(default)]
    pub verify_client: TlsVerifyMode,

    /// Redirect target when verification fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_page: Option<String>,

    /// Request headers exposing verification results (`name -> sample expression`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Client certificate verification mode
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerifyMode {
    /// Handshake fails without a valid certificate
    #[default]
    Required,
    /// Certificate is verified if presented
    Optional,
}

impl std::fmt::Display for TlsVerifyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Required => write!(f, "required"),
            Self::Optional => write!(f, "optional"),
        }
    }
}

/// Pod toleration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// `Exists` or `Equal`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    /// Taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Taint effect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    /// Toleration period for NoExecute taints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// Resource requests/limits as quantity strings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceRequirements {
    /// Requests (e.g. `cpu: 100m`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    /// Limits (e.g. `memory: 256Mi`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Extra volume mounted into the proxy container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVolume {
    /// Volume name
    pub name: String,
    /// Mount path inside the HAProxy container
    pub mount_path: String,
    /// Source ConfigMap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,
    /// Source Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle phase of an Ingress
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum IngressPhase {
    /// Not yet observed by the controller
    #[default]
    Pending,
    /// Compiling and applying offshoots
    Syncing,
    /// Offshoots match the rendered config
    Synced,
    /// Last pass failed; the previously applied config stays live
    Failed,
}

impl std::fmt::Display for IngressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Syncing => write!(f, "Syncing"),
            Self::Synced => write!(f, "Synced"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Address assigned to the offshoot LoadBalancer Service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LoadBalancerIngress {
    /// IP address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// DNS hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Load balancer status copied from the offshoot Service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LoadBalancerStatus {
    /// Assigned addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<LoadBalancerIngress>,
}

/// Status for an Ingress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressStatus {
    /// Current phase
    #[serde(default)]
    pub phase: IngressPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the ingress state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last compiled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Checksum of the config currently applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_checksum: Option<String>,

    /// Last time offshoots were synced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Addresses of the offshoot LoadBalancer Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerStatus>,
}

impl IngressStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: IngressPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition, replacing one of the same type
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Set the applied config checksum
    pub fn checksum(mut self, checksum: impl Into<String>) -> Self {
        self.config_checksum = Some(checksum.into());
        self
    }

    /// Set the observed generation
    pub fn observed(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Set the last-synced timestamp
    pub fn synced_at(mut self, time: DateTime<Utc>) -> Self {
        self.last_synced_at = Some(time);
        self
    }
}

// =============================================================================
// Validation
// =============================================================================

impl IngressSpec {
    /// Structural validation that needs no cluster state.
    ///
    /// Cross-object checks (ports, secrets, backend names) happen during
    /// compilation.
    pub fn validate(&self) -> Result<(), crate::Error> {
        for (i, rule) in self.rules.iter().enumerate() {
            let field = format!("spec.rules[{}]", i);
            if !rule.host.is_empty() {
                validate_host(&rule.host).map_err(|m| crate::Error::config_for_field("", &field, m))?;
            }
            match (&rule.http, &rule.tcp) {
                (Some(_), Some(_)) => {
                    return Err(crate::Error::config_for_field(
                        "",
                        field,
                        "rule must set exactly one of http or tcp, not both",
                    ))
                }
                (None, None) => {
                    return Err(crate::Error::config_for_field(
                        "",
                        field,
                        "rule must set one of http or tcp",
                    ))
                }
                (Some(http), None) => {
                    if let Some(port) = http.port {
                        validate_port(port).map_err(|m| crate::Error::config_for_field("", &field, m))?;
                    }
                    for (j, p) in http.paths.iter().enumerate() {
                        if !p.path.is_empty() && !p.path.starts_with('/') {
                            return Err(crate::Error::config_for_field(
                                "",
                                format!("{}.http.paths[{}]", field, j),
                                format!("path '{}' must start with '/'", p.path),
                            ));
                        }
                        p.backend.validate(&format!("{}.http.paths[{}].backend", field, j))?;
                    }
                }
                (None, Some(tcp)) => {
                    validate_port(tcp.port).map_err(|m| crate::Error::config_for_field("", &field, m))?;
                    tcp.backend.validate(&format!("{}.tcp.backend", field))?;
                }
            }
        }

        for (i, tls) in self.tls.iter().enumerate() {
            let field = format!("spec.tls[{}]", i);
            if tls.secret().is_none() {
                return Err(crate::Error::config_for_field(
                    "",
                    field,
                    "tls entry needs secretName or ref",
                ));
            }
            for host in &tls.hosts {
                validate_host(host).map_err(|m| crate::Error::config_for_field("", &field, m))?;
            }
        }

        for (i, fr) in self.frontend_rules.iter().enumerate() {
            validate_port(fr.port).map_err(|m| {
                crate::Error::config_for_field("", format!("spec.frontendRules[{}]", i), m)
            })?;
        }

        match &self.backend {
            Some(backend) => backend.validate("spec.backend")?,
            None if self.rules.is_empty() => {
                return Err(crate::Error::config_for_field(
                    "",
                    "spec",
                    "ingress declares neither rules nor a default backend",
                ))
            }
            None => {}
        }

        Ok(())
    }
}

impl IngressBackend {
    fn validate(&self, field: &str) -> Result<(), crate::Error> {
        if self.service_name.is_empty() {
            return Err(crate::Error::config_for_field(
                "",
                field,
                "serviceName is required",
            ));
        }
        if let PortRef::Number(n) = self.service_port {
            validate_port(n).map_err(|m| crate::Error::config_for_field("", field, m))?;
        }
        Ok(())
    }
}

fn validate_port(port: i32) -> Result<(), String> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(format!("port {} out of range 1-65535", port))
    }
}

/// Validate a host pattern: DNS-1123 subdomain with optional leading `*.`
pub fn validate_host(host: &str) -> Result<(), String> {
    if host.len() > 253 {
        return Err(format!("host '{}' exceeds 253 characters", host));
    }
    let name = host.strip_prefix("*.").unwrap_or(host);
    if name.is_empty() {
        return Err(format!("host '{}' has no domain after the wildcard", host));
    }
    for label in name.split('.') {
        if label.is_empty() {
            return Err(format!("host '{}' has an empty label", host));
        }
        if label.len() > 63 {
            return Err(format!("host label '{}' exceeds 63 characters", label));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("host label '{}' cannot start or end with '-'", label));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(format!(
                "host label '{}' must be lowercase alphanumeric or '-'",
                label
            ));
        }
    }
    Ok(())
}
