//! Target workload manager
//!
//! Turns a [`CompiledIngress`] into the offshoot objects that run HAProxy:
//! the config ConfigMap, the certificate Secret, the exposing Service and
//! either a Deployment or a host-port DaemonSet, plus optional RBAC and a
//! stats Service.
//!
//! Every offshoot is named `voyager-<ingress>` (the stats Service adds
//! `-stats`) and labelled with [`offshoot_labels`], so stale ones can be found
//! and deleted by name alone.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, KeyToPath,
    LocalObjectReference, PodSpec, PodTemplateSpec, ResourceRequirements, Secret,
    SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use serde::Serialize;

use voyager_common::crd::{IngressSpec, LoadBalancerIngress, LoadBalancerStatus};
use voyager_common::kube_utils::{
    deterministic_hash, hash_object, offshoot_meta, offshoot_name, offshoot_selector,
    stats_service_name,
};
use voyager_common::{CONFIG_CHECKSUM_ANNOTATION, SPEC_HASH_ANNOTATION};

use crate::annotations::LbType;
use crate::compiler::CompiledIngress;
use crate::config::OperatorConfig;
use crate::model::{CERT_MOUNT_PATH, ERROR_FILES_MOUNT_PATH};
use crate::Error;

/// ConfigMap key holding the rendered config
pub const CONFIG_KEY: &str = "haproxy.cfg";
/// Directory the config ConfigMap is mounted at
pub const CONFIG_MOUNT_PATH: &str = "/etc/haproxy";

const CONTAINER_NAME: &str = "haproxy";
const RUN_DIR: &str = "/var/run/haproxy";
const STATE_DIR: &str = "/var/state/haproxy";
const AWS_PROXY_PROTOCOL_ANNOTATION: &str =
    "service.beta.kubernetes.io/aws-load-balancer-proxy-protocol";

// =============================================================================
// Offshoot kinds
// =============================================================================

/// Kinds of object the controller creates on behalf of an ingress
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OffshootKind {
    ServiceAccount,
    Role,
    RoleBinding,
    ConfigMap,
    Secret,
    Service,
    Deployment,
    DaemonSet,
}

impl OffshootKind {
    pub const ALL: [OffshootKind; 8] = [
        Self::ServiceAccount,
        Self::Role,
        Self::RoleBinding,
        Self::ConfigMap,
        Self::Secret,
        Self::Service,
        Self::Deployment,
        Self::DaemonSet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceAccount => "ServiceAccount",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::Service => "Service",
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
        }
    }
}

impl std::fmt::Display for OffshootKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One desired or live offshoot object
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Offshoot {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    ConfigMap(ConfigMap),
    Secret(Secret),
    Service(Service),
    Deployment(Deployment),
    DaemonSet(DaemonSet),
}

impl Offshoot {
    pub fn kind(&self) -> OffshootKind {
        match self {
            Self::ServiceAccount(_) => OffshootKind::ServiceAccount,
            Self::Role(_) => OffshootKind::Role,
            Self::RoleBinding(_) => OffshootKind::RoleBinding,
            Self::ConfigMap(_) => OffshootKind::ConfigMap,
            Self::Secret(_) => OffshootKind::Secret,
            Self::Service(_) => OffshootKind::Service,
            Self::Deployment(_) => OffshootKind::Deployment,
            Self::DaemonSet(_) => OffshootKind::DaemonSet,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::ServiceAccount(o) => &o.metadata,
            Self::Role(o) => &o.metadata,
            Self::RoleBinding(o) => &o.metadata,
            Self::ConfigMap(o) => &o.metadata,
            Self::Secret(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::Deployment(o) => &o.metadata,
            Self::DaemonSet(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::ServiceAccount(o) => &mut o.metadata,
            Self::Role(o) => &mut o.metadata,
            Self::RoleBinding(o) => &mut o.metadata,
            Self::ConfigMap(o) => &mut o.metadata,
            Self::Secret(o) => &mut o.metadata,
            Self::Service(o) => &mut o.metadata,
            Self::Deployment(o) => &mut o.metadata,
            Self::DaemonSet(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// The spec-hash annotation carried by this object
    pub fn spec_hash(&self) -> Option<&str> {
        self.annotation(SPEC_HASH_ANNOTATION)
    }

    /// Hash the desired object and record it in the spec-hash annotation.
    ///
    /// Must run before [`Offshoot::preserve_live`] so the hash only covers
    /// what the controller itself decides.
    pub fn stamp_spec_hash(&mut self) -> Result<String, Error> {
        let hash = hash_object(self)?;
        self.meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash.clone());
        Ok(hash)
    }

    /// Whether `live` already matches this stamped desired object.
    ///
    /// The spec-hash annotation only proves the live object was written from
    /// this desired state; every field the controller sets must also still
    /// hold its desired value, so out-of-band edits are reverted. For the
    /// config ConfigMap the payload is checked against the checksum as well.
    pub fn is_current(&self, live: &Offshoot) -> bool {
        if self.kind() != live.kind() || self.spec_hash().is_none() {
            return false;
        }
        if live.spec_hash() != self.spec_hash() {
            return false;
        }
        let (Ok(desired_fields), Ok(live_fields)) =
            (serde_json::to_value(self), serde_json::to_value(live))
        else {
            return false;
        };
        if !covers(&desired_fields, &live_fields) {
            return false;
        }
        match (self, live) {
            (Self::ConfigMap(_), Self::ConfigMap(live_cm)) => {
                let desired = self.annotation(CONFIG_CHECKSUM_ANNOTATION);
                let live_payload = live_cm
                    .data
                    .as_ref()
                    .and_then(|d| d.get(CONFIG_KEY))
                    .map(|cfg| deterministic_hash(cfg));
                desired.is_some()
                    && live.annotation(CONFIG_CHECKSUM_ANNOTATION) == desired
                    && live_payload.as_deref() == desired
            }
            _ => true,
        }
    }

    /// Carry over values the cluster allocated on the live object.
    ///
    /// Node ports and the health-check node port of the Service are kept so a
    /// re-render never moves clients to new ports.
    pub fn preserve_live(&mut self, live: &Offshoot) {
        let (Self::Service(desired), Self::Service(live)) = (self, live) else {
            return;
        };
        let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) else {
            return;
        };
        if !matches!(spec.type_.as_deref(), Some("LoadBalancer" | "NodePort")) {
            return;
        }
        let live_ports = live_spec.ports.as_deref().unwrap_or_default();
        for port in spec.ports.iter_mut().flatten() {
            if port.node_port.is_some() {
                continue;
            }
            port.node_port = live_ports
                .iter()
                .find(|p| p.port == port.port && p.protocol == port.protocol)
                .or_else(|| {
                    live_ports
                        .iter()
                        .find(|p| p.name.is_some() && p.name == port.name)
                })
                .and_then(|p| p.node_port);
        }
        if spec.external_traffic_policy.as_deref() == Some("Local")
            && spec.health_check_node_port.is_none()
        {
            spec.health_check_node_port = live_spec.health_check_node_port;
        }
    }
}

/// Whether every field set in `desired` holds the same value in `live`.
///
/// Fields only present on `live` (server defaults, allocated node ports,
/// status) are ignored. Lists must match element for element. An empty
/// desired list or map also matches an absent live field, since the API
/// server drops empty collections.
fn covers(desired: &serde_json::Value, live: &serde_json::Value) -> bool {
    use serde_json::Value;

    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, value)| {
            match have.get(key) {
                Some(found) => covers(value, found),
                None => is_empty_value(value),
            }
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| covers(w, h))
        }
        (want, Value::Null) => is_empty_value(want),
        (want, have) => want == have,
    }
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Every offshoot an ingress could own, for stale-object cleanup
pub fn possible_offshoots(ingress: &str) -> Vec<(OffshootKind, String)> {
    let name = offshoot_name(ingress);
    let mut all: Vec<(OffshootKind, String)> = OffshootKind::ALL
        .iter()
        .map(|kind| (*kind, name.clone()))
        .collect();
    all.push((OffshootKind::Service, stats_service_name(ingress)));
    all
}

/// Addresses assigned to a LoadBalancer Service, in the Ingress status shape
pub fn load_balancer_status(service: &Service) -> Option<LoadBalancerStatus> {
    let ingress: Vec<LoadBalancerIngress> = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .map(|i| LoadBalancerIngress {
            ip: i.ip.clone(),
            hostname: i.hostname.clone(),
        })
        .collect();
    (!ingress.is_empty()).then_some(LoadBalancerStatus { ingress })
}

// =============================================================================
// Generated offshoots
// =============================================================================

/// All offshoots generated for one compiled ingress
#[derive(Clone, Debug)]
pub struct GeneratedOffshoots {
    /// Identity for the proxy pods, when RBAC is enabled
    pub service_account: Option<ServiceAccount>,
    pub role: Option<Role>,
    pub role_binding: Option<RoleBinding>,
    /// Rendered config plus checksum annotation
    pub config_map: ConfigMap,
    /// Certificates, CA bundles and CRLs referenced by the config
    pub certificates: Option<Secret>,
    pub service: Service,
    pub stats_service: Option<Service>,
    /// Set unless the LB type is `HostPort`
    pub deployment: Option<Deployment>,
    /// Set for the `HostPort` LB type
    pub daemon_set: Option<DaemonSet>,
}

impl GeneratedOffshoots {
    /// Offshoots in apply order: identity, payload, exposure, then the workload
    pub fn into_offshoots(self) -> Vec<Offshoot> {
        let mut out = Vec::new();
        out.extend(self.service_account.map(Offshoot::ServiceAccount));
        out.extend(self.role.map(Offshoot::Role));
        out.extend(self.role_binding.map(Offshoot::RoleBinding));
        out.push(Offshoot::ConfigMap(self.config_map));
        out.extend(self.certificates.map(Offshoot::Secret));
        out.push(Offshoot::Service(self.service));
        out.extend(self.stats_service.map(Offshoot::Service));
        out.extend(self.deployment.map(Offshoot::Deployment));
        out.extend(self.daemon_set.map(Offshoot::DaemonSet));
        out
    }
}

// =============================================================================
// Workload compiler
// =============================================================================

/// Builds offshoot objects from a compiled ingress
pub struct WorkloadCompiler;

impl WorkloadCompiler {
    pub fn compile(
        compiled: &CompiledIngress,
        spec: &IngressSpec,
        config: &OperatorConfig,
    ) -> GeneratedOffshoots {
        let ingress = compiled.name.as_str();
        let namespace = compiled.namespace.as_str();
        let name = offshoot_name(ingress);
        let rbac = config.enable_rbac;

        let pod_spec = Self::pod_spec(compiled, spec, config);
        let template = Self::pod_template(compiled, pod_spec);
        let selector = LabelSelector {
            match_labels: Some(offshoot_selector(ingress)),
            ..Default::default()
        };

        let (deployment, daemon_set) = if compiled.policy.lb_type == LbType::HostPort {
            let ds = DaemonSet {
                metadata: offshoot_meta(name.as_str(), namespace, ingress),
                spec: Some(DaemonSetSpec {
                    selector,
                    template,
                    ..Default::default()
                }),
                ..Default::default()
            };
            (None, Some(ds))
        } else {
            let deploy = Deployment {
                metadata: offshoot_meta(name.as_str(), namespace, ingress),
                spec: Some(DeploymentSpec {
                    replicas: Some(compiled.policy.replicas),
                    selector,
                    template,
                    ..Default::default()
                }),
                ..Default::default()
            };
            (Some(deploy), None)
        };

        GeneratedOffshoots {
            service_account: rbac.then(|| ServiceAccount {
                metadata: offshoot_meta(name.as_str(), namespace, ingress),
                ..Default::default()
            }),
            role: rbac.then(|| Self::role(&name, namespace, ingress)),
            role_binding: rbac.then(|| Self::role_binding(&name, namespace, ingress)),
            config_map: Self::config_map(compiled),
            certificates: Self::certificates(compiled),
            service: Self::service(compiled, spec, config),
            stats_service: Self::stats_service(compiled),
            deployment,
            daemon_set,
        }
    }

    fn config_map(compiled: &CompiledIngress) -> ConfigMap {
        let mut metadata = offshoot_meta(
            offshoot_name(&compiled.name),
            &compiled.namespace,
            &compiled.name,
        );
        metadata.annotations = Some(BTreeMap::from([(
            CONFIG_CHECKSUM_ANNOTATION.to_string(),
            compiled.checksum.clone(),
        )]));
        ConfigMap {
            metadata,
            data: Some(BTreeMap::from([(
                CONFIG_KEY.to_string(),
                compiled.config.clone(),
            )])),
            ..Default::default()
        }
    }

    fn certificates(compiled: &CompiledIngress) -> Option<Secret> {
        if compiled.certificates.is_empty() {
            return None;
        }
        let data = compiled
            .certificates
            .files
            .iter()
            .map(|f| (f.key.clone(), ByteString(f.content.clone().into_bytes())))
            .collect();
        Some(Secret {
            metadata: offshoot_meta(
                offshoot_name(&compiled.name),
                &compiled.namespace,
                &compiled.name,
            ),
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    fn service(compiled: &CompiledIngress, spec: &IngressSpec, config: &OperatorConfig) -> Service {
        let policy = &compiled.policy;
        let lb_type = policy.lb_type;
        let is_lb = lb_type == LbType::LoadBalancer;
        let service_type = match lb_type {
            LbType::LoadBalancer => "LoadBalancer",
            LbType::NodePort => "NodePort",
            LbType::HostPort | LbType::Internal => "ClusterIP",
        };

        let ports = compiled
            .listener_ports()
            .into_iter()
            .map(|(port, node_port)| ServicePort {
                name: Some(format!("tcp-{}", port)),
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                node_port: node_port.filter(|_| lb_type.uses_node_ports()),
                ..Default::default()
            })
            .collect();

        let mut annotations = policy.service_annotations.clone();
        if is_lb && policy.accept_proxy && config.is_provider("aws") {
            annotations.insert(AWS_PROXY_PROTOCOL_ANNOTATION.to_string(), "*".to_string());
        }

        let local = policy.keep_source_ip && lb_type.uses_node_ports();
        let mut metadata = offshoot_meta(
            offshoot_name(&compiled.name),
            &compiled.namespace,
            &compiled.name,
        );
        metadata.annotations = (!annotations.is_empty()).then_some(annotations);

        Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some(service_type.to_string()),
                selector: Some(offshoot_selector(&compiled.name)),
                ports: Some(ports),
                load_balancer_ip: policy.load_balancer_ip.clone().filter(|_| is_lb),
                load_balancer_source_ranges: (is_lb
                    && !spec.load_balancer_source_ranges.is_empty())
                .then(|| spec.load_balancer_source_ranges.clone()),
                external_ips: (!spec.external_ips.is_empty()).then(|| spec.external_ips.clone()),
                external_traffic_policy: local.then(|| "Local".to_string()),
                health_check_node_port: policy.health_check_node_port.filter(|_| local && is_lb),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn stats_service(compiled: &CompiledIngress) -> Option<Service> {
        let stats = compiled.model.stats.as_ref()?;
        Some(Service {
            metadata: offshoot_meta(
                stats_service_name(&compiled.name),
                &compiled.namespace,
                &compiled.name,
            ),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(offshoot_selector(&compiled.name)),
                ports: Some(vec![ServicePort {
                    name: Some("stats".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: stats.port,
                    target_port: Some(IntOrString::Int(stats.port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn role(name: &str, namespace: &str, ingress: &str) -> Role {
        Role {
            metadata: offshoot_meta(name, namespace, ingress),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(
                    ["configmaps", "secrets", "services", "endpoints"]
                        .iter()
                        .map(|r| r.to_string())
                        .collect(),
                ),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            }]),
        }
    }

    fn role_binding(name: &str, namespace: &str, ingress: &str) -> RoleBinding {
        RoleBinding {
            metadata: offshoot_meta(name, namespace, ingress),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: name.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }]),
        }
    }

    /// Checksum stamped on the pod template: the config checksum, folded with
    /// the certificate bundle when there is one, so rotated certs roll pods.
    fn rollout_checksum(compiled: &CompiledIngress) -> String {
        if compiled.certificates.is_empty() {
            return compiled.checksum.clone();
        }
        let mut material = compiled.checksum.clone();
        for file in &compiled.certificates.files {
            material.push('\n');
            material.push_str(&file.key);
            material.push('\n');
            material.push_str(&file.content);
        }
        deterministic_hash(&material)
    }

    fn pod_template(compiled: &CompiledIngress, spec: PodSpec) -> PodTemplateSpec {
        let mut annotations = compiled.policy.pod_annotations.clone();
        annotations.insert(
            CONFIG_CHECKSUM_ANNOTATION.to_string(),
            Self::rollout_checksum(compiled),
        );
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(offshoot_selector(&compiled.name)),
                annotations: Some(annotations),
                ..Default::default()
            }),
            spec: Some(spec),
        }
    }

    fn pod_spec(compiled: &CompiledIngress, spec: &IngressSpec, config: &OperatorConfig) -> PodSpec {
        let policy = &compiled.policy;
        let name = offshoot_name(&compiled.name);
        let host_port = policy.lb_type == LbType::HostPort;
        let (volumes, mounts) = Self::volumes(compiled, spec);

        let mut ports: Vec<ContainerPort> = compiled
            .listener_ports()
            .into_iter()
            .map(|(port, _)| ContainerPort {
                name: Some(format!("tcp-{}", port)),
                protocol: Some("TCP".to_string()),
                container_port: port,
                host_port: host_port.then_some(port),
                ..Default::default()
            })
            .collect();
        if let Some(stats) = &compiled.model.stats {
            ports.push(ContainerPort {
                name: Some("stats".to_string()),
                protocol: Some("TCP".to_string()),
                container_port: stats.port,
                ..Default::default()
            });
        }

        let mut node_selector = spec.node_selector.clone();
        node_selector.extend(policy.node_selector.clone());

        PodSpec {
            service_account_name: config.enable_rbac.then(|| name.clone()),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(config.haproxy_image.clone()),
                command: Some(vec!["haproxy".to_string()]),
                args: Some(vec![
                    "-W".to_string(),
                    "-db".to_string(),
                    "-f".to_string(),
                    format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY),
                ]),
                ports: Some(ports),
                volume_mounts: Some(mounts),
                resources: spec.resources.as_ref().map(|r| ResourceRequirements {
                    requests: quantities(&r.requests),
                    limits: quantities(&r.limits),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            volumes: Some(volumes),
            node_selector: (!node_selector.is_empty()).then_some(node_selector),
            tolerations: (!spec.tolerations.is_empty()).then(|| {
                spec.tolerations
                    .iter()
                    .map(|t| Toleration {
                        key: t.key.clone(),
                        operator: t.operator.clone(),
                        value: t.value.clone(),
                        effect: t.effect.clone(),
                        toleration_seconds: t.toleration_seconds,
                    })
                    .collect()
            }),
            image_pull_secrets: (!spec.image_pull_secrets.is_empty()).then(|| {
                spec.image_pull_secrets
                    .iter()
                    .map(|s| LocalObjectReference { name: s.clone() })
                    .collect()
            }),
            ..Default::default()
        }
    }

    fn volumes(compiled: &CompiledIngress, spec: &IngressSpec) -> (Vec<Volume>, Vec<VolumeMount>) {
        let name = offshoot_name(&compiled.name);
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        let mut add = |volume: Volume, path: &str, read_only: bool| {
            mounts.push(VolumeMount {
                name: volume.name.clone(),
                mount_path: path.to_string(),
                read_only: read_only.then_some(true),
                ..Default::default()
            });
            volumes.push(volume);
        };

        add(
            Volume {
                name: "haproxy-config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: name.clone(),
                    items: Some(vec![KeyToPath {
                        key: CONFIG_KEY.to_string(),
                        path: CONFIG_KEY.to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            CONFIG_MOUNT_PATH,
            true,
        );

        if !compiled.certificates.is_empty() {
            add(
                Volume {
                    name: "haproxy-certs".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(name.clone()),
                        items: Some(
                            compiled
                                .certificates
                                .files
                                .iter()
                                .map(|f| KeyToPath {
                                    key: f.key.clone(),
                                    path: f.path.clone(),
                                    ..Default::default()
                                })
                                .collect(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                CERT_MOUNT_PATH,
                true,
            );
        }

        if let Some(cm) = &compiled.policy.error_files {
            add(
                Volume {
                    name: "error-files".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: cm.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ERROR_FILES_MOUNT_PATH,
                true,
            );
        }

        for (volume, path) in [("run", RUN_DIR), ("state", STATE_DIR)] {
            add(
                Volume {
                    name: volume.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
                path,
                false,
            );
        }

        for extra in &spec.config_volumes {
            add(
                Volume {
                    name: extra.name.clone(),
                    config_map: extra.config_map.as_ref().map(|cm| ConfigMapVolumeSource {
                        name: cm.clone(),
                        ..Default::default()
                    }),
                    secret: extra.secret.as_ref().map(|s| SecretVolumeSource {
                        secret_name: Some(s.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                &extra.mount_path,
                true,
            );
        }

        (volumes, mounts)
    }
}

fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    (!map.is_empty()).then(|| {
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect()
    })
}
