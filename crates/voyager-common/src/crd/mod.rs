//! Custom Resource Definitions for Voyager

mod ingress;
mod types;

pub use ingress::{
    validate_host, AuthOption, BasicAuth, ConfigVolume, FrontendRule, HttpIngressPath,
    HttpIngressRuleValue, Ingress, IngressBackend, IngressPhase, IngressRule, IngressSpec,
    IngressStatus, IngressTls, LoadBalancerIngress, LoadBalancerStatus, LocalTypedReference,
    ResourceRequirements, TcpIngressRuleValue, TlsAuth, TlsVerifyMode, Toleration,
};
pub use types::{Condition, ConditionStatus, PortRef};
