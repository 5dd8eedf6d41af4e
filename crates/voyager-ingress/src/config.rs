//! Operator-wide settings shared by every reconciliation

use std::time::Duration;

use kube::ResourceExt;

use voyager_common::crd::Ingress;
use voyager_common::INGRESS_CLASS_ANNOTATION;

/// Default HAProxy image run by the offshoot workload
pub const DEFAULT_HAPROXY_IMAGE: &str = "haproxy:2.9-alpine";
/// Default interval between resyncs of a Synced ingress
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(300);
/// Default upper bound for one reconciliation pass
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(120);

/// Settings the operator binary collects from flags and environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Image for the HAProxy container
    pub haproxy_image: String,
    /// Cloud provider (`aws`, `gce`, ...), used for provider-specific Service annotations
    pub cloud_provider: Option<String>,
    /// Only handle ingresses annotated with this class; `None` handles all
    pub ingress_class: Option<String>,
    /// Restrict watches to one namespace; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Create a ServiceAccount, Role and RoleBinding per ingress
    pub enable_rbac: bool,
    /// Delete offshoots when their ingress is deleted
    pub cleanup_offshoots: bool,
    pub resync_period: Duration,
    pub reconcile_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            haproxy_image: DEFAULT_HAPROXY_IMAGE.to_string(),
            cloud_provider: None,
            ingress_class: None,
            watch_namespace: None,
            enable_rbac: true,
            cleanup_offshoots: true,
            resync_period: DEFAULT_RESYNC_PERIOD,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }
}

impl OperatorConfig {
    /// Whether this operator instance is responsible for `ingress`
    pub fn accepts(&self, ingress: &Ingress) -> bool {
        match self.ingress_class.as_deref().filter(|c| !c.is_empty()) {
            None => true,
            Some(class) => {
                ingress.annotations().get(INGRESS_CLASS_ANNOTATION).map(String::as_str)
                    == Some(class)
            }
        }
    }

    /// Whether the configured cloud provider is `provider`
    pub fn is_provider(&self, provider: &str) -> bool {
        self.cloud_provider
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(provider))
    }
}
