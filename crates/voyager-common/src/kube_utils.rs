//! Shared Kubernetes utilities using kube-rs

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

// =============================================================================
// Client construction
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients (must exceed the watch timeout)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path, falling back to
/// in-cluster / inferred configuration.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Returns true when the error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

// =============================================================================
// Offshoot metadata
// =============================================================================

/// Name shared by every offshoot of an ingress (`voyager-<ingress>`)
pub fn offshoot_name(ingress: &str) -> String {
    format!("voyager-{}", ingress)
}

/// Name of the stats Service offshoot (`voyager-<ingress>-stats`)
pub fn stats_service_name(ingress: &str) -> String {
    format!("voyager-{}-stats", ingress)
}

/// Labels identifying the offshoots of an ingress.
///
/// These double as the pod selector of the proxy workload, so they must stay
/// stable across operator versions.
pub fn offshoot_selector(ingress: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            crate::LABEL_ORIGIN.to_string(),
            crate::LABEL_ORIGIN_VOYAGER.to_string(),
        ),
        (crate::LABEL_ORIGIN_NAME.to_string(), ingress.to_string()),
    ])
}

/// Full label set for offshoot metadata: selector labels plus provenance
pub fn offshoot_labels(ingress: &str) -> BTreeMap<String, String> {
    let mut labels = offshoot_selector(ingress);
    labels.insert(
        crate::LABEL_ORIGIN_API_GROUP.to_string(),
        crate::API_GROUP.to_string(),
    );
    labels.insert(
        crate::LABEL_MANAGED_BY.to_string(),
        crate::LABEL_ORIGIN_VOYAGER.to_string(),
    );
    labels
}

/// Standard metadata for an offshoot object owned by `ingress`
pub fn offshoot_meta(name: impl Into<String>, namespace: &str, ingress: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.to_string()),
        labels: Some(offshoot_labels(ingress)),
        ..Default::default()
    }
}

/// Recover the owning ingress name from an offshoot's labels
pub fn owning_ingress(meta: &ObjectMeta) -> Option<&str> {
    let labels = meta.labels.as_ref()?;
    if labels.get(crate::LABEL_ORIGIN).map(String::as_str) != Some(crate::LABEL_ORIGIN_VOYAGER) {
        return None;
    }
    labels.get(crate::LABEL_ORIGIN_NAME).map(String::as_str)
}

// =============================================================================
// Hashing
// =============================================================================

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function should be used whenever the hash is persisted (e.g., K8s annotations).
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Hash of a serializable object's canonical JSON form
pub fn hash_object(obj: &impl serde::Serialize) -> Result<String, Error> {
    let json = serde_json::to_string(obj).map_err(|e| Error::serialization(e.to_string()))?;
    Ok(deterministic_hash(&json))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn only_api_404_is_not_found() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
    }

    #[test]
    fn deterministic_hash_is_stable() {
        let a = deterministic_hash("frontend http-0_0_0_0-80");
        let b = deterministic_hash("frontend http-0_0_0_0-80");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, deterministic_hash("frontend http-0_0_0_0-81"));
    }

    #[test]
    fn offshoot_names_follow_convention() {
        assert_eq!(offshoot_name("web"), "voyager-web");
        assert_eq!(stats_service_name("web"), "voyager-web-stats");
    }

    #[test]
    fn offshoot_labels_round_trip_to_owner() {
        let meta = offshoot_meta("voyager-web", "default", "web");
        assert_eq!(owning_ingress(&meta), Some("web"));
        let labels = meta.labels.unwrap_or_default();
        assert_eq!(
            labels.get(crate::LABEL_MANAGED_BY).map(String::as_str),
            Some("voyager")
        );
    }

    #[test]
    fn foreign_objects_have_no_owner() {
        let meta = ObjectMeta {
            labels: Some(BTreeMap::from([(
                crate::LABEL_ORIGIN_NAME.to_string(),
                "web".to_string(),
            )])),
            ..Default::default()
        };
        assert_eq!(owning_ingress(&meta), None);
    }
}
