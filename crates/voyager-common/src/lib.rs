//! Common types for Voyager: CRDs, errors, events, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the Voyager CRDs
pub const API_GROUP: &str = "voyager.appscode.com";

/// Label marking an object as a Voyager offshoot
pub const LABEL_ORIGIN: &str = "origin";

/// Value of [`LABEL_ORIGIN`] on every offshoot
pub const LABEL_ORIGIN_VOYAGER: &str = "voyager";

/// Label carrying the name of the owning Ingress
pub const LABEL_ORIGIN_NAME: &str = "origin-name";

/// Label carrying the API group of the owning resource
pub const LABEL_ORIGIN_API_GROUP: &str = "origin-api-group";

/// Standard Kubernetes managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label selector matching every Voyager offshoot (for watches)
pub const OFFSHOOT_SELECTOR: &str = "origin=voyager";

/// Annotation holding the checksum of the rendered HAProxy config
pub const CONFIG_CHECKSUM_ANNOTATION: &str = "voyager.appscode.com/config-checksum";

/// Annotation holding the hash of the desired offshoot, used to skip no-op applies
pub const SPEC_HASH_ANNOTATION: &str = "voyager.appscode.com/spec-hash";

/// Finalizer guarding offshoot cleanup on Ingress deletion
pub const CLEANUP_FINALIZER: &str = "voyager.appscode.com/cleanup";

/// Annotation selecting which controller class handles an Ingress
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "voyager-operator";
