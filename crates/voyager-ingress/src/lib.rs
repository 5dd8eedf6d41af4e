//! Ingress compiler and controller for Voyager
//!
//! This crate compiles Voyager Ingress CRDs into HAProxy configuration and
//! keeps the proxy workload in step with it:
//!
//! - **Annotations**: parses annotation maps into typed policies
//! - **Model**: builds the canonical listener/backend routing model
//! - **Render**: renders `haproxy.cfg` from the model
//! - **Workload**: generates the ConfigMap, Service and Deployment/DaemonSet offshoots
//! - **Controller**: reconciles Ingresses against the live cluster

pub mod annotations;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod index;
pub mod model;
pub mod naming;
pub mod render;
pub mod retry;
pub mod workload;

// Internal modules use `crate::crd` and `crate::Error`.
pub(crate) use voyager_common::{crd, Error};

pub use compiler::{CompileError, CompiledIngress, IngressCompiler, ObjectKey, ResolvedInputs};
pub use config::OperatorConfig;
pub use controller::{error_policy, reconcile, IngressContext, IngressKubeClient, KubeIngressClient};
pub use index::{RefKind, ReferenceIndex};
pub use workload::{Offshoot, OffshootKind, WorkloadCompiler};
