//! Voyager Operator - compiles Voyager Ingresses into HAProxy deployments

mod controller_runner;

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use kube::{Api, Client, CustomResourceExt};

use voyager_common::crd::Ingress;
use voyager_common::kube_utils::create_client;
use voyager_common::telemetry::{init_telemetry, TelemetryConfig};
use voyager_common::FIELD_MANAGER;
use voyager_ingress::config::{
    OperatorConfig, DEFAULT_HAPROXY_IMAGE, DEFAULT_RECONCILE_TIMEOUT, DEFAULT_RESYNC_PERIOD,
};

/// Voyager - HAProxy ingress controller for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "voyager", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// HAProxy image run by every offshoot workload
    #[arg(long, env = "VOYAGER_HAPROXY_IMAGE", default_value = DEFAULT_HAPROXY_IMAGE)]
    haproxy_image: String,

    /// Cloud provider (`aws`, `gce`, `azure`, ...)
    #[arg(long, env = "VOYAGER_CLOUD_PROVIDER")]
    cloud_provider: Option<String>,

    /// Only handle ingresses whose `kubernetes.io/ingress.class` matches
    #[arg(long, env = "VOYAGER_INGRESS_CLASS")]
    ingress_class: Option<String>,

    /// Restrict the operator to a single namespace
    #[arg(long, env = "VOYAGER_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Create a ServiceAccount, Role and RoleBinding per ingress
    #[arg(long, env = "VOYAGER_ENABLE_RBAC", default_value_t = true, action = ArgAction::Set)]
    enable_rbac: bool,

    /// Delete offshoots when their ingress is deleted
    #[arg(long, env = "VOYAGER_CLEANUP_OFFSHOOTS", default_value_t = true, action = ArgAction::Set)]
    cleanup_offshoots: bool,

    /// Seconds between resyncs of a synced ingress
    #[arg(long, env = "VOYAGER_RESYNC_PERIOD", default_value_t = DEFAULT_RESYNC_PERIOD.as_secs())]
    resync_period: u64,

    /// Seconds before a reconciliation pass is abandoned
    #[arg(long, env = "VOYAGER_RECONCILE_TIMEOUT", default_value_t = DEFAULT_RECONCILE_TIMEOUT.as_secs())]
    reconcile_timeout: u64,

    /// Path to a kubeconfig; in-cluster configuration when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "VOYAGER_PRETTY_LOGS")]
    pretty_logs: bool,
}

impl Cli {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            haproxy_image: self.haproxy_image.clone(),
            cloud_provider: self.cloud_provider.clone().filter(|p| !p.is_empty()),
            ingress_class: self.ingress_class.clone().filter(|c| !c.is_empty()),
            watch_namespace: self.watch_namespace.clone().filter(|n| !n.is_empty()),
            enable_rbac: self.enable_rbac,
            cleanup_offshoots: self.cleanup_offshoots,
            resync_period: Duration::from_secs(self.resync_period),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Ingress::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "voyager-operator".to_string(),
        pretty: cli.pretty_logs,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let config = cli.operator_config();
    tracing::info!(
        image = %config.haproxy_image,
        ingress_class = ?config.ingress_class,
        watch_namespace = ?config.watch_namespace,
        rbac = config.enable_rbac,
        "Starting Voyager operator"
    );

    let client = create_client(cli.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    controller_runner::build_ingress_controller(client, config).await;

    tracing::info!("Voyager operator shut down");
    Ok(())
}

/// Ensure the Ingress CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so the
/// schema always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let crd = Ingress::crd();
    let name = crd
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Ingress CRD has no name"))?;

    tracing::info!(crd = %name, "Installing Ingress CRD...");
    crds.patch(&name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Ingress CRD: {}", e))?;

    Ok(())
}
