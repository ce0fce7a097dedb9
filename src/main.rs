//! Gantry Operator - Kubernetes machine lifecycle management on EC2

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gantry::controller::{error_policy, reconcile, Context};
use gantry::crd::Machine;

/// Gantry - CRD-driven Kubernetes operator for EC2 machine lifecycle management
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Watch machines in this namespace only (default: all namespaces)
    #[arg(long)]
    namespace: Option<String>,

    /// AWS region for provider calls
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// AWS credential profile for provider calls
    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Machine CRDs and reconciles each against the EC2 instance
    /// that backs it: launching missing instances, replacing drifted ones,
    /// and tearing down instances of deleted machines.
    Controller,

    /// Install the Gantry CRDs into the cluster and exit
    ///
    /// The controller also installs CRDs on startup; this mode exists for
    /// setups where CRD installation and controller RBAC are separated.
    Install,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML
        let crd = serde_yaml::to_string(&Machine::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Install) => run_install().await,
        Some(Commands::Controller) | None => run_controller(cli).await,
    }
}

/// Install the CRDs against the current kubeconfig context and exit
async fn run_install() -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    tracing::info!("Gantry CRDs installed");
    Ok(())
}

/// Ensure all Gantry CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("gantry-controller").force();

    tracing::info!("Installing Machine CRD...");
    crds.patch("machines.gantry.dev", &params, &Patch::Apply(&Machine::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Machine CRD: {}", e))?;

    tracing::info!("All Gantry CRDs installed/updated");
    Ok(())
}

/// Run in controller mode - reconciles machines against EC2
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Gantry controller starting...");

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Operator installs its own CRDs on startup
    ensure_crds_installed(&client).await?;

    // Create controller context; region and profile pin the AWS side
    let mut ctx_builder = Context::builder(client.clone());
    if let Some(ref region) = cli.region {
        tracing::info!(region = %region, "Pinning provider region");
        ctx_builder = ctx_builder.region(region.clone());
    }
    if let Some(ref profile) = cli.profile {
        ctx_builder = ctx_builder.profile(profile.clone());
    }
    let ctx = Arc::new(ctx_builder.build());

    let machines: Api<Machine> = match cli.namespace {
        Some(ref ns) => {
            tracing::info!(namespace = %ns, "Watching a single namespace");
            Api::namespaced(client.clone(), ns)
        }
        None => Api::all(client.clone()),
    };

    tracing::info!("Starting Machine controller");

    Controller::new(machines, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Machine reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Machine reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Gantry controller shutting down");
    Ok(())
}
