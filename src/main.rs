//! Buildkit Operator - ephemeral buildkitd instances on Kubernetes

use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use buildkit_operator::config::ControllerConfig;
use buildkit_operator::controller::{build_controllers, Context};
use buildkit_operator::crd::{Buildkit, BuildkitTemplate};

/// Buildkit Operator - ephemeral buildkitd instances built from shared templates
#[derive(Parser, Debug)]
#[command(name = "buildkit-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Installs the CRDs, then watches Buildkit and BuildkitTemplate resources
    /// until interrupted.
    Controller(ControllerConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.command {
        Some(Commands::Controller(config)) => config,
        None => ControllerConfig::default(),
    };

    init_tracing(config.json_logs);

    if cli.crd {
        for crd in [Buildkit::crd(), BuildkitTemplate::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    run_controller(config).await
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Run the controllers until a shutdown signal arrives
async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client, &config.field_manager).await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, finishing in-flight reconciles");
            signal_cancel.cancel();
        }
    });

    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .cancellation(cancel)
            .build(),
    );

    tracing::info!("Starting Buildkit controllers...");
    futures::future::join_all(build_controllers(client, ctx)).await;

    tracing::info!("Buildkit operator shutting down");
    Ok(())
}

/// Install or update both CRDs with server-side apply
async fn ensure_crds_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();

    for crd in [Buildkit::crd(), BuildkitTemplate::crd()] {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generated CRD has no name"))?;
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All Buildkit CRDs installed/updated");
    Ok(())
}
