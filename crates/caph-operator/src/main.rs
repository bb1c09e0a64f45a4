//! caph-controller - Cluster API infrastructure provider for Hetzner

mod config;
mod controller_runner;

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use caph_common::crd::{
    HCloudMachine, HCloudMachineTemplate, HCloudRemediation, HetznerBareMetalRemediation,
    HetznerCluster,
};
use caph_common::telemetry::{init_telemetry, TelemetryConfig};
use caph_common::FIELD_MANAGER;
use caph_controller::target_cluster::TargetClusterRegistry;
use caph_controller::Context;

use config::{Cli, OperatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let manifests = served_crds()
            .iter()
            .map(serde_yaml::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{}", manifests.join("---\n"));
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: cli.log_json,
        ..Default::default()
    })?;

    let config = OperatorConfig::from(&cli);
    let client = Client::try_default().await?;
    if cli.install_crds {
        ensure_crds_installed(&client).await?;
    }
    run_controllers(client, config).await
}

/// CRDs of the kinds this provider serves
fn served_crds() -> Vec<CustomResourceDefinition> {
    vec![
        HetznerCluster::crd(),
        HCloudMachine::crd(),
        HCloudMachineTemplate::crd(),
        HCloudRemediation::crd(),
        HetznerBareMetalRemediation::crd(),
    ]
}

/// Install or update the served CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in served_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All CRDs installed/updated");
    Ok(())
}

async fn run_controllers(client: Client, config: OperatorConfig) -> anyhow::Result<()> {
    let registry = Arc::new(TargetClusterRegistry::new());
    let ctx = Arc::new(
        Context::builder(client.clone())
            .hcloud_endpoint(config.hcloud_endpoint.clone())
            .rate_limit_wait(config.rate_limit_wait)
            .registry(registry.clone())
            .build()?,
    );

    match &config.namespace {
        Some(ns) => tracing::info!(namespace = %ns, "Starting controllers"),
        None => tracing::info!("Starting controllers for all namespaces"),
    }

    let namespace = config.namespace.as_deref();
    let mut controllers =
        controller_runner::build_cluster_controllers(client.clone(), namespace, ctx.clone());
    controllers.extend(controller_runner::build_machine_controllers(
        client.clone(),
        namespace,
        ctx.clone(),
    ));
    controllers.extend(controller_runner::build_remediation_controllers(
        client, namespace, ctx,
    ));

    futures::future::join_all(controllers).await;

    tracing::info!("Controllers stopped, shutting down target cluster managers");
    registry.shutdown().await;
    Ok(())
}
