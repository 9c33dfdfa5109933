//! Strata Operator - Kubernetes lifecycle management for database instances

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Api, Client};

use strata_common::crd::ResourceKind;
use strata_common::telemetry::{init_telemetry, TelemetryConfig};
use strata_common::{DEFAULT_AGENT_PORT, FIELD_MANAGER};
use strata_operator::context::Context;
use strata_operator::controller_runner::build_controllers;
use strata_operator::notify::parse_channel;

/// Strata - CRD-driven operator for database instances, users, grants and backups
#[derive(Parser, Debug)]
#[command(name = "strata-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// Port the per-instance agent listens on
    #[arg(long, global = true, env = "STRATA_AGENT_PORT", default_value_t = DEFAULT_AGENT_PORT)]
    agent_port: u16,

    /// Image for the agent sidecar container
    #[arg(long, global = true, env = "STRATA_AGENT_IMAGE")]
    agent_image: Option<String>,

    /// Notification channel as `name=webhook-url` (repeatable)
    #[arg(long = "notify-webhook", global = true, value_parser = parse_channel)]
    notify_webhooks: Vec<(String, String)>,

    /// Only watch this namespace
    #[arg(long, global = true, env = "STRATA_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Human-readable logs instead of JSON
    #[arg(long, global = true, env = "STRATA_LOG_TEXT")]
    log_text: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for kind in ResourceKind::ALL {
            let crd = serde_yaml::to_string(&kind.crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize {} CRD: {}", kind, e))?;
            println!("---\n{crd}");
        }
        return Ok(());
    }

    let args = cli.controller;
    init_telemetry(TelemetryConfig {
        service_name: "strata-operator".to_string(),
        json: !args.log_text,
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(args).await,
    }
}

/// Ensure all Strata CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};
    use kube::ResourceExt;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for kind in ResourceKind::ALL {
        let crd = kind.crd();
        tracing::info!("Installing {} CRD...", kind);
        crds.patch(&crd.name_any(), &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", kind, e))?;
    }

    tracing::info!("All Strata CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Strata operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let channels: BTreeMap<String, String> = args.notify_webhooks.into_iter().collect();
    tracing::info!(channels = channels.len(), "Notification channels configured");

    let mut builder = Context::builder(client.clone())
        .agent_port(args.agent_port)
        .channels(channels);
    if let Some(image) = args.agent_image {
        builder = builder.agent_image(image);
    }
    let ctx = Arc::new(
        builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?,
    );
    tracing::info!(incarnation = %ctx.crontab.incarnation(), "Scheduler ready");

    tracing::info!("Starting Strata controllers...");
    let controllers = build_controllers(client, ctx, args.watch_namespace);
    futures::future::join_all(controllers).await;

    tracing::info!("Strata operator shutting down");
    Ok(())
}
