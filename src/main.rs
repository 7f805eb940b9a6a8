//! Service Catalog controller - reconciles brokers, instances and bindings

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use service_catalog::config::{ControllerConfig, RetryBudget};
use service_catalog::controller::{reconcilers, Context};
use service_catalog::crd::all_crds;
use service_catalog::dispatcher::Dispatcher;
use service_catalog::informer::{wait_for_sync, Informers};
use service_catalog::retry::BackoffConfig;

/// Service Catalog - Open Service Broker reconciliation controller
#[derive(Parser, Debug)]
#[command(name = "service-catalog", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "SC_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    controller: ControllerArgs,
}

/// Controller tuning
#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// Workers per resource kind
    #[arg(long, env = "SC_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Seconds between full resyncs of every cached object
    #[arg(long, env = "SC_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Seconds between polls of an asynchronous broker operation
    #[arg(long, env = "SC_POLL_INTERVAL_SECS", default_value_t = 10)]
    poll_interval_secs: u64,

    /// Timeout for a single broker request, in seconds
    #[arg(long, env = "SC_BROKER_TIMEOUT_SECS", default_value_t = 60)]
    broker_timeout_secs: u64,

    /// Open Service Broker API version header
    #[arg(long, env = "SC_OSB_API_VERSION", default_value = "2.13")]
    osb_api_version: String,

    /// Failed deprovision or unbind attempts before giving up
    #[arg(long, env = "SC_MAX_OPERATION_ATTEMPTS", default_value_t = 3)]
    max_operation_attempts: u32,

    /// Hours a single broker operation may keep retrying
    #[arg(long, env = "SC_MAX_OPERATION_HOURS", default_value_t = 168)]
    max_operation_hours: u64,

    /// First work-queue retry delay, in milliseconds
    #[arg(long, env = "SC_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    /// Cap on work-queue retry delay, in seconds
    #[arg(long, env = "SC_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,

    /// Apply the CRDs with server-side apply before starting
    #[arg(long, env = "SC_INSTALL_CRDS")]
    install_crds: bool,
}

impl ControllerArgs {
    fn config(&self) -> anyhow::Result<ControllerConfig> {
        let config = ControllerConfig {
            workers: self.workers,
            resync_period: Duration::from_secs(self.resync_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_secs(self.backoff_max_secs),
                ..Default::default()
            },
            retry_budget: RetryBudget {
                max_attempts: self.max_operation_attempts,
                max_duration: Duration::from_secs(self.max_operation_hours * 3600),
            },
            broker_timeout: Duration::from_secs(self.broker_timeout_secs),
            osb_api_version: self.osb_api_version.clone(),
        };
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The broker client and the kube client both speak TLS through rustls;
    // without a provider neither can connect.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The controller cannot reach the API server or brokers without TLS.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,service_catalog=debug,kube=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.log_json.then(|| fmt::layer().json()))
        .with((!cli.log_json).then(fmt::layer))
        .init();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    run_controller(cli.controller).await
}

/// Apply every CRD with server-side apply so the served schema matches this binary
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("service-catalog-controller").force();

    for crd in all_crds() {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("CRD without metadata.name"))?;
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All service catalog CRDs installed/updated");
    Ok(())
}

/// Run the controller until SIGINT or SIGTERM, then drain in-flight work
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = args.config()?;
    tracing::info!(
        workers = config.workers,
        resync_secs = config.resync_period.as_secs(),
        poll_interval_secs = config.poll_interval.as_secs(),
        backoff_base_ms = config.backoff.initial_delay.as_millis() as u64,
        backoff_max_secs = config.backoff.max_delay.as_secs(),
        "Service catalog controller starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let informers = Informers::new();
    let caches = informers.caches();
    let ctx = Arc::new(
        Context::builder(client.clone(), caches.clone())
            .config(config.clone())
            .build(),
    );
    let dispatcher = Arc::new(Dispatcher::new(&config, reconcilers(ctx)));

    let watches = informers.start(client, Arc::clone(&dispatcher), config.resync_period);
    tracing::info!("Waiting for caches to sync...");
    wait_for_sync(&caches)
        .await
        .map_err(|e| anyhow::anyhow!("Cache sync failed: {}", e))?;
    tracing::info!("Caches synced, starting workers");
    let workers = dispatcher.start();

    shutdown_signal().await;
    tracing::info!("Shutdown requested, draining work queues");

    for watch in &watches {
        watch.abort();
    }
    dispatcher.shutdown().await;
    futures::future::join_all(workers).await;

    tracing::info!("Service catalog controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
