//! eksforge-operator: provisions EKS clusters, control planes and node
//! groups for Cluster API.
//!
//! All six controllers run as concurrent tokio tasks within a single
//! binary, sharing a common Context.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tracing::info;
use warp::Filter;

use eksforge_operator::controller::{self, Context};
use eksforge_operator::helpers::OperatorConfig;
use eksforge_operator::store::KubeStore;

#[derive(Parser, Debug)]
#[command(
    name = "eksforge-operator",
    about = "Kubernetes operator for EKS clusters managed through Cluster API"
)]
struct Args {
    /// Retry interval for resources waiting on a prerequisite.
    #[arg(long, default_value = "10", env = "REQUEUE_INTERVAL_SECS")]
    requeue_interval_secs: u64,

    /// Backoff after an unexpected reconcile error.
    #[arg(long, default_value = "30", env = "ERROR_BACKOFF_SECS")]
    error_backoff_secs: u64,

    /// ModuleTemplate used for kubeconfig derivation when a control plane
    /// does not name one.
    #[arg(long, default_value = "eks-kubeconfig", env = "KUBECONFIG_TEMPLATE")]
    kubeconfig_template: String,

    /// Bind address for health probe endpoints (/healthz, /readyz).
    #[arg(long, default_value = ":8081", env = "HEALTH_PROBE_BIND_ADDRESS")]
    health_probe_bind_address: String,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let client = Client::try_default().await?;

    let config = OperatorConfig {
        requeue_interval: Duration::from_secs(args.requeue_interval_secs),
        error_backoff: Duration::from_secs(args.error_backoff_secs),
        kubeconfig_template: args.kubeconfig_template,
    };
    config.validate()?;
    info!(
        requeue = ?config.requeue_interval,
        kubeconfig_template = %config.kubeconfig_template,
        "starting eksforge-operator"
    );

    let store = KubeStore::new(
        client,
        Reporter {
            controller: "eksforge-operator".into(),
            instance: std::env::var("POD_NAME").ok(),
        },
    );
    let ctx = Arc::new(Context::new(store, config));

    // Accepts ":8081" as well as "0.0.0.0:8081".
    let health_addr: std::net::SocketAddr = args
        .health_probe_bind_address
        .strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or_else(|| args.health_probe_bind_address.clone())
        .parse()
        .with_context(|| {
            format!(
                "invalid --health-probe-bind-address {:?}",
                args.health_probe_bind_address
            )
        })?;

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    tokio::select! {
        _ = controller::run(ctx.clone()) => {},
        _ = warp::serve(health_routes).run(health_addr) => {},
    }

    Ok(())
}
