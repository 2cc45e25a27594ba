use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State as AxumState;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};

use docdb_operator::controller::{self, RunConfig, State};
use docdb_operator::{telemetry, topology};

/// The DocDB operator: reconciles `DocDb` custom resources into managed
/// PG-Cluster deployments, a front-door service, gateway TLS, and
/// optional multi-cluster replication.
#[derive(Parser, Debug)]
#[command(name = "docdb-operator", version)]
struct Cli {
    /// Address the health and metrics HTTP server binds to.
    #[arg(long, env = "DOCDB_OPERATOR_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// kubeconfig context to use instead of the current one.
    #[arg(long, env = "DOCDB_OPERATOR_KUBE_CONTEXT")]
    kube_context: Option<String>,

    /// Requeue delay after a transient error (kube API hiccup, dependency
    /// not ready yet).
    #[arg(long, env = "DOCDB_OPERATOR_REQUEUE_SHORT_SECS", default_value_t = 10)]
    requeue_short_secs: u64,

    /// Requeue delay after a user-misconfiguration or fatal-invariant
    /// error, and the idle poll period for clusters not participating in a
    /// `DocDb`'s replication topology.
    #[arg(long, env = "DOCDB_OPERATOR_REQUEUE_LONG_SECS", default_value_t = 30)]
    requeue_long_secs: u64,

    /// Steady-state poll period between successful reconciles.
    #[arg(long, env = "DOCDB_OPERATOR_POLL_INTERVAL_SECS", default_value_t = 30)]
    poll_interval_secs: u64,

    /// Timeout for the Multi-Cluster promotion-token HTTP fetch.
    #[arg(long, env = "DOCDB_OPERATOR_TOKEN_FETCH_TIMEOUT_SECS", default_value_t = 10)]
    token_fetch_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    telemetry::init();
    let cli = Cli::parse();

    let client = match build_client(cli.kube_context.as_deref()).await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("failed to build Kubernetes client: {e}");
            std::process::exit(1);
        }
    };

    let local_identity = match topology::local_identity(&client).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!("failed to resolve local cluster identity: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(local_identity = %local_identity, "resolved local cluster identity");

    let config = RunConfig {
        requeue_short: Duration::from_secs(cli.requeue_short_secs),
        requeue_long: Duration::from_secs(cli.requeue_long_secs),
        poll_interval: Duration::from_secs(cli.poll_interval_secs),
        token_fetch_timeout: Duration::from_secs(cli.token_fetch_timeout_secs),
    };

    let state = State::default();
    let http = tokio::spawn(run_http_server(cli.http_addr, state.clone()));
    let controller = controller::run(state, client, local_identity, config);

    tokio::select! {
        _ = controller => {},
        res = http => {
            if let Err(e) = res {
                tracing::error!("health/metrics server task panicked: {e}");
            }
        }
    }
}

async fn build_client(context: Option<&str>) -> kube::Result<kube::Client> {
    match context {
        Some(context) => {
            let mut kubeconfig = kube::config::Kubeconfig::read()?;
            kubeconfig.current_context = Some(context.to_string());
            let config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?;
            kube::Client::try_from(config)
        }
        None => kube::Client::try_default().await,
    }
}

async fn run_http_server(addr: SocketAddr, state: State) {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("health/metrics server exited: {e}");
    }
}

async fn healthz(AxumState(state): AxumState<State>) -> String {
    format!("last reconcile event: {}", state.last_event().await)
}

async fn metrics(AxumState(state): AxumState<State>) -> Vec<u8> {
    let families = state.metrics();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("failed to encode metrics: {e}");
    }
    buffer
}
