//! Kafka Cluster Lifecycle Operator
//!
//! Watches KafkaCluster resources and drives rolling upgrades, scaling and
//! Cruise Control rebalancing within disruption budgets.

use anyhow::{Context, Result};
use clap::Parser;
use kafka_operator::config::ReconcilerConfig;
use kafka_operator::controller;
use kube::Client;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(name = "kafka-operator")]
#[command(about = "Kubernetes operator for Kafka cluster lifecycle management")]
#[command(version)]
struct Args {
    /// Prometheus exporter address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Liveness endpoint address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Requeue interval for settled clusters, in seconds
    #[arg(long, env = "STEADY_REQUEUE_SECS", default_value = "300")]
    steady_requeue_secs: u64,

    /// Requeue interval while work is in flight, in seconds
    #[arg(long, env = "ACTIVE_REQUEUE_SECS", default_value = "10")]
    active_requeue_secs: u64,

    /// Requeue interval while Cruise Control is not ready, in seconds
    #[arg(long, env = "ENGINE_NOT_READY_REQUEUE_SECS", default_value = "20")]
    engine_not_ready_requeue_secs: u64,

    /// Print the KafkaCluster CRD as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            steady_requeue: Duration::from_secs(self.steady_requeue_secs),
            active_requeue: Duration::from_secs(self.active_requeue_secs),
            engine_not_ready_requeue: Duration::from_secs(self.engine_not_ready_requeue_secs),
            ..ReconcilerConfig::default()
        }
    }

    fn watch_namespace(&self) -> Option<String> {
        Some(self.namespace.trim())
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
    }
}

/// Set while the controller loop is running
#[derive(Debug, Clone, Default)]
struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn set(&self, live: bool) {
        self.0.store(live, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Marks the controller live until the returned guard is dropped
    fn running(&self) -> LivenessGuard {
        self.set(true);
        LivenessGuard(self.clone())
    }
}

struct LivenessGuard(Liveness);

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        return print_crd();
    }

    init_logging(&args);

    let namespace = args.watch_namespace();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting Kafka operator"
    );

    install_metrics_exporter(args.metrics_addr)?;

    let liveness = Liveness::default();
    let health_addr = args.health_addr;
    let health = liveness.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_addr, health).await {
            error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let _live = liveness.running();
    let result = controller::run_controller(client, namespace, args.reconciler_config()).await;
    warn!("Controller loop exited");
    result.context("Controller failed")
}

fn init_logging(args: &Args) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Install the Prometheus exporter; it serves from its own background task
fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics exporter");
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")
}

fn health_response(live: bool) -> &'static str {
    if live {
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK"
    } else {
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 11\r\nConnection: close\r\n\r\nUNAVAILABLE"
    }
}

/// Answer every request with the controller's liveness
async fn serve_health(addr: SocketAddr, liveness: Liveness) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;
    info!(address = %addr, "Health server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let liveness = liveness.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = health_response(liveness.is_live());
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = kafka_operator::crd::KafkaCluster::crd();
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
