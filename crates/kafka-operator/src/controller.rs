//! KafkaCluster Controller
//!
//! This module wires the lifecycle reconciler into the Kubernetes controller
//! pattern. It watches KafkaCluster resources, serializes passes per cluster,
//! applies PodDisruptionBudgets and writes the resulting status back.

use crate::budget::build_pdbs;
use crate::config::ReconcilerConfig;
use crate::crd::{KafkaCluster, KafkaClusterStatus};
use crate::cruise_control::{CruiseControlClientConfig, HttpScalerFactory, ScalerFactory};
use crate::error::{OperatorError, Result};
use crate::health::{KubeHealthProbe, NodeHealthProbe};
use crate::reconciler::{configuration_error_status, validate_cluster, LifecycleReconciler};
use crate::workload::{PodRestarter, WorkloadRestarter};
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Finalizer name for cleanup operations
pub const FINALIZER_NAME: &str = "kafka.operator.dev/cluster-finalizer";

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "kafka-operator";

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
    /// Per-cluster locks serializing reconciliation passes
    pub cluster_locks: DashMap<String, Arc<Mutex<()>>>,
    pub scalers: Arc<dyn ScalerFactory>,
    pub probe: Arc<dyn NodeHealthProbe>,
    pub restarter: Arc<dyn WorkloadRestarter>,
    pub config: ReconcilerConfig,
}

impl ControllerContext {
    /// Context talking to Cruise Control over HTTP and to pods through the API server
    pub fn new(client: Client, config: ReconcilerConfig) -> Result<Self> {
        Ok(Self {
            metrics: Some(ControllerMetrics::new()),
            error_counts: DashMap::new(),
            cluster_locks: DashMap::new(),
            scalers: Arc::new(HttpScalerFactory::new(CruiseControlClientConfig::default())),
            probe: Arc::new(KubeHealthProbe::new(client.clone())?),
            restarter: Arc::new(PodRestarter::new(client.clone())),
            client,
            config,
        })
    }

    /// Lock guarding passes for one cluster
    pub fn cluster_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.cluster_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("kafka_operator_reconciliations_total"),
            errors: metrics::counter!("kafka_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("kafka_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn cluster_key(cluster: &KafkaCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_else(|| "default".to_string()),
        cluster.name_any()
    )
}

/// Start the KafkaCluster controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: ReconcilerConfig,
) -> Result<()> {
    let clusters: Api<KafkaCluster> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext::new(client.clone(), config)?);

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting KafkaCluster controller"
    );

    let pdbs = match &namespace {
        Some(ns) => Api::<PodDisruptionBudget>::namespaced(client.clone(), ns),
        None => Api::<PodDisruptionBudget>::all(client.clone()),
    };

    Controller::new(clusters, Config::default())
        .owns(pdbs, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<KafkaCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let key = cluster_key(&cluster);
    let clusters: Api<KafkaCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    let lock = ctx.cluster_lock(&key);
    let _guard = lock.lock().await;

    let result = finalizer(&clusters, FINALIZER_NAME, cluster, |event| async {
        match event {
            FinalizerEvent::Apply(cluster) => apply_cluster(cluster, ctx.clone()).await,
            FinalizerEvent::Cleanup(cluster) => cleanup_cluster(cluster, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    // Reset error backoff counter on success
    if result.is_ok() {
        ctx.error_counts.remove(&key);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        OperatorError::ReconcileFailed(e.to_string())
    })
}

/// Run one lifecycle pass and persist its outcome
#[instrument(skip(cluster, ctx))]
async fn apply_cluster(cluster: Arc<KafkaCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

    info!(name = %name, namespace = %namespace, "Reconciling KafkaCluster");

    if let Err(e) = validate_cluster(&cluster.spec) {
        return record_configuration_error(&ctx.client, &cluster, e).await;
    }

    let scaler = ctx.scalers.scaler_for(&cluster).await?;
    let pass = LifecycleReconciler {
        cluster: &cluster,
        scaler: scaler.as_ref(),
        probe: ctx.probe.as_ref(),
        restarter: ctx.restarter.as_ref(),
        config: &ctx.config,
        now: Utc::now(),
    }
    .reconcile()
    .await;

    let outcome = match pass {
        Ok(outcome) => outcome,
        Err(e) if e.is_configuration_error() => {
            return record_configuration_error(&ctx.client, &cluster, e).await;
        }
        Err(e) => return Err(e),
    };

    if cluster.spec.disruption_budget.create {
        for pdb in build_pdbs(&cluster, &outcome.budget) {
            apply_pdb(&ctx.client, &namespace, pdb).await?;
        }
    }

    update_status(&ctx.client, &namespace, &name, &outcome.status).await?;

    info!(name = %name, state = ?outcome.status.state, "Reconciliation complete");

    Ok(Action::requeue(outcome.requeue_after))
}

/// Persist a configuration error and wait for the spec to change
async fn record_configuration_error(
    client: &Client,
    cluster: &KafkaCluster,
    error: OperatorError,
) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    warn!(name = %name, error = %error, "Cluster spec is invalid");

    let status = configuration_error_status(cluster, &error, Utc::now());
    update_status(client, &namespace, &name, &status).await?;

    Ok(Action::await_change())
}

/// Stop in-flight Cruise Control work when the cluster is deleted
#[instrument(skip(cluster, ctx))]
async fn cleanup_cluster(cluster: Arc<KafkaCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let name = cluster.name_any();
    info!(name = %name, "Cleaning up KafkaCluster");

    // PodDisruptionBudgets carry owner references and are garbage-collected
    let in_flight = cluster
        .status
        .as_ref()
        .map(|s| {
            s.scale_operations
                .values()
                .any(|op| op.task_id.is_some() && !op.state.is_terminal())
        })
        .unwrap_or(false);

    if in_flight {
        match ctx.scalers.scaler_for(&cluster).await {
            Ok(scaler) => {
                if let Err(e) = scaler.stop_execution().await {
                    warn!(name = %name, error = %e, "Failed to stop Cruise Control execution");
                }
            }
            Err(e) => warn!(name = %name, error = %e, "No Cruise Control client for cleanup"),
        }
    }

    ctx.cluster_locks.remove(&cluster_key(&cluster));
    info!(name = %name, "Cleanup complete");

    Ok(Action::await_change())
}

/// Verify the operator still owns a resource before force-applying.
///
/// Rejects the apply when the existing resource is labelled as managed by a
/// different controller.
fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get("app.kubernetes.io/managed-by"));
    match managed_by {
        Some(manager) if manager != FIELD_MANAGER => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::InvalidConfig(format!(
                "resource '{}' is managed by '{}', not {}; refusing to force-apply",
                name, manager, FIELD_MANAGER
            )))
        }
        _ => Ok(()),
    }
}

/// Apply a PodDisruptionBudget using server-side apply
async fn apply_pdb(client: &Client, namespace: &str, pdb: PodDisruptionBudget) -> Result<()> {
    let api: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), namespace);
    let name = pdb
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| OperatorError::InvalidConfig("PDB missing metadata.name".into()))?;

    debug!(name = %name, "Applying PodDisruptionBudget");

    if let Ok(existing) = api.get(name).await {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &patch_params, &Patch::Apply(&pdb))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Update the cluster status subresource
///
/// Server-side apply drops map entries (removed brokers, for instance) that a
/// merge patch would leave behind.
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &KafkaClusterStatus,
) -> Result<()> {
    let api: Api<KafkaCluster> = Api::namespaced(client.clone(), namespace);

    debug!(name = %name, state = ?status.state, "Updating cluster status");

    let patch = serde_json::json!({
        "apiVersion": KafkaCluster::api_version(&()),
        "kind": KafkaCluster::kind(&()),
        "status": status
    });

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch_status(name, &patch_params, &Patch::Apply(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Error policy for the controller: exponential backoff
fn error_policy(
    cluster: Arc<KafkaCluster>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = cluster_key(&cluster);
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = match error.requeue_delay() {
        Some(base) => base
            .saturating_mul(2u32.saturating_pow((retries - 1).min(10)))
            .min(ctx.config.max_error_requeue),
        None => ctx.config.error_backoff(retries - 1),
    };

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}
