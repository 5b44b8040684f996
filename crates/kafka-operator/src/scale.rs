//! Scale and rebalance reconciliation
//!
//! Brokers added to or removed from the declared spec, and explicit rebalance
//! requests, become [`ScaleOperation`]s stored in cluster status. Each pass
//! moves every operation one step along:
//!
//! 1. not yet submitted: guards, then submit to Cruise Control
//! 2. submitted: poll the engine's user tasks in one bulk request
//! 3. terminal: fold the effect into broker state exactly once
//!
//! Operations are never resubmitted after a terminal failure.

use crate::crd::{
    BrokerPhase, KafkaCluster, KafkaClusterStatus, OperationState, ScaleOperation,
    ScaleOperationKind,
};
use crate::cruise_control::{KafkaClusterState, Scaler, Submission, TaskState};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};

/// Condition type reporting the last failed Cruise Control operation
pub const SCALE_OPERATION_FAILED: &str = "ScaleOperationFailed";

/// Result of one scale pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleOutcome {
    /// Operations submitted to Cruise Control during this pass
    pub submitted: Vec<String>,
    /// Operations whose effect was applied during this pass
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Some operation is not terminal yet
    pub in_progress: bool,
    /// Cruise Control refused work because it was not ready
    pub engine_not_ready: bool,
    /// Transport errors talking to Cruise Control
    pub transport_errors: u32,
}

fn kind_name(kind: ScaleOperationKind) -> &'static str {
    match kind {
        ScaleOperationKind::AddBrokers => "add_brokers",
        ScaleOperationKind::RemoveBrokers => "remove_brokers",
        ScaleOperationKind::RemoveDisks => "remove_disks",
        ScaleOperationKind::Rebalance => "rebalance",
        ScaleOperationKind::RebalanceDisks => "rebalance_disks",
        ScaleOperationKind::StopExecution => "stop_execution",
    }
}

fn unique_id(base: String, existing: &BTreeMap<String, ScaleOperation>) -> String {
    let mut candidate = base.clone();
    let mut suffix = 1u32;
    while existing.contains_key(&candidate) {
        candidate = format!("{}-{}", base, suffix);
        suffix += 1;
    }
    candidate
}

fn pending_for(
    status: &KafkaClusterStatus,
    kind: ScaleOperationKind,
    broker_id: i32,
) -> bool {
    status
        .scale_operations
        .values()
        .any(|op| op.kind == kind && !op.state.is_terminal() && op.targets(broker_id))
}

fn failed_for(
    status: &KafkaClusterStatus,
    kind: ScaleOperationKind,
    broker_id: i32,
) -> bool {
    status.scale_operations.values().any(|op| {
        op.kind == kind && op.state == OperationState::CompletedWithError && op.targets(broker_id)
    })
}

/// Operations implied by the declared spec that are not tracked yet
///
/// Brokers declared but never added become one `AddBrokers` operation; brokers
/// no longer declared become one `RemoveBrokers` operation; each rebalance
/// request becomes an operation named after it, once. A broker whose removal
/// failed is left alone until someone intervenes.
pub fn derive_operations(cluster: &KafkaCluster, status: &KafkaClusterStatus) -> Vec<ScaleOperation> {
    let spec = &cluster.spec;
    let generation = cluster.metadata.generation.unwrap_or(0);
    let declared: BTreeSet<i32> = spec.brokers.iter().map(|b| b.id).collect();
    let mut operations = Vec::new();
    let mut existing = status.scale_operations.clone();

    let to_add: Vec<i32> = status
        .brokers_state
        .iter()
        .filter_map(|(key, state)| {
            let id = key.parse::<i32>().ok()?;
            (declared.contains(&id)
                && state.is_broker_node()
                && state.phase == BrokerPhase::Configured
                && !pending_for(status, ScaleOperationKind::AddBrokers, id))
            .then_some(id)
        })
        .collect();

    let to_remove: Vec<i32> = status
        .brokers_state
        .iter()
        .filter_map(|(key, state)| {
            let id = key.parse::<i32>().ok()?;
            (!declared.contains(&id)
                && state.is_broker_node()
                && !pending_for(status, ScaleOperationKind::RemoveBrokers, id)
                && !failed_for(status, ScaleOperationKind::RemoveBrokers, id))
            .then_some(id)
        })
        .collect();

    for (prefix, kind, mut ids) in [
        ("add-brokers", ScaleOperationKind::AddBrokers, to_add),
        ("remove-brokers", ScaleOperationKind::RemoveBrokers, to_remove),
    ] {
        if ids.is_empty() {
            continue;
        }
        ids.sort_unstable();
        let joined = ids
            .iter()
            .map(i32::to_string)
            .collect::<Vec<_>>()
            .join("-");
        let id = unique_id(format!("{}-{}-g{}", prefix, joined, generation), &existing);
        let op = ScaleOperation::new(id.clone(), kind, ids, BTreeMap::new());
        existing.insert(id, op.clone());
        operations.push(op);
    }

    for request in &spec.cruise_control_config.rebalance_requests {
        if existing.contains_key(&request.name) {
            continue;
        }
        let op = ScaleOperation::new(
            request.name.clone(),
            request.kind.into(),
            request.broker_ids.clone(),
            request.parameters.clone(),
        );
        existing.insert(request.name.clone(), op.clone());
        operations.push(op);
    }

    operations
}

/// Reconciles Cruise Control operations for one cluster
pub struct ScaleReconciler<'a> {
    pub cluster: &'a KafkaCluster,
    pub scaler: &'a dyn Scaler,
    pub now: DateTime<Utc>,
}

impl ScaleReconciler<'_> {
    #[instrument(skip_all, fields(cluster = %self.cluster.name_any()))]
    pub async fn run(&self, status: &mut KafkaClusterStatus) -> Result<ScaleOutcome> {
        let mut outcome = ScaleOutcome::default();

        for mut op in derive_operations(self.cluster, status) {
            info!(operation = %op.id, kind = kind_name(op.kind), brokers = ?op.broker_ids, "Tracking new operation");
            op.created_at = Some(self.stamp());
            status.scale_operations.insert(op.id.clone(), op);
        }

        self.expire_unscheduled(status);
        self.submit_pending(status, &mut outcome).await;
        self.poll_submitted(status, &mut outcome).await;
        self.apply_terminal(status, &mut outcome);

        outcome.in_progress = status
            .scale_operations
            .values()
            .any(|op| !op.state.is_terminal());
        Ok(outcome)
    }

    fn stamp(&self) -> String {
        self.now.to_rfc3339()
    }

    async fn engine_view(&self, cache: &mut Option<KafkaClusterState>) -> Result<KafkaClusterState> {
        if let Some(state) = cache {
            return Ok(state.clone());
        }
        let state = self.scaler.kafka_cluster_state().await?;
        *cache = Some(state.clone());
        Ok(state)
    }

    async fn submit_pending(&self, status: &mut KafkaClusterStatus, outcome: &mut ScaleOutcome) {
        let declared: BTreeSet<i32> = self.cluster.spec.brokers.iter().map(|b| b.id).collect();
        let mut engine: Option<KafkaClusterState> = None;
        let pending: Vec<String> = status
            .scale_operations
            .values()
            .filter(|op| op.task_id.is_none() && op.state == OperationState::NotScheduled)
            .map(|op| op.id.clone())
            .collect();

        for id in pending {
            let Some(mut op) = status.scale_operations.get(&id).cloned() else {
                continue;
            };

            match op.kind {
                ScaleOperationKind::AddBrokers => {
                    // Only brokers still declared and not yet running need adding
                    op.broker_ids.retain(|b| {
                        declared.contains(b)
                            && status
                                .brokers_state
                                .get(&b.to_string())
                                .is_some_and(|s| s.phase != BrokerPhase::Running)
                    });
                    if op.broker_ids.is_empty() {
                        debug!(operation = %op.id, "Nothing left to add");
                        op.state = OperationState::Completed;
                        op.last_updated = Some(self.stamp());
                        status.scale_operations.insert(id, op);
                        continue;
                    }
                }
                ScaleOperationKind::RemoveBrokers => {
                    let adding = op
                        .broker_ids
                        .iter()
                        .any(|b| pending_for(status, ScaleOperationKind::AddBrokers, *b));
                    if adding {
                        debug!(operation = %op.id, "Waiting for add to finish before removing");
                        status.scale_operations.insert(id, op);
                        continue;
                    }
                    op.broker_ids.retain(|b| !declared.contains(b));
                }
                _ => {}
            }

            let needs_engine_view = matches!(
                op.kind,
                ScaleOperationKind::AddBrokers | ScaleOperationKind::RemoveBrokers
            );
            if needs_engine_view {
                let view = match self.engine_view(&mut engine).await {
                    Ok(view) => view,
                    Err(e) => {
                        self.record_transport_error(&mut op, &e.to_string(), outcome);
                        status.scale_operations.insert(id, op);
                        continue;
                    }
                };

                let known = |b: &i32| view.has_broker(&b.to_string());
                if op.kind == ScaleOperationKind::AddBrokers && !op.broker_ids.iter().all(known) {
                    debug!(operation = %op.id, "Brokers not registered with Kafka yet");
                    status.scale_operations.insert(id, op);
                    continue;
                }
                if op.kind == ScaleOperationKind::RemoveBrokers && !op.broker_ids.iter().any(known) {
                    info!(operation = %op.id, "Brokers already gone from Kafka, nothing to drain");
                    op.state = OperationState::Completed;
                    op.last_updated = Some(self.stamp());
                    status.scale_operations.insert(id, op);
                    continue;
                }
            }

            match self.submit(&op).await {
                Ok(Submission::Accepted(task)) => {
                    info!(operation = %op.id, task_id = %task.task_id, "Cruise Control accepted operation");
                    op.state = match task.state {
                        // Drained only once its brokers hold no replicas; the poll decides
                        TaskState::Completed if op.kind == ScaleOperationKind::RemoveBrokers => {
                            OperationState::InProgress
                        }
                        TaskState::Completed => OperationState::Completed,
                        TaskState::CompletedWithError => OperationState::CompletedWithError,
                        TaskState::Active => OperationState::InProgress,
                    };
                    op.task_id = Some(task.task_id);
                    op.first_scheduled = Some(self.stamp());
                    op.last_updated = Some(self.stamp());
                    op.error = None;
                    let phase = match op.kind {
                        ScaleOperationKind::AddBrokers => Some(BrokerPhase::Upscaling),
                        ScaleOperationKind::RemoveBrokers => Some(BrokerPhase::Downscaling),
                        _ => None,
                    };
                    if let Some(phase) = phase {
                        for broker in &op.broker_ids {
                            if let Some(state) = status.brokers_state.get_mut(&broker.to_string()) {
                                state.phase = phase;
                            }
                        }
                    }
                    outcome.submitted.push(op.id.clone());
                    metrics::counter!("kafka_operator_cruise_control_tasks_total", "kind" => kind_name(op.kind)).increment(1);
                }
                Ok(Submission::EngineNotReady) => {
                    debug!(operation = %op.id, "Cruise Control not ready");
                    outcome.engine_not_ready = true;
                }
                Err(e) => self.record_transport_error(&mut op, &e.to_string(), outcome),
            }
            status.scale_operations.insert(id, op);
        }
    }

    fn record_transport_error(&self, op: &mut ScaleOperation, error: &str, outcome: &mut ScaleOutcome) {
        warn!(operation = %op.id, retries = op.retry_count + 1, error = %error, "Cruise Control request failed");
        op.retry_count += 1;
        op.error = Some(error.to_string());
        op.last_updated = Some(self.stamp());
        outcome.transport_errors += 1;
    }

    async fn submit(&self, op: &ScaleOperation) -> Result<Submission> {
        let ids: Vec<String> = op.broker_ids.iter().map(i32::to_string).collect();
        let with_brokers = |key: &str| {
            let mut params = op.parameters.clone();
            if !ids.is_empty() {
                params.insert(key.to_string(), ids.join(","));
            }
            params
        };

        match op.kind {
            ScaleOperationKind::AddBrokers if op.parameters.is_empty() => {
                self.scaler.add_brokers(&ids).await
            }
            ScaleOperationKind::AddBrokers => {
                self.scaler
                    .add_brokers_with_params(&with_brokers("brokerid"))
                    .await
            }
            ScaleOperationKind::RemoveBrokers if op.parameters.is_empty() => {
                self.scaler.remove_brokers(&ids).await
            }
            ScaleOperationKind::RemoveBrokers => {
                self.scaler
                    .remove_brokers_with_params(&with_brokers("brokerid"))
                    .await
            }
            ScaleOperationKind::RemoveDisks => {
                self.scaler
                    .remove_disks_with_params(&op.parameters)
                    .await
            }
            ScaleOperationKind::Rebalance => {
                self.scaler
                    .rebalance_with_params(&with_brokers("destination_broker_ids"))
                    .await
            }
            ScaleOperationKind::RebalanceDisks => self.scaler.rebalance_disks(&ids).await,
            ScaleOperationKind::StopExecution => self.scaler.stop_execution().await,
        }
    }

    async fn poll_submitted(&self, status: &mut KafkaClusterStatus, outcome: &mut ScaleOutcome) {
        let polled: Vec<(String, String)> = status
            .scale_operations
            .values()
            .filter(|op| !op.state.is_terminal())
            .filter_map(|op| op.task_id.clone().map(|task| (op.id.clone(), task)))
            .collect();
        if polled.is_empty() {
            return;
        }

        let task_ids: Vec<String> = polled.iter().map(|(_, task)| task.clone()).collect();
        let tasks = match self.scaler.user_tasks(&task_ids).await {
            Ok(tasks) => tasks
                .into_iter()
                .map(|t| (t.task_id.clone(), t))
                .collect::<BTreeMap<_, _>>(),
            Err(e) => {
                for (id, _) in &polled {
                    if let Some(op) = status.scale_operations.get_mut(id) {
                        self.record_transport_error(op, &e.to_string(), outcome);
                    }
                }
                self.expire(status, &polled);
                return;
            }
        };

        let mut replicas: Option<BTreeMap<String, i32>> = None;
        for (id, task_id) in &polled {
            let Some(mut op) = status.scale_operations.get(id).cloned() else {
                continue;
            };

            match tasks.get(task_id).map(|t| t.state) {
                Some(TaskState::Active) => op.state = OperationState::Active,
                Some(TaskState::Completed) if op.kind == ScaleOperationKind::RemoveBrokers => {
                    if replicas.is_none() {
                        match self.scaler.partition_replicas_by_broker().await {
                            Ok(r) => replicas = Some(r),
                            Err(e) => {
                                self.record_transport_error(&mut op, &e.to_string(), outcome);
                                status.scale_operations.insert(id.clone(), op);
                                continue;
                            }
                        }
                    }
                    let remaining: i32 = op
                        .broker_ids
                        .iter()
                        .filter_map(|b| replicas.as_ref().and_then(|r| r.get(&b.to_string())))
                        .sum();
                    if remaining == 0 {
                        op.state = OperationState::Completed;
                    } else {
                        info!(operation = %op.id, remaining, "Task finished but replicas remain on removed brokers");
                        op.state = OperationState::Active;
                    }
                }
                Some(TaskState::Completed) => op.state = OperationState::Completed,
                Some(TaskState::CompletedWithError) => {
                    op.state = OperationState::CompletedWithError;
                    op.error = Some(format!("Cruise Control task {} completed with error", task_id));
                }
                None => {
                    op.state = OperationState::CompletedWithError;
                    op.error = Some(format!("Cruise Control task {} is unknown to the engine", task_id));
                }
            }
            op.last_updated = Some(self.stamp());
            status.scale_operations.insert(id.clone(), op);
        }

        self.expire(status, &polled);
    }

    /// Give up on operations that could not be submitted within the task timeout
    fn expire_unscheduled(&self, status: &mut KafkaClusterStatus) {
        let timeout_secs = self.cluster.spec.cruise_control_config.task_timeout_seconds;
        let timeout = Duration::seconds(timeout_secs);
        for op in status.scale_operations.values_mut() {
            if op.task_id.is_some() || op.state != OperationState::NotScheduled {
                continue;
            }
            let created = op
                .created_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
            let Some(created) = created else {
                op.created_at = Some(self.stamp());
                continue;
            };
            if self.now - created.with_timezone(&Utc) >= timeout {
                warn!(operation = %op.id, "Operation was never submitted, giving up");
                op.state = OperationState::CompletedWithError;
                op.error = Some(format!("not submitted within {}s", timeout_secs));
                op.last_updated = Some(self.stamp());
            }
        }
    }

    /// Give up on tasks that outlived the task timeout
    fn expire(&self, status: &mut KafkaClusterStatus, polled: &[(String, String)]) {
        let timeout = Duration::seconds(self.cluster.spec.cruise_control_config.task_timeout_seconds);
        for (id, _) in polled {
            let Some(op) = status.scale_operations.get_mut(id) else {
                continue;
            };
            if op.state.is_terminal() {
                continue;
            }
            let expired = op
                .first_scheduled
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .is_some_and(|started| self.now - started.with_timezone(&Utc) >= timeout);
            if expired {
                warn!(operation = %op.id, "Cruise Control task timed out");
                op.state = OperationState::CompletedWithError;
                op.error = Some(format!(
                    "timed out after {}s",
                    self.cluster.spec.cruise_control_config.task_timeout_seconds
                ));
                op.last_updated = Some(self.stamp());
            }
        }
    }

    fn apply_terminal(&self, status: &mut KafkaClusterStatus, outcome: &mut ScaleOutcome) {
        let ready: Vec<String> = status
            .scale_operations
            .values()
            .filter(|op| op.state.is_terminal() && !op.applied)
            .map(|op| op.id.clone())
            .collect();
        let declared: BTreeSet<i32> = self.cluster.spec.brokers.iter().map(|b| b.id).collect();

        for id in ready {
            let Some(op) = status.scale_operations.get(&id).cloned() else {
                continue;
            };
            let succeeded = op.state == OperationState::Completed;

            match (op.kind, succeeded) {
                (ScaleOperationKind::AddBrokers, true) => {
                    for broker in &op.broker_ids {
                        if let Some(state) = status.brokers_state.get_mut(&broker.to_string()) {
                            state.phase = BrokerPhase::Running;
                        }
                    }
                }
                (ScaleOperationKind::RemoveBrokers, true) => {
                    for broker in &op.broker_ids {
                        if declared.contains(broker) {
                            continue;
                        }
                        status.brokers_state.remove(&broker.to_string());
                    }
                }
                (ScaleOperationKind::AddBrokers | ScaleOperationKind::RemoveBrokers, false) => {
                    for broker in &op.broker_ids {
                        if let Some(state) = status.brokers_state.get_mut(&broker.to_string()) {
                            state.phase = BrokerPhase::Failed;
                        }
                    }
                }
                _ => {}
            }

            if succeeded {
                info!(operation = %op.id, kind = kind_name(op.kind), "Operation completed");
                outcome.completed.push(op.id.clone());
                if status.condition(SCALE_OPERATION_FAILED).is_some() {
                    status.set_condition(
                        SCALE_OPERATION_FAILED,
                        false,
                        "OperationSucceeded",
                        format!("operation {} completed", op.id),
                        &self.stamp(),
                    );
                }
            } else {
                let error = op.error.clone().unwrap_or_else(|| "unknown error".to_string());
                warn!(operation = %op.id, kind = kind_name(op.kind), error = %error, "Operation failed");
                outcome.failed.push(op.id.clone());
                status.set_condition(
                    SCALE_OPERATION_FAILED,
                    true,
                    "TaskFailed",
                    format!("operation {} failed: {}", op.id, error),
                    &self.stamp(),
                );
            }

            if let Some(op) = status.scale_operations.get_mut(&id) {
                op.applied = true;
            }
        }
    }
}
