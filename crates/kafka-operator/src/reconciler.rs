//! Cluster lifecycle reconciliation
//!
//! One pass takes the declared spec and the last observed status and produces
//! the next status:
//!
//! 1. sync declared members into broker state
//! 2. compute the disruption budget (a configuration error stops the pass)
//! 3. move Cruise Control operations along
//! 4. move the rolling upgrade along
//! 5. aggregate cluster state and conditions
//!
//! A pass never waits for Cruise Control tasks or restarted brokers. Anything
//! still in flight is reported through `requeue_after`.

use crate::budget::DisruptionBudget;
use crate::config::ReconcilerConfig;
use crate::crd::{
    BrokerPhase, BrokerState, ClusterState, KafkaCluster, KafkaClusterSpec, KafkaClusterStatus,
};
use crate::cruise_control::Scaler;
use crate::error::{OperatorError, Result};
use crate::health::NodeHealthProbe;
use crate::rolling_upgrade::{desired_revision, RollingUpgrade, UpgradeOutcome};
use crate::scale::{ScaleOutcome, ScaleReconciler};
use crate::workload::WorkloadRestarter;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument};
use validator::Validate;

/// Condition type reporting an invalid declared spec
pub const CONFIGURATION_ERROR: &str = "ConfigurationError";

/// Condition type reporting overall readiness
pub const READY: &str = "Ready";

/// Result of one lifecycle pass
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub status: KafkaClusterStatus,
    pub budget: DisruptionBudget,
    pub scale: ScaleOutcome,
    pub upgrade: UpgradeOutcome,
    pub requeue_after: Duration,
}

/// Check the declared spec beyond what the schema enforces
pub fn validate_cluster(spec: &KafkaClusterSpec) -> Result<()> {
    if let Err(errors) = spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        return Err(OperatorError::InvalidConfig(error_messages.join("; ")));
    }

    let listeners = &spec.listeners_config.internal_listeners;
    let inner = listeners
        .iter()
        .filter(|l| l.used_for_inner_broker_communication)
        .count();
    if inner != 1 {
        return Err(OperatorError::InvalidConfig(format!(
            "exactly one internal listener must be used for inner broker communication, found {}",
            inner
        )));
    }

    if spec.kraft_mode {
        let controller = listeners
            .iter()
            .filter(|l| l.used_for_controller_communication)
            .count();
        if controller != 1 {
            return Err(OperatorError::InvalidConfig(format!(
                "exactly one internal listener must be used for controller communication in KRaft mode, found {}",
                controller
            )));
        }

        let mut controllers = 0;
        for broker in &spec.brokers {
            if spec.effective_broker_config(broker)?.is_controller_node() {
                controllers += 1;
            }
        }
        if controllers == 0 {
            return Err(OperatorError::InvalidConfig(
                "KRaft mode requires at least one node with the controller role".to_string(),
            ));
        }
    } else {
        for broker in &spec.brokers {
            if spec.effective_broker_config(broker)?.is_controller_node() {
                return Err(OperatorError::InvalidConfig(format!(
                    "broker {} declares the controller role outside KRaft mode",
                    broker.id
                )));
            }
        }
    }

    for broker in &spec.brokers {
        spec.effective_broker_config(broker)?;
    }
    Ok(())
}

/// Record declared members in broker state
///
/// Members of a brand-new cluster start out running. Brokers declared later
/// start `Configured` and wait for Cruise Control to add them. Controller-only
/// nodes hold no partitions, so they join and leave without an operation.
pub fn sync_members(spec: &KafkaClusterSpec, status: &mut KafkaClusterStatus) -> Result<()> {
    let initial = status.brokers_state.is_empty();
    let declared: BTreeSet<String> = spec.brokers.iter().map(|b| b.id.to_string()).collect();

    for broker in &spec.brokers {
        let config = spec.effective_broker_config(broker)?;
        let key = broker.id.to_string();

        match status.brokers_state.get_mut(&key) {
            Some(state) => {
                state.rack = config.rack_or_default();
                state.roles = config.roles.clone();
            }
            None => {
                let mut state = BrokerState::new(&config);
                state.upgrade.observed_revision = Some(desired_revision(spec, broker)?);
                if initial || config.is_controller_only() {
                    state.phase = BrokerPhase::Running;
                }
                debug!(broker_id = broker.id, phase = ?state.phase, "Tracking declared node");
                status.brokers_state.insert(key, state);
            }
        }
    }

    status
        .brokers_state
        .retain(|key, state| declared.contains(key) || !state.is_controller_only());
    Ok(())
}

/// Status recording a configuration error
pub fn configuration_error_status(
    cluster: &KafkaCluster,
    error: &OperatorError,
    now: DateTime<Utc>,
) -> KafkaClusterStatus {
    let mut status = cluster.status.clone().unwrap_or_default();
    let stamp = now.to_rfc3339();
    status.state = ClusterState::Error;
    status.message = Some(error.to_string());
    status.observed_generation = cluster.metadata.generation.unwrap_or(0);
    status.last_updated = Some(stamp.clone());
    status.set_condition(
        CONFIGURATION_ERROR,
        true,
        "InvalidSpec",
        error.to_string(),
        &stamp,
    );
    status.set_condition(READY, false, "ConfigurationError", error.to_string(), &stamp);
    status
}

/// Runs one lifecycle pass for a cluster
pub struct LifecycleReconciler<'a> {
    pub cluster: &'a KafkaCluster,
    pub scaler: &'a dyn Scaler,
    pub probe: &'a dyn NodeHealthProbe,
    pub restarter: &'a dyn WorkloadRestarter,
    pub config: &'a ReconcilerConfig,
    pub now: DateTime<Utc>,
}

impl LifecycleReconciler<'_> {
    #[instrument(skip_all, fields(cluster = %self.cluster.name_any()))]
    pub async fn reconcile(&self) -> Result<PassOutcome> {
        let spec = &self.cluster.spec;
        let mut status = self.cluster.status.clone().unwrap_or_default();

        sync_members(spec, &mut status)?;

        let budget = DisruptionBudget::compute(spec, &status)?;
        status.min_available_brokers = Some(i32::try_from(budget.min_available_brokers).unwrap_or(i32::MAX));
        status.min_available_controllers = budget
            .min_available_controllers
            .map(|m| i32::try_from(m).unwrap_or(i32::MAX));

        let scale = ScaleReconciler {
            cluster: self.cluster,
            scaler: self.scaler,
            now: self.now,
        }
        .run(&mut status)
        .await?;

        let upgrade = RollingUpgrade {
            cluster: self.cluster,
            scaler: self.scaler,
            probe: self.probe,
            restarter: self.restarter,
            now: self.now,
        }
        .run(&mut status, &budget)
        .await?;

        self.aggregate(&mut status, &scale, &upgrade);

        let requeue_after = if scale.engine_not_ready {
            self.config.engine_not_ready_requeue
        } else if scale.in_progress || upgrade.in_progress || scale.transport_errors > 0 {
            self.config.active_requeue
        } else {
            self.config.steady_requeue
        };

        info!(
            state = ?status.state,
            disrupted = status.disrupted_brokers,
            min_available_brokers = budget.min_available_brokers,
            requeue_secs = requeue_after.as_secs(),
            "Lifecycle pass complete"
        );

        Ok(PassOutcome {
            status,
            budget,
            scale,
            upgrade,
            requeue_after,
        })
    }

    fn aggregate(
        &self,
        status: &mut KafkaClusterStatus,
        scale: &ScaleOutcome,
        upgrade: &UpgradeOutcome,
    ) {
        let stamp = self.now.to_rfc3339();
        let upgrading = status
            .brokers_state
            .values()
            .any(|s| s.upgrade.phase.is_in_flight());
        let settling = status.brokers_state.values().any(|s| {
            matches!(
                s.phase,
                BrokerPhase::Configured | BrokerPhase::Upscaling | BrokerPhase::Downscaling
            )
        });
        let failed: Vec<&String> = status
            .brokers_state
            .iter()
            .filter(|(_, s)| s.phase == BrokerPhase::Failed)
            .map(|(id, _)| id)
            .collect();

        status.state = if upgrading || upgrade.in_progress {
            ClusterState::RollingUpgrading
        } else if settling || scale.in_progress {
            ClusterState::Reconciling
        } else {
            ClusterState::Running
        };

        let (ready, reason, message) = if !failed.is_empty() {
            let ids: Vec<&str> = failed.iter().map(|id| id.as_str()).collect();
            (
                false,
                "BrokersFailed",
                format!("brokers {} failed", ids.join(", ")),
            )
        } else if status.state == ClusterState::Running {
            (
                true,
                "AllBrokersRunning",
                format!("{} nodes running", status.brokers_state.len()),
            )
        } else {
            (
                false,
                "Reconciling",
                format!("cluster is {:?}", status.state),
            )
        };

        status.remove_condition(CONFIGURATION_ERROR);
        status.set_condition(READY, ready, reason, message, &stamp);
        status.message = None;
        status.observed_generation = self.cluster.metadata.generation.unwrap_or(0);
        status.last_updated = Some(stamp);
    }
}
