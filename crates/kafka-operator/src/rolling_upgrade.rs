//! Rolling upgrade state machine
//!
//! Each broker or controller node carries an upgrade record in cluster status.
//! A node whose desired configuration revision differs from the revision it
//! last came up healthy with is rolled through
//!
//! ```text
//! Idle -> Draining -> Restarted -> Rejoining -> Idle
//!                         |            |
//!                         +--timeout---+--> (retry) ... -> TerminalFailure
//! ```
//!
//! New disruptions are only started while the disruption budget of the node's
//! category holds, the node's rack has spare restart concurrency, and Cruise
//! Control reports no under-replicated or offline data. Passes never block on
//! a restart; they record progress in status and come back later.

use crate::budget::DisruptionBudget;
use crate::crd::{
    Broker, BrokerPhase, BrokerState, KafkaCluster, KafkaClusterSpec, KafkaClusterStatus,
    UpgradePhase,
};
use crate::cruise_control::Scaler;
use crate::error::{BudgetError, Result};
use crate::health::{NodeHealth, NodeHealthProbe};
use crate::workload::WorkloadRestarter;
use chrono::{DateTime, Duration, Utc};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Condition type set while any node is stuck in terminal failure
pub const ROLLING_UPGRADE_FAILED: &str = "RollingUpgradeFailed";

/// Configuration revision a broker should be running
///
/// Covers everything that needs a restart to take effect: the effective broker
/// configuration, roles, rack, image and the read-only configuration.
pub fn desired_revision(
    spec: &KafkaClusterSpec,
    broker: &Broker,
) -> std::result::Result<String, BudgetError> {
    let config = spec.effective_broker_config(broker)?;
    let mut hasher = Sha256::new();

    for (key, value) in &config.config {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    for role in &config.roles {
        hasher.update(format!("role={:?}\n", role).as_bytes());
    }
    hasher.update(format!("rack={}\n", config.rack_or_default()).as_bytes());
    hasher.update(format!("image={}\n", spec.broker_image(&config)).as_bytes());
    if let Some(read_only) = &spec.read_only_config {
        hasher.update(b"read-only=");
        hasher.update(read_only.as_bytes());
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Planning view of one node
#[derive(Debug, Clone, PartialEq)]
pub struct UnitView {
    pub id: i32,
    pub rack: String,
    pub controller_node: bool,
    pub broker_node: bool,
    /// Serving traffic: not joining, draining or failed
    pub serving: bool,
    pub phase: UpgradePhase,
}

impl UnitView {
    pub fn from_state(id: i32, state: &BrokerState) -> Self {
        Self {
            id,
            rack: state.rack.clone(),
            controller_node: state.is_controller_node(),
            broker_node: state.is_broker_node(),
            serving: state.phase == BrokerPhase::Running,
            phase: state.upgrade.phase,
        }
    }
}

/// Choose which candidates may start a disruption now
///
/// Candidates are considered in the given order. A candidate is admitted when
/// its rack has fewer than `concurrency_per_rack` nodes in flight and every
/// budget covering it still holds after taking it down. Only serving nodes
/// count as available; nodes in terminal failure count against availability
/// but not against rack concurrency.
pub fn plan_disruptions(
    units: &[UnitView],
    candidates: &[i32],
    budget: &DisruptionBudget,
    concurrency_per_rack: u32,
) -> Vec<i32> {
    let mut in_flight_by_rack: BTreeMap<&str, u32> = BTreeMap::new();
    let mut available_brokers: u32 = 0;
    let mut available_controllers: u32 = 0;

    for unit in units {
        if unit.phase.is_in_flight() {
            *in_flight_by_rack.entry(unit.rack.as_str()).or_default() += 1;
        }
        if unit.serving && !unit.phase.is_disrupted() {
            if unit.broker_node {
                available_brokers += 1;
            }
            if unit.controller_node {
                available_controllers += 1;
            }
        }
    }

    let mut planned = Vec::new();
    for id in candidates {
        let Some(unit) = units.iter().find(|u| u.id == *id) else {
            continue;
        };
        if unit.phase != UpgradePhase::Idle {
            continue;
        }

        let in_flight = in_flight_by_rack
            .get(unit.rack.as_str())
            .copied()
            .unwrap_or(0);
        if in_flight >= concurrency_per_rack {
            continue;
        }

        if unit.broker_node
            && available_brokers.saturating_sub(1) < budget.min_available_brokers
        {
            continue;
        }
        if unit.controller_node {
            if let Some(min) = budget.min_available_controllers {
                if available_controllers.saturating_sub(1) < min {
                    continue;
                }
            }
        }

        *in_flight_by_rack.entry(unit.rack.as_str()).or_default() += 1;
        if unit.broker_node {
            available_brokers -= 1;
        }
        if unit.controller_node {
            available_controllers -= 1;
        }
        planned.push(unit.id);
    }
    planned
}

/// Result of one rolling upgrade pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeOutcome {
    /// Nodes restarted during this pass
    pub restarted: Vec<i32>,
    /// Nodes that came back healthy during this pass
    pub completed: Vec<i32>,
    /// Nodes that reached terminal failure during this pass
    pub failed: Vec<i32>,
    /// Some node is mid-upgrade or still waiting for its turn
    pub in_progress: bool,
}

/// Drives the rolling upgrade of one cluster for one pass
pub struct RollingUpgrade<'a> {
    pub cluster: &'a KafkaCluster,
    pub scaler: &'a dyn Scaler,
    pub probe: &'a dyn NodeHealthProbe,
    pub restarter: &'a dyn WorkloadRestarter,
    pub now: DateTime<Utc>,
}

impl RollingUpgrade<'_> {
    #[instrument(skip_all, fields(cluster = %self.cluster.name_any()))]
    pub async fn run(
        &self,
        status: &mut KafkaClusterStatus,
        budget: &DisruptionBudget,
    ) -> Result<UpgradeOutcome> {
        let spec = &self.cluster.spec;
        let mut outcome = UpgradeOutcome::default();

        let mut desired = BTreeMap::new();
        for broker in &spec.brokers {
            desired.insert(broker.id, desired_revision(spec, broker)?);
        }

        self.advance_in_flight(status, &desired, &mut outcome).await;

        let mut candidates: Vec<i32> = status
            .brokers_state
            .iter()
            .filter_map(|(key, state)| {
                let id = key.parse::<i32>().ok()?;
                let target = desired.get(&id)?;
                let needs_upgrade = state.upgrade.phase == UpgradePhase::Idle
                    && state.phase == BrokerPhase::Running
                    && state.upgrade.observed_revision.as_ref() != Some(target);
                needs_upgrade.then_some(id)
            })
            .collect();
        candidates.sort_unstable();

        if !candidates.is_empty() {
            outcome.in_progress = true;
            if self.data_is_safe().await {
                let units = unit_views(status);
                let concurrency =
                    u32::try_from(spec.rolling_upgrade_config.concurrent_broker_restart_count_per_rack)
                        .unwrap_or(1)
                        .max(1);
                for id in plan_disruptions(&units, &candidates, budget, concurrency) {
                    if let Some(target) = desired.get(&id) {
                        self.start(status, id, target.clone(), &mut outcome).await;
                    }
                }
            }
        }

        if status
            .brokers_state
            .values()
            .any(|s| s.upgrade.phase.is_in_flight())
        {
            outcome.in_progress = true;
        }

        self.update_failure_condition(status);
        status.disrupted_brokers = i32::try_from(
            status
                .brokers_state
                .values()
                .filter(|s| s.upgrade.phase.is_disrupted())
                .count(),
        )
        .unwrap_or(i32::MAX);

        Ok(outcome)
    }

    /// Cruise Control reachable, ready and reporting no unsafe replicas
    async fn data_is_safe(&self) -> bool {
        if !self.scaler.is_ready().await {
            debug!("Cruise Control not ready, holding rolling upgrade");
            return false;
        }
        match self.scaler.kafka_cluster_state().await {
            Ok(state) if state.is_data_safe() => true,
            Ok(_) => {
                info!("Out-of-sync or offline replicas present, holding rolling upgrade");
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not read Kafka cluster state, holding rolling upgrade");
                false
            }
        }
    }

    async fn advance_in_flight(
        &self,
        status: &mut KafkaClusterStatus,
        desired: &BTreeMap<i32, String>,
        outcome: &mut UpgradeOutcome,
    ) {
        let keys: Vec<String> = status.brokers_state.keys().cloned().collect();

        for key in keys {
            let Ok(id) = key.parse::<i32>() else {
                continue;
            };
            let Some(mut state) = status.brokers_state.get(&key).cloned() else {
                continue;
            };

            match state.upgrade.phase {
                UpgradePhase::Idle => continue,
                UpgradePhase::TerminalFailure => {
                    // A new revision gives the node a fresh start
                    let retarget = desired
                        .get(&id)
                        .is_some_and(|d| state.upgrade.target_revision.as_ref() != Some(d));
                    if !retarget {
                        continue;
                    }
                    info!(broker_id = id, "Configuration changed, clearing terminal upgrade failure");
                    state.upgrade.phase = UpgradePhase::Idle;
                    state.upgrade.attempts = 0;
                    state.upgrade.started_at = None;
                    state.upgrade.message = None;
                    state.phase = BrokerPhase::Running;
                }
                UpgradePhase::Draining => {
                    self.issue_restart(id, &mut state, outcome).await;
                }
                UpgradePhase::Restarted | UpgradePhase::Rejoining => {
                    self.observe(id, &mut state, outcome).await;
                }
            }

            status.brokers_state.insert(key, state);
        }
    }

    /// Reserve budget for a node and restart it
    async fn start(
        &self,
        status: &mut KafkaClusterStatus,
        id: i32,
        target: String,
        outcome: &mut UpgradeOutcome,
    ) {
        let key = id.to_string();
        let Some(mut state) = status.brokers_state.get(&key).cloned() else {
            return;
        };

        info!(broker_id = id, rack = %state.rack, "Starting rolling upgrade of node");
        state.phase = BrokerPhase::Upgrading;
        state.upgrade.phase = UpgradePhase::Draining;
        state.upgrade.target_revision = Some(target);
        state.upgrade.attempts = 0;
        state.upgrade.message = None;
        state.upgrade.started_at = Some(self.now.to_rfc3339());

        self.issue_restart(id, &mut state, outcome).await;
        status.brokers_state.insert(key, state);
    }

    async fn issue_restart(&self, id: i32, state: &mut BrokerState, outcome: &mut UpgradeOutcome) {
        match self.restarter.restart(self.cluster, id).await {
            Ok(()) => {
                state.upgrade.phase = UpgradePhase::Restarted;
                state.upgrade.started_at = Some(self.now.to_rfc3339());
                outcome.restarted.push(id);
                metrics::counter!("kafka_operator_broker_restarts_total").increment(1);
            }
            Err(e) => {
                // Stays Draining with its budget reserved; retried next pass
                warn!(broker_id = id, error = %e, "Restart could not be issued");
                state.upgrade.message = Some(e.to_string());
            }
        }
    }

    /// Poll a restarted node and move it along or time it out
    async fn observe(&self, id: i32, state: &mut BrokerState, outcome: &mut UpgradeOutcome) {
        let health = match self.probe.probe(self.cluster, id, state).await {
            Ok(health) => health,
            Err(e) => {
                warn!(broker_id = id, error = %e, "Health probe failed");
                NodeHealth::Down
            }
        };

        if state.upgrade.phase == UpgradePhase::Restarted && health != NodeHealth::Down {
            debug!(broker_id = id, "Node is back, waiting for it to rejoin");
            state.upgrade.phase = UpgradePhase::Rejoining;
        }

        if state.upgrade.phase == UpgradePhase::Rejoining && health == NodeHealth::Healthy {
            info!(broker_id = id, attempts = state.upgrade.attempts, "Node rejoined healthy");
            state.phase = BrokerPhase::Running;
            state.upgrade.phase = UpgradePhase::Idle;
            state.upgrade.observed_revision = state.upgrade.target_revision.take();
            state.upgrade.attempts = 0;
            state.upgrade.started_at = None;
            state.upgrade.message = None;
            outcome.completed.push(id);
            return;
        }

        if !self.wait_expired(state) {
            return;
        }

        state.upgrade.attempts += 1;
        let threshold =
            u32::try_from(self.cluster.spec.rolling_upgrade_config.failure_threshold)
                .unwrap_or(1)
                .max(1);

        if state.upgrade.attempts >= threshold {
            warn!(
                broker_id = id,
                attempts = state.upgrade.attempts,
                "Node did not rejoin, giving up"
            );
            state.phase = BrokerPhase::Failed;
            state.upgrade.phase = UpgradePhase::TerminalFailure;
            state.upgrade.message = Some(format!(
                "node did not become healthy after {} restart attempt(s)",
                state.upgrade.attempts
            ));
            outcome.failed.push(id);
            metrics::counter!("kafka_operator_upgrade_failures_total").increment(1);
            return;
        }

        warn!(
            broker_id = id,
            attempts = state.upgrade.attempts,
            "Node did not rejoin in time, restarting again"
        );
        state.upgrade.phase = UpgradePhase::Draining;
        self.issue_restart(id, state, outcome).await;
    }

    fn wait_expired(&self, state: &BrokerState) -> bool {
        let timeout =
            Duration::seconds(self.cluster.spec.rolling_upgrade_config.health_wait_timeout_seconds);
        match state
            .upgrade
            .started_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            Some(started) => self.now - started.with_timezone(&Utc) >= timeout,
            None => false,
        }
    }

    fn update_failure_condition(&self, status: &mut KafkaClusterStatus) {
        let failed: Vec<&String> = status
            .brokers_state
            .iter()
            .filter(|(_, s)| s.upgrade.phase == UpgradePhase::TerminalFailure)
            .map(|(id, _)| id)
            .collect();

        if failed.is_empty() {
            status.remove_condition(ROLLING_UPGRADE_FAILED);
            return;
        }

        let message = format!(
            "nodes {} exceeded the restart failure threshold and need manual intervention",
            failed
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        status.set_condition(
            ROLLING_UPGRADE_FAILED,
            true,
            "FailureThresholdExceeded",
            message,
            &self.now.to_rfc3339(),
        );
    }
}

fn unit_views(status: &KafkaClusterStatus) -> Vec<UnitView> {
    status
        .brokers_state
        .iter()
        .filter_map(|(key, state)| {
            key.parse::<i32>()
                .ok()
                .map(|id| UnitView::from_state(id, state))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BrokerConfig, ProcessRole};
    use crate::cruise_control::StubScaler;
    use crate::health::ScriptedHealthProbe;
    use crate::workload::RecordingRestarter;
    use proptest::prelude::*;

    fn unit(id: i32, rack: &str, phase: UpgradePhase) -> UnitView {
        UnitView {
            id,
            rack: rack.to_string(),
            controller_node: false,
            broker_node: true,
            serving: true,
            phase,
        }
    }

    fn brokers_budget(min: u32) -> DisruptionBudget {
        DisruptionBudget {
            min_available_brokers: min,
            min_available_controllers: None,
        }
    }

    fn cluster(ids: &[i32], racks: &[&str]) -> KafkaCluster {
        let spec: KafkaClusterSpec = serde_json::from_value(serde_json::json!({
            "brokers": ids.iter().map(|id| serde_json::json!({
                "id": id,
                "brokerConfig": {"rack": racks[*id as usize % racks.len()]}
            })).collect::<Vec<_>>(),
            "listenersConfig": {"internalListeners": [{
                "name": "internal", "containerPort": 29092, "type": "plaintext",
                "usedForInnerBrokerCommunication": true
            }]},
            "disruptionBudget": {"budget": "1"},
            "rollingUpgradeConfig": {
                "failureThreshold": 2,
                "concurrentBrokerRestartCountPerRack": 1,
                "healthWaitTimeoutSeconds": 60
            }
        }))
        .unwrap();
        let mut cluster = KafkaCluster::new("kafka", spec);
        cluster.metadata.namespace = Some("prod".to_string());
        cluster
    }

    /// Status with every node running the current revision
    fn settled_status(cluster: &KafkaCluster) -> KafkaClusterStatus {
        let mut status = KafkaClusterStatus::default();
        for broker in &cluster.spec.brokers {
            let config = cluster.spec.effective_broker_config(broker).unwrap();
            let mut state = BrokerState::new(&config);
            state.phase = BrokerPhase::Running;
            state.upgrade.observed_revision =
                Some(desired_revision(&cluster.spec, broker).unwrap());
            status.brokers_state.insert(broker.id.to_string(), state);
        }
        status
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_revision_tracks_restart_relevant_config() {
        let cluster = cluster(&[0], &["a"]);
        let base = desired_revision(&cluster.spec, &cluster.spec.brokers[0]).unwrap();

        let mut spec = cluster.spec.clone();
        spec.read_only_config = Some("auto.create.topics.enable=false".to_string());
        assert_ne!(desired_revision(&spec, &spec.brokers[0]).unwrap(), base);

        let mut spec = cluster.spec.clone();
        spec.cluster_image = "ghcr.io/kafka-operator/kafka:4.0.0".to_string();
        assert_ne!(desired_revision(&spec, &spec.brokers[0]).unwrap(), base);

        assert_eq!(
            desired_revision(&cluster.spec, &cluster.spec.brokers[0]).unwrap(),
            base
        );
    }

    #[test]
    fn test_plan_respects_rack_concurrency() {
        let units = vec![
            unit(0, "a", UpgradePhase::Restarted),
            unit(1, "a", UpgradePhase::Idle),
            unit(2, "b", UpgradePhase::Idle),
            unit(3, "b", UpgradePhase::Idle),
            unit(4, "c", UpgradePhase::Idle),
        ];
        let planned = plan_disruptions(&units, &[1, 2, 3, 4], &brokers_budget(1), 1);
        assert_eq!(planned, vec![2, 4]);
    }

    #[test]
    fn test_plan_respects_budget() {
        let units: Vec<_> = (0..3).map(|id| unit(id, &format!("r{}", id), UpgradePhase::Idle)).collect();
        // 3 brokers, min available 2: only one may go down
        let planned = plan_disruptions(&units, &[0, 1, 2], &brokers_budget(2), 5);
        assert_eq!(planned, vec![0]);
    }

    #[test]
    fn test_downscaling_broker_is_not_available() {
        let mut units: Vec<_> = (0..4).map(|id| unit(id, &format!("r{}", id), UpgradePhase::Idle)).collect();
        units[3].serving = false;
        // Four brokers, one draining away, min three: nothing may go down
        let planned = plan_disruptions(&units, &[0, 1, 2], &brokers_budget(3), 5);
        assert!(planned.is_empty());

        units[3].serving = true;
        let planned = plan_disruptions(&units, &[0, 1, 2], &brokers_budget(3), 5);
        assert_eq!(planned, vec![0]);
    }

    #[test]
    fn test_terminal_failure_consumes_budget_not_concurrency() {
        let units = vec![
            unit(0, "a", UpgradePhase::TerminalFailure),
            unit(1, "a", UpgradePhase::Idle),
            unit(2, "b", UpgradePhase::Idle),
            unit(3, "b", UpgradePhase::Idle),
        ];
        // Three available, min two: one more may go, and rack a is not blocked
        let planned = plan_disruptions(&units, &[1, 2, 3], &brokers_budget(2), 1);
        assert_eq!(planned, vec![1]);

        let planned = plan_disruptions(&units, &[1, 2, 3], &brokers_budget(3), 1);
        assert!(planned.is_empty());
    }

    #[test]
    fn test_controller_budget_applies_to_controller_nodes() {
        let mut units: Vec<_> = (0..3)
            .map(|id| UnitView {
                controller_node: true,
                broker_node: false,
                ..unit(id, &format!("r{}", id), UpgradePhase::Idle)
            })
            .collect();
        units.push(unit(10, "r0", UpgradePhase::Idle));

        let budget = DisruptionBudget {
            min_available_brokers: 1,
            min_available_controllers: Some(2),
        };
        let planned = plan_disruptions(&units, &[0, 1, 2, 10], &budget, 5);
        // Broker 10 is alone in its category and the broker floor is one
        assert_eq!(planned, vec![0]);
    }

    #[test]
    fn test_dual_role_checks_both_budgets() {
        let units: Vec<_> = (0..3)
            .map(|id| UnitView {
                controller_node: true,
                ..unit(id, &format!("r{}", id), UpgradePhase::Idle)
            })
            .collect();
        let budget = DisruptionBudget {
            min_available_brokers: 1,
            min_available_controllers: Some(3),
        };
        assert!(plan_disruptions(&units, &[0, 1, 2], &budget, 5).is_empty());
    }

    proptest! {
        #[test]
        fn prop_rack_concurrency_never_exceeded(
            racks in 1usize..=10,
            concurrency in 1u32..=5,
            phases in proptest::collection::vec(0u8..3, 1..60),
        ) {
            let units: Vec<UnitView> = phases
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let phase = match p {
                        0 => UpgradePhase::Idle,
                        1 => UpgradePhase::Restarted,
                        _ => UpgradePhase::TerminalFailure,
                    };
                    unit(i as i32, &format!("rack-{}", i % racks), phase)
                })
                .collect();
            let candidates: Vec<i32> = units.iter().map(|u| u.id).collect();
            let planned = plan_disruptions(&units, &candidates, &brokers_budget(1), concurrency);

            for rack in 0..racks {
                let name = format!("rack-{}", rack);
                let already = units
                    .iter()
                    .filter(|u| u.rack == name && u.phase.is_in_flight())
                    .count() as u32;
                let added = planned
                    .iter()
                    .filter(|id| units[**id as usize].rack == name)
                    .count() as u32;
                if already >= concurrency {
                    prop_assert_eq!(added, 0);
                } else {
                    prop_assert!(already + added <= concurrency);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_config_change_rolls_one_node_at_a_time() {
        let mut cluster = cluster(&[0, 1, 2], &["a", "b", "c"]);
        let mut status = settled_status(&cluster);
        cluster.spec.read_only_config = Some("log.retention.hours=72".to_string());

        let scaler = StubScaler::with_brokers(&[0, 1, 2], 10);
        let probe = ScriptedHealthProbe::new(NodeHealth::Down);
        let restarter = RecordingRestarter::new();
        let budget = DisruptionBudget::compute(&cluster.spec, &status).unwrap();
        assert_eq!(budget.min_available_brokers, 2);

        let upgrade = RollingUpgrade {
            cluster: &cluster,
            scaler: &scaler,
            probe: &probe,
            restarter: &restarter,
            now: at(0),
        };
        let outcome = upgrade.run(&mut status, &budget).await.unwrap();
        assert_eq!(outcome.restarted, vec![0]);
        assert!(outcome.in_progress);
        assert_eq!(status.disrupted_brokers, 1);
        assert_eq!(
            status.brokers_state["0"].upgrade.phase,
            UpgradePhase::Restarted
        );

        // Still down: nobody else is touched
        let outcome = upgrade.run(&mut status, &budget).await.unwrap();
        assert!(outcome.restarted.is_empty());
        assert_eq!(restarter.restarts(), vec![0]);

        probe.set(0, NodeHealth::Healthy);
        let upgrade = RollingUpgrade { now: at(30), ..upgrade };
        let outcome = upgrade.run(&mut status, &budget).await.unwrap();
        assert_eq!(outcome.completed, vec![0]);
        assert_eq!(outcome.restarted, vec![1]);
        assert_eq!(status.brokers_state["0"].upgrade.phase, UpgradePhase::Idle);
        assert_eq!(status.brokers_state["0"].phase, BrokerPhase::Running);
    }

    #[tokio::test]
    async fn test_out_of_sync_replicas_hold_upgrade() {
        let mut cluster = cluster(&[0, 1, 2], &["a"]);
        let mut status = settled_status(&cluster);
        cluster.spec.cluster_image = "ghcr.io/kafka-operator/kafka:4.0.0".to_string();

        let scaler = StubScaler::with_brokers(&[0, 1, 2], 10);
        scaler.set_out_of_sync(2, 5);
        let probe = ScriptedHealthProbe::new(NodeHealth::Healthy);
        let restarter = RecordingRestarter::new();
        let budget = DisruptionBudget::compute(&cluster.spec, &status).unwrap();

        let upgrade = RollingUpgrade {
            cluster: &cluster,
            scaler: &scaler,
            probe: &probe,
            restarter: &restarter,
            now: at(0),
        };
        let outcome = upgrade.run(&mut status, &budget).await.unwrap();
        assert!(outcome.restarted.is_empty());
        assert!(outcome.in_progress);
        assert_eq!(status.disrupted_brokers, 0);
    }

    #[tokio::test]
    async fn test_timeout_retries_then_fails_terminally() {
        let mut cluster = cluster(&[0, 1, 2], &["a", "b", "c"]);
        let mut status = settled_status(&cluster);
        cluster.spec.read_only_config = Some("num.network.threads=8".to_string());

        let scaler = StubScaler::with_brokers(&[0, 1, 2], 10);
        let probe = ScriptedHealthProbe::new(NodeHealth::Down);
        let restarter = RecordingRestarter::new();
        let budget = DisruptionBudget::compute(&cluster.spec, &status).unwrap();
        let run_at = |now| RollingUpgrade {
            cluster: &cluster,
            scaler: &scaler,
            probe: &probe,
            restarter: &restarter,
            now,
        };

        run_at(at(0)).run(&mut status, &budget).await.unwrap();
        // Health wait is 60s: first timeout reissues the restart
        let outcome = run_at(at(61)).run(&mut status, &budget).await.unwrap();
        assert_eq!(outcome.restarted, vec![0]);
        assert_eq!(status.brokers_state["0"].upgrade.attempts, 1);
        assert_eq!(restarter.restart_count(0), 2);

        // Second timeout reaches the threshold of two
        let outcome = run_at(at(122)).run(&mut status, &budget).await.unwrap();
        assert_eq!(outcome.failed, vec![0]);
        let state = &status.brokers_state["0"];
        assert_eq!(state.upgrade.phase, UpgradePhase::TerminalFailure);
        assert_eq!(state.phase, BrokerPhase::Failed);
        assert_eq!(status.disrupted_brokers, 1);
        let condition = status.condition(ROLLING_UPGRADE_FAILED).unwrap();
        assert_eq!(condition.status, "True");

        // Terminal node holds one slot of the budget; with min 2 nobody else may go
        let outcome = run_at(at(130)).run(&mut status, &budget).await.unwrap();
        assert!(outcome.restarted.is_empty());
        assert_eq!(restarter.restart_count(1), 0);
    }

    #[tokio::test]
    async fn test_candidate_controller_not_finalized() {
        let spec: KafkaClusterSpec = serde_json::from_value(serde_json::json!({
            "brokers": [
                {"id": 0, "brokerConfigGroup": "controller"},
                {"id": 1, "brokerConfigGroup": "controller"},
                {"id": 2, "brokerConfigGroup": "controller"},
                {"id": 10}
            ],
            "brokerConfigGroups": {"controller": {"roles": ["controller"]}},
            "listenersConfig": {"internalListeners": [
                {"name": "internal", "containerPort": 29092, "type": "plaintext",
                 "usedForInnerBrokerCommunication": true},
                {"name": "controller", "containerPort": 29093, "type": "plaintext",
                 "usedForControllerCommunication": true}
            ]},
            "kraftMode": true
        }))
        .unwrap();
        let mut cluster = KafkaCluster::new("kafka", spec);
        let mut status = settled_status(&cluster);
        cluster.spec.broker_config_groups.insert(
            "controller".to_string(),
            BrokerConfig {
                roles: vec![ProcessRole::Controller],
                config: BTreeMap::from([("controller.quorum.fetch.timeout.ms".to_string(), "4000".to_string())]),
                ..Default::default()
            },
        );

        let scaler = StubScaler::with_brokers(&[10], 10);
        let probe = ScriptedHealthProbe::new(NodeHealth::Healthy);
        probe.set_from_metrics(0, "kafka_server_raft_metrics_current_state_candidate 1.0");
        let restarter = RecordingRestarter::new();
        let budget = DisruptionBudget::compute(&cluster.spec, &status).unwrap();
        assert_eq!(budget.min_available_controllers, Some(2));

        let upgrade = RollingUpgrade {
            cluster: &cluster,
            scaler: &scaler,
            probe: &probe,
            restarter: &restarter,
            now: at(0),
        };
        upgrade.run(&mut status, &budget).await.unwrap();
        let outcome = upgrade.run(&mut status, &budget).await.unwrap();

        assert!(outcome.completed.is_empty());
        assert_eq!(
            status.brokers_state["0"].upgrade.phase,
            UpgradePhase::Rejoining
        );
        // Only one controller may be down at a time
        assert_eq!(restarter.restarts(), vec![0]);

        probe.set_from_metrics(0, "kafka_server_raft_metrics_current_state_follower 1.0");
        let outcome = upgrade.run(&mut status, &budget).await.unwrap();
        assert_eq!(outcome.completed, vec![0]);
        assert_eq!(outcome.restarted, vec![1]);
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_budget_reserved() {
        let mut cluster = cluster(&[0, 1, 2], &["a", "b", "c"]);
        let mut status = settled_status(&cluster);
        cluster.spec.read_only_config = Some("compression.type=zstd".to_string());

        let scaler = StubScaler::with_brokers(&[0, 1, 2], 10);
        let probe = ScriptedHealthProbe::new(NodeHealth::Down);
        let restarter = RecordingRestarter::new();
        restarter.set_failing(true);
        let budget = DisruptionBudget::compute(&cluster.spec, &status).unwrap();

        let upgrade = RollingUpgrade {
            cluster: &cluster,
            scaler: &scaler,
            probe: &probe,
            restarter: &restarter,
            now: at(0),
        };
        upgrade.run(&mut status, &budget).await.unwrap();
        assert_eq!(status.brokers_state["0"].upgrade.phase, UpgradePhase::Draining);
        assert_eq!(status.disrupted_brokers, 1);

        restarter.set_failing(false);
        let outcome = upgrade.run(&mut status, &budget).await.unwrap();
        assert_eq!(outcome.restarted, vec![0]);
        assert_eq!(restarter.restarts(), vec![0]);
    }
}
