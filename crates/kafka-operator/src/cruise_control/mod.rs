//! Cruise Control task orchestration
//!
//! Cruise Control runs rebalances and broker add/remove moves asynchronously.
//! Every mutating call returns as soon as the request is accepted, carrying the
//! user task id used to poll for progress later. Nothing here waits for a task
//! to finish and nothing retries internally: callers decide when to come back.
//!
//! [`Scaler`] is the seam between the reconcilers and the engine. Two
//! implementations ship with the crate:
//!
//! - [`HttpScaler`] talks to the Cruise Control REST API
//! - [`StubScaler`] is a deterministic, scriptable double used by tests

mod http;
mod stub;

pub use http::{CruiseControlClientConfig, HttpScaler, HttpScalerFactory};
pub use stub::{StubCall, StubScaler, StubScalerFactory};

use crate::crd::KafkaCluster;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Normalized state of a Cruise Control user task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Active,
    Completed,
    CompletedWithError,
}

impl TaskState {
    /// Map the engine's status vocabulary onto [`TaskState`]
    pub fn from_engine(status: &str) -> Option<Self> {
        match status {
            "Active" | "InExecution" => Some(TaskState::Active),
            "Completed" => Some(TaskState::Completed),
            "CompletedWithError" => Some(TaskState::CompletedWithError),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Active)
    }
}

/// A task as reported by Cruise Control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: String,
    pub state: TaskState,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn new(task_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            error: None,
        }
    }
}

/// Outcome of a mutating request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The engine accepted the request and started a task
    Accepted(TaskResult),
    /// The engine cannot take requests yet; try again on a later pass
    EngineNotReady,
}

/// Readiness of the engine's subsystems
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CruiseControlStatus {
    pub monitor_ready: bool,
    pub executor_ready: bool,
    pub analyzer_ready: bool,
    pub proposal_ready: bool,
    pub goals_ready: bool,
    /// An execution is currently moving replicas
    pub executing: bool,
}

impl CruiseControlStatus {
    pub fn is_ready(&self) -> bool {
        self.monitor_ready && self.executor_ready && self.analyzer_ready
    }
}

/// Engine status and, for task lookups, the task itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusTaskResult {
    pub status: Option<CruiseControlStatus>,
    /// `None` when the engine does not know the task
    pub task: Option<TaskResult>,
}

/// Broker state as seen by Cruise Control's load monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KafkaBrokerState {
    Alive,
    Dead,
    New,
    Demoted,
    BadDisks,
}

/// Log directory state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogDirState {
    Online,
    Offline,
}

/// Per-broker view of the Kafka cluster from `kafka_cluster_state`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KafkaClusterState {
    #[serde(rename = "ReplicaCountByBrokerId", default)]
    pub replica_count_by_broker: BTreeMap<String, i32>,
    #[serde(rename = "LeaderCountByBrokerId", default)]
    pub leader_count_by_broker: BTreeMap<String, i32>,
    #[serde(rename = "OutOfSyncCountByBrokerId", default)]
    pub out_of_sync_count_by_broker: BTreeMap<String, i32>,
    #[serde(rename = "OfflineReplicaCountByBrokerId", default)]
    pub offline_replica_count_by_broker: BTreeMap<String, i32>,
    #[serde(rename = "OnlineLogDirsByBrokerId", default)]
    pub online_log_dirs_by_broker: BTreeMap<String, Vec<String>>,
    #[serde(rename = "OfflineLogDirsByBrokerId", default)]
    pub offline_log_dirs_by_broker: BTreeMap<String, Vec<String>>,
}

impl KafkaClusterState {
    /// Broker is registered with the Kafka cluster
    pub fn has_broker(&self, broker_id: &str) -> bool {
        self.replica_count_by_broker.contains_key(broker_id)
            || self.online_log_dirs_by_broker.contains_key(broker_id)
    }

    /// No replica is out of sync or offline and no log directory is offline
    pub fn is_data_safe(&self) -> bool {
        self.out_of_sync_count_by_broker.values().all(|c| *c == 0)
            && self.offline_replica_count_by_broker.values().all(|c| *c == 0)
            && self.offline_log_dirs_by_broker.values().all(Vec::is_empty)
    }
}

/// Task-oriented access to Cruise Control
///
/// Mutating verbs return immediately after the engine accepts the request.
/// Transport failures surface as errors and are never retried here.
#[async_trait]
pub trait Scaler: Send + Sync {
    /// Engine answers requests at all
    async fn is_up(&self) -> bool;

    /// Engine can accept tasks (monitor, executor and analyzer ready)
    async fn is_ready(&self) -> bool;

    async fn status(&self) -> Result<StatusTaskResult>;

    async fn status_task(&self, task_id: &str) -> Result<StatusTaskResult>;

    /// Bulk lookup; tasks unknown to the engine are omitted
    async fn user_tasks(&self, task_ids: &[String]) -> Result<Vec<TaskResult>>;

    async fn add_brokers(&self, broker_ids: &[String]) -> Result<Submission>;

    async fn add_brokers_with_params(&self, params: &BTreeMap<String, String>)
        -> Result<Submission>;

    async fn remove_brokers(&self, broker_ids: &[String]) -> Result<Submission>;

    async fn remove_brokers_with_params(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<Submission>;

    async fn remove_disks_with_params(&self, params: &BTreeMap<String, String>)
        -> Result<Submission>;

    async fn rebalance_with_params(&self, params: &BTreeMap<String, String>) -> Result<Submission>;

    async fn rebalance_disks(&self, broker_ids: &[String]) -> Result<Submission>;

    async fn stop_execution(&self) -> Result<Submission>;

    async fn kafka_cluster_state(&self) -> Result<KafkaClusterState>;

    /// Replica count per broker id
    async fn partition_replicas_by_broker(&self) -> Result<BTreeMap<String, i32>>;

    async fn broker_with_least_partition_replicas(&self) -> Result<Option<String>>;

    async fn log_dirs_by_broker(&self)
        -> Result<BTreeMap<String, BTreeMap<LogDirState, Vec<String>>>>;

    async fn brokers_with_state(&self, states: &[KafkaBrokerState]) -> Result<Vec<String>>;
}

/// Builds the [`Scaler`] for a cluster
#[async_trait]
pub trait ScalerFactory: Send + Sync {
    async fn scaler_for(&self, cluster: &KafkaCluster) -> Result<Arc<dyn Scaler>>;
}

/// Broker with the fewest replicas, lowest id first on ties
pub(crate) fn least_loaded(replicas: &BTreeMap<String, i32>) -> Option<String> {
    replicas
        .iter()
        .min_by(|(id_a, count_a), (id_b, count_b)| {
            count_a.cmp(count_b).then_with(|| {
                let a = id_a.parse::<i64>().unwrap_or(i64::MAX);
                let b = id_b.parse::<i64>().unwrap_or(i64::MAX);
                a.cmp(&b)
            })
        })
        .map(|(id, _)| id.clone())
}

/// Group log directories by broker and state
pub(crate) fn group_log_dirs(
    state: &KafkaClusterState,
) -> BTreeMap<String, BTreeMap<LogDirState, Vec<String>>> {
    let mut grouped: BTreeMap<String, BTreeMap<LogDirState, Vec<String>>> = BTreeMap::new();
    for (broker, dirs) in &state.online_log_dirs_by_broker {
        grouped
            .entry(broker.clone())
            .or_default()
            .insert(LogDirState::Online, dirs.clone());
    }
    for (broker, dirs) in &state.offline_log_dirs_by_broker {
        grouped
            .entry(broker.clone())
            .or_default()
            .insert(LogDirState::Offline, dirs.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_mapping() {
        assert_eq!(TaskState::from_engine("Active"), Some(TaskState::Active));
        assert_eq!(TaskState::from_engine("InExecution"), Some(TaskState::Active));
        assert_eq!(TaskState::from_engine("Completed"), Some(TaskState::Completed));
        assert_eq!(
            TaskState::from_engine("CompletedWithError"),
            Some(TaskState::CompletedWithError)
        );
        assert_eq!(TaskState::from_engine("Bogus"), None);
        assert!(!TaskState::Active.is_terminal());
        assert!(TaskState::CompletedWithError.is_terminal());
    }

    #[test]
    fn test_kafka_cluster_state_parsing() {
        let json = r#"{
            "ReplicaCountByBrokerId": {"0": 12, "1": 3, "2": 3},
            "LeaderCountByBrokerId": {"0": 4, "1": 1, "2": 1},
            "OutOfSyncCountByBrokerId": {"0": 0, "1": 0},
            "OfflineReplicaCountByBrokerId": {},
            "OnlineLogDirsByBrokerId": {"0": ["/kafka-logs"], "1": ["/kafka-logs"]},
            "OfflineLogDirsByBrokerId": {"0": [], "1": []},
            "IsController": {"0": true},
            "Summary": {"Brokers": 3}
        }"#;
        let state: KafkaClusterState = serde_json::from_str(json).unwrap();
        assert!(state.has_broker("2"));
        assert!(!state.has_broker("7"));
        assert!(state.is_data_safe());
        assert_eq!(least_loaded(&state.replica_count_by_broker), Some("1".to_string()));

        let dirs = group_log_dirs(&state);
        assert_eq!(
            dirs["0"][&LogDirState::Online],
            vec!["/kafka-logs".to_string()]
        );
        assert!(dirs["1"][&LogDirState::Offline].is_empty());
    }

    #[test]
    fn test_out_of_sync_replicas_are_unsafe() {
        let state = KafkaClusterState {
            out_of_sync_count_by_broker: BTreeMap::from([("0".to_string(), 2)]),
            ..Default::default()
        };
        assert!(!state.is_data_safe());

        let state = KafkaClusterState {
            offline_log_dirs_by_broker: BTreeMap::from([(
                "1".to_string(),
                vec!["/kafka-logs-2".to_string()],
            )]),
            ..Default::default()
        };
        assert!(!state.is_data_safe());
    }

    #[test]
    fn test_status_readiness() {
        let mut status = CruiseControlStatus {
            monitor_ready: true,
            executor_ready: true,
            analyzer_ready: true,
            ..Default::default()
        };
        assert!(status.is_ready());
        status.monitor_ready = false;
        assert!(!status.is_ready());
    }
}
