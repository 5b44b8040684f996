//! Deterministic in-memory Cruise Control
//!
//! Tasks are numbered sequentially and stay `Active` until a test moves them.
//! Every mutating call is recorded so tests can assert on what was submitted.

use super::{
    group_log_dirs, least_loaded, CruiseControlStatus, KafkaBrokerState, KafkaClusterState,
    LogDirState, Scaler, ScalerFactory, StatusTaskResult, Submission, TaskResult, TaskState,
};
use crate::crd::KafkaCluster;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A mutating request received by [`StubScaler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubCall {
    AddBrokers(Vec<String>),
    RemoveBrokers(Vec<String>),
    RemoveDisks(BTreeMap<String, String>),
    Rebalance(BTreeMap<String, String>),
    RebalanceDisks(Vec<String>),
    StopExecution,
}

#[derive(Debug)]
struct StubState {
    ready: bool,
    unreachable: bool,
    complete_on_submit: bool,
    next_task: u64,
    tasks: BTreeMap<String, TaskState>,
    calls: Vec<(String, StubCall)>,
    cluster: KafkaClusterState,
    broker_states: BTreeMap<String, KafkaBrokerState>,
}

/// Scriptable [`Scaler`] double
#[derive(Debug)]
pub struct StubScaler {
    state: Mutex<StubState>,
}

impl Default for StubScaler {
    fn default() -> Self {
        Self::new()
    }
}

impl StubScaler {
    /// A ready engine that knows no brokers and has no tasks
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState {
                ready: true,
                unreachable: false,
                complete_on_submit: false,
                next_task: 1,
                tasks: BTreeMap::new(),
                calls: Vec::new(),
                cluster: KafkaClusterState::default(),
                broker_states: BTreeMap::new(),
            }),
        }
    }

    /// Engine already knows these brokers, with the given replica count each
    pub fn with_brokers(ids: &[i32], replicas: i32) -> Self {
        let stub = Self::new();
        for id in ids {
            stub.register_broker(*id, replicas);
        }
        stub
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    /// Every call fails with a transport error while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Accepted tasks report `Completed` immediately
    pub fn set_complete_on_submit(&self, complete: bool) {
        self.state.lock().complete_on_submit = complete;
    }

    pub fn register_broker(&self, id: i32, replicas: i32) {
        let mut state = self.state.lock();
        let key = id.to_string();
        state.cluster.replica_count_by_broker.insert(key.clone(), replicas);
        state.cluster.out_of_sync_count_by_broker.insert(key.clone(), 0);
        state
            .cluster
            .online_log_dirs_by_broker
            .insert(key.clone(), vec!["/kafka-logs".to_string()]);
        state.broker_states.insert(key, KafkaBrokerState::Alive);
    }

    pub fn unregister_broker(&self, id: i32) {
        let mut state = self.state.lock();
        let key = id.to_string();
        state.cluster.replica_count_by_broker.remove(&key);
        state.cluster.out_of_sync_count_by_broker.remove(&key);
        state.cluster.online_log_dirs_by_broker.remove(&key);
        state.cluster.offline_log_dirs_by_broker.remove(&key);
        state.broker_states.remove(&key);
    }

    pub fn set_replicas(&self, id: i32, replicas: i32) {
        self.state
            .lock()
            .cluster
            .replica_count_by_broker
            .insert(id.to_string(), replicas);
    }

    pub fn set_out_of_sync(&self, id: i32, count: i32) {
        self.state
            .lock()
            .cluster
            .out_of_sync_count_by_broker
            .insert(id.to_string(), count);
    }

    pub fn set_broker_state(&self, id: i32, broker_state: KafkaBrokerState) {
        self.state
            .lock()
            .broker_states
            .insert(id.to_string(), broker_state);
    }

    pub fn set_task_state(&self, task_id: &str, task_state: TaskState) {
        self.state
            .lock()
            .tasks
            .insert(task_id.to_string(), task_state);
    }

    /// Mark every active task completed
    pub fn complete_all(&self) {
        for state in self.state.lock().tasks.values_mut() {
            if *state == TaskState::Active {
                *state = TaskState::Completed;
            }
        }
    }

    /// Drop a task, as after an engine restart
    pub fn forget_task(&self, task_id: &str) {
        self.state.lock().tasks.remove(task_id);
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.state.lock().tasks.get(task_id).copied()
    }

    /// Recorded mutating calls in submission order
    pub fn calls(&self) -> Vec<StubCall> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Task id assigned to each recorded call
    pub fn task_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    fn check_reachable(state: &StubState) -> Result<()> {
        if state.unreachable {
            return Err(OperatorError::CruiseControl(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }

    fn submit(&self, call: StubCall) -> Result<Submission> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        if !state.ready {
            return Ok(Submission::EngineNotReady);
        }

        let task_id = format!("stub-task-{}", state.next_task);
        state.next_task += 1;
        let task_state = if state.complete_on_submit {
            TaskState::Completed
        } else {
            TaskState::Active
        };
        state.tasks.insert(task_id.clone(), task_state);
        state.calls.push((task_id.clone(), call));

        Ok(Submission::Accepted(TaskResult::new(task_id, task_state)))
    }
}

#[async_trait]
impl Scaler for StubScaler {
    async fn is_up(&self) -> bool {
        !self.state.lock().unreachable
    }

    async fn is_ready(&self) -> bool {
        let state = self.state.lock();
        !state.unreachable && state.ready
    }

    async fn status(&self) -> Result<StatusTaskResult> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(StatusTaskResult {
            status: Some(CruiseControlStatus {
                monitor_ready: state.ready,
                executor_ready: state.ready,
                analyzer_ready: state.ready,
                proposal_ready: state.ready,
                goals_ready: state.ready,
                executing: state.tasks.values().any(|s| *s == TaskState::Active),
            }),
            task: None,
        })
    }

    async fn status_task(&self, task_id: &str) -> Result<StatusTaskResult> {
        let mut result = self.status().await?;
        result.task = self
            .task_state(task_id)
            .map(|state| TaskResult::new(task_id, state));
        Ok(result)
    }

    async fn user_tasks(&self, task_ids: &[String]) -> Result<Vec<TaskResult>> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id).map(|s| TaskResult::new(id.clone(), *s)))
            .collect())
    }

    async fn add_brokers(&self, broker_ids: &[String]) -> Result<Submission> {
        self.submit(StubCall::AddBrokers(broker_ids.to_vec()))
    }

    async fn add_brokers_with_params(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<Submission> {
        self.submit(StubCall::AddBrokers(split_broker_ids(params)))
    }

    async fn remove_brokers(&self, broker_ids: &[String]) -> Result<Submission> {
        self.submit(StubCall::RemoveBrokers(broker_ids.to_vec()))
    }

    async fn remove_brokers_with_params(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<Submission> {
        self.submit(StubCall::RemoveBrokers(split_broker_ids(params)))
    }

    async fn remove_disks_with_params(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<Submission> {
        self.submit(StubCall::RemoveDisks(params.clone()))
    }

    async fn rebalance_with_params(&self, params: &BTreeMap<String, String>) -> Result<Submission> {
        self.submit(StubCall::Rebalance(params.clone()))
    }

    async fn rebalance_disks(&self, broker_ids: &[String]) -> Result<Submission> {
        self.submit(StubCall::RebalanceDisks(broker_ids.to_vec()))
    }

    async fn stop_execution(&self) -> Result<Submission> {
        self.submit(StubCall::StopExecution)
    }

    async fn kafka_cluster_state(&self) -> Result<KafkaClusterState> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(state.cluster.clone())
    }

    async fn partition_replicas_by_broker(&self) -> Result<BTreeMap<String, i32>> {
        Ok(self.kafka_cluster_state().await?.replica_count_by_broker)
    }

    async fn broker_with_least_partition_replicas(&self) -> Result<Option<String>> {
        Ok(least_loaded(&self.partition_replicas_by_broker().await?))
    }

    async fn log_dirs_by_broker(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<LogDirState, Vec<String>>>> {
        Ok(group_log_dirs(&self.kafka_cluster_state().await?))
    }

    async fn brokers_with_state(&self, states: &[KafkaBrokerState]) -> Result<Vec<String>> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(state
            .broker_states
            .iter()
            .filter(|(_, s)| states.contains(s))
            .map(|(id, _)| id.clone())
            .collect())
    }
}

fn split_broker_ids(params: &BTreeMap<String, String>) -> Vec<String> {
    params
        .get("brokerid")
        .map(|ids| {
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Hands out the same [`StubScaler`] for every cluster
#[derive(Debug, Clone)]
pub struct StubScalerFactory {
    scaler: Arc<StubScaler>,
}

impl StubScalerFactory {
    pub fn new(scaler: Arc<StubScaler>) -> Self {
        Self { scaler }
    }
}

#[async_trait]
impl ScalerFactory for StubScalerFactory {
    async fn scaler_for(&self, _cluster: &KafkaCluster) -> Result<Arc<dyn Scaler>> {
        Ok(self.scaler.clone())
    }
}
