//! Cruise Control REST client
//!
//! Speaks the `/kafkacruisecontrol/*` JSON API. Mutating endpoints are asked
//! not to wait for completion; the `User-Task-ID` response header identifies the
//! task for later polling.

use super::{
    group_log_dirs, least_loaded, CruiseControlStatus, KafkaBrokerState, KafkaClusterState,
    LogDirState, Scaler, ScalerFactory, StatusTaskResult, Submission, TaskResult, TaskState,
};
use crate::crd::KafkaCluster;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::ResourceExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for a single request to Cruise Control
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Response header carrying the user task id
const USER_TASK_ID_HEADER: &str = "User-Task-ID";

/// Monitor states in which the load monitor has usable samples
const READY_MONITOR_STATES: &[&str] = &["RUNNING", "SAMPLING"];

/// Configuration for the Cruise Control client
#[derive(Debug, Clone)]
pub struct CruiseControlClientConfig {
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
    /// Milliseconds Cruise Control may spend on a request before answering with a task id
    pub max_wait_ms: u64,
}

impl Default for CruiseControlClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_wait_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    #[serde(rename = "MonitorState", default)]
    monitor: Option<MonitorState>,
    #[serde(rename = "ExecutorState", default)]
    executor: Option<ExecutorState>,
    #[serde(rename = "AnalyzerState", default)]
    analyzer: Option<AnalyzerState>,
}

#[derive(Debug, Deserialize)]
struct MonitorState {
    state: String,
}

#[derive(Debug, Deserialize)]
struct ExecutorState {
    state: String,
}

#[derive(Debug, Deserialize)]
struct AnalyzerState {
    #[serde(rename = "isProposalReady", default)]
    is_proposal_ready: bool,
    #[serde(rename = "readyGoals", default)]
    ready_goals: Vec<String>,
}

impl From<StateResponse> for CruiseControlStatus {
    fn from(state: StateResponse) -> Self {
        let monitor_ready = state
            .monitor
            .as_ref()
            .is_some_and(|m| READY_MONITOR_STATES.contains(&m.state.as_str()));
        let executor_ready = state.executor.as_ref().is_some_and(|e| !e.state.is_empty());
        let executing = state
            .executor
            .as_ref()
            .is_some_and(|e| e.state != "NO_TASK_IN_PROGRESS");
        let (analyzer_ready, proposal_ready, goals_ready) = match &state.analyzer {
            Some(a) => (true, a.is_proposal_ready, !a.ready_goals.is_empty()),
            None => (false, false, false),
        };

        CruiseControlStatus {
            monitor_ready,
            executor_ready,
            analyzer_ready,
            proposal_ready,
            goals_ready,
            executing,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserTasksResponse {
    #[serde(rename = "userTasks", default)]
    user_tasks: Vec<UserTask>,
}

#[derive(Debug, Deserialize)]
struct UserTask {
    #[serde(rename = "UserTaskId")]
    id: String,
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ClusterStateResponse {
    #[serde(rename = "KafkaBrokerState", default)]
    brokers: KafkaClusterState,
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
    #[serde(default)]
    brokers: Vec<BrokerLoad>,
}

#[derive(Debug, Deserialize)]
struct BrokerLoad {
    #[serde(rename = "Broker")]
    broker: i32,
    #[serde(rename = "BrokerState")]
    state: KafkaBrokerState,
}

/// [`Scaler`] backed by the Cruise Control REST API
pub struct HttpScaler {
    base_url: String,
    http: reqwest::Client,
    config: CruiseControlClientConfig,
}

impl HttpScaler {
    /// Create a client for the Cruise Control instance at `base_url`
    pub fn new(base_url: impl Into<String>, config: CruiseControlClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connection_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            config,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/kafkacruisecontrol/{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.endpoint(path);
        debug!(url = %url, "Querying Cruise Control");

        let response = self
            .http
            .get(&url)
            .query(&[("json", "true")])
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OperatorError::CruiseControl(format!(
                "GET {} returned {}: {}",
                path, status, body
            )));
        }

        Ok(response.json::<T>().await?)
    }

    /// Submit a mutating request; never waits for the task to finish
    async fn post_task(&self, path: &str, params: BTreeMap<String, String>) -> Result<Submission> {
        if !self.is_ready().await {
            debug!(endpoint = %path, "Cruise Control not ready, deferring request");
            return Ok(Submission::EngineNotReady);
        }

        let mut query = params;
        query.insert("json".to_string(), "true".to_string());
        query
            .entry("max_wait_ms".to_string())
            .or_insert_with(|| self.config.max_wait_ms.to_string());

        let url = self.endpoint(path);
        let response = self.http.post(&url).query(&query).send().await?;
        let status = response.status();

        if status == StatusCode::SERVICE_UNAVAILABLE {
            warn!(endpoint = %path, "Cruise Control answered 503, engine not ready");
            return Ok(Submission::EngineNotReady);
        }

        let task_id = response
            .headers()
            .get(USER_TASK_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OperatorError::CruiseControl(format!(
                "POST {} returned {}: {}",
                path, status, body
            )));
        }

        let task_id = task_id.ok_or_else(|| {
            OperatorError::CruiseControl(format!("POST {} returned no {}", path, USER_TASK_ID_HEADER))
        })?;

        // 200 means the request finished within max_wait_ms; 202 means it is still running
        let state = if status == StatusCode::OK {
            TaskState::Completed
        } else {
            TaskState::Active
        };

        info!(endpoint = %path, task_id = %task_id, state = ?state, "Cruise Control task accepted");
        Ok(Submission::Accepted(TaskResult::new(task_id, state)))
    }
}

fn broker_params(broker_ids: &[String]) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("brokerid".to_string(), broker_ids.join(",")),
        ("dryrun".to_string(), "false".to_string()),
    ])
}

/// Caller parameters, with execution forced on unless explicitly set
fn execution_params(params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut params = params.clone();
    params
        .entry("dryrun".to_string())
        .or_insert_with(|| "false".to_string());
    params
}

#[async_trait]
impl Scaler for HttpScaler {
    async fn is_up(&self) -> bool {
        self.get_json::<serde_json::Value>("state", &[]).await.is_ok()
    }

    async fn is_ready(&self) -> bool {
        match self.status().await {
            Ok(StatusTaskResult {
                status: Some(status),
                ..
            }) => status.is_ready(),
            Ok(_) => false,
            Err(e) => {
                debug!(error = %e, "Cruise Control status unavailable");
                false
            }
        }
    }

    async fn status(&self) -> Result<StatusTaskResult> {
        let state: StateResponse = self
            .get_json(
                "state",
                &[("substates", "monitor,executor,analyzer".to_string())],
            )
            .await?;

        Ok(StatusTaskResult {
            status: Some(state.into()),
            task: None,
        })
    }

    async fn status_task(&self, task_id: &str) -> Result<StatusTaskResult> {
        let mut result = self.status().await?;
        result.task = self
            .user_tasks(&[task_id.to_string()])
            .await?
            .into_iter()
            .find(|t| t.task_id == task_id);
        Ok(result)
    }

    async fn user_tasks(&self, task_ids: &[String]) -> Result<Vec<TaskResult>> {
        if task_ids.is_empty() {
            return Ok(vec![]);
        }

        let response: UserTasksResponse = self
            .get_json("user_tasks", &[("user_task_ids", task_ids.join(","))])
            .await?;

        Ok(response
            .user_tasks
            .into_iter()
            .filter_map(|task| match TaskState::from_engine(&task.status) {
                Some(state) => Some(TaskResult::new(task.id, state)),
                None => {
                    warn!(task_id = %task.id, status = %task.status, "Unknown Cruise Control task status");
                    None
                }
            })
            .collect())
    }

    async fn add_brokers(&self, broker_ids: &[String]) -> Result<Submission> {
        self.post_task("add_broker", broker_params(broker_ids)).await
    }

    async fn add_brokers_with_params(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<Submission> {
        self.post_task("add_broker", execution_params(params)).await
    }

    async fn remove_brokers(&self, broker_ids: &[String]) -> Result<Submission> {
        self.post_task("remove_broker", broker_params(broker_ids))
            .await
    }

    async fn remove_brokers_with_params(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<Submission> {
        self.post_task("remove_broker", execution_params(params))
            .await
    }

    async fn remove_disks_with_params(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<Submission> {
        self.post_task("remove_disks", execution_params(params))
            .await
    }

    async fn rebalance_with_params(&self, params: &BTreeMap<String, String>) -> Result<Submission> {
        self.post_task("rebalance", execution_params(params)).await
    }

    async fn rebalance_disks(&self, broker_ids: &[String]) -> Result<Submission> {
        let mut params = broker_params(broker_ids);
        params.insert("rebalance_disk".to_string(), "true".to_string());
        self.post_task("rebalance", params).await
    }

    async fn stop_execution(&self) -> Result<Submission> {
        self.post_task("stop_proposal_execution", BTreeMap::new())
            .await
    }

    async fn kafka_cluster_state(&self) -> Result<KafkaClusterState> {
        let response: ClusterStateResponse = self.get_json("kafka_cluster_state", &[]).await?;
        Ok(response.brokers)
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
        let response: LoadResponse = self
            .get_json("load", &[("allow_capacity_estimation", "true".to_string())])
            .await?;

        Ok(response
            .brokers
            .into_iter()
            .filter(|b| states.contains(&b.state))
            .map(|b| b.broker.to_string())
            .collect())
    }
}

/// Builds an [`HttpScaler`] per cluster from its declared or default URL
#[derive(Debug, Clone, Default)]
pub struct HttpScalerFactory {
    config: CruiseControlClientConfig,
}

impl HttpScalerFactory {
    pub fn new(config: CruiseControlClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ScalerFactory for HttpScalerFactory {
    async fn scaler_for(&self, cluster: &KafkaCluster) -> Result<Arc<dyn Scaler>> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let url = cluster
            .spec
            .cruise_control_url(&cluster.name_any(), &namespace);
        Ok(Arc::new(HttpScaler::new(url, self.config.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CruiseControlClientConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_wait_ms, 1000);
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let scaler =
            HttpScaler::new("http://cc:8090/", CruiseControlClientConfig::default()).unwrap();
        assert_eq!(
            scaler.endpoint("user_tasks"),
            "http://cc:8090/kafkacruisecontrol/user_tasks"
        );
    }

    #[test]
    fn test_state_response_ready() {
        let json = r#"{
            "MonitorState": {"state": "RUNNING", "trainingPct": 100.0},
            "ExecutorState": {"state": "NO_TASK_IN_PROGRESS"},
            "AnalyzerState": {"isProposalReady": true, "readyGoals": ["RackAwareGoal"]},
            "version": 1
        }"#;
        let state: StateResponse = serde_json::from_str(json).unwrap();
        let status = CruiseControlStatus::from(state);
        assert!(status.is_ready());
        assert!(status.proposal_ready);
        assert!(status.goals_ready);
        assert!(!status.executing);
    }

    #[test]
    fn test_state_response_bootstrapping() {
        let json = r#"{
            "MonitorState": {"state": "BOOTSTRAPPING"},
            "ExecutorState": {"state": "INTER_BROKER_REPLICA_MOVEMENT_TASK_IN_PROGRESS"}
        }"#;
        let state: StateResponse = serde_json::from_str(json).unwrap();
        let status = CruiseControlStatus::from(state);
        assert!(!status.is_ready());
        assert!(status.executing);
        assert!(!status.analyzer_ready);
    }

    #[test]
    fn test_user_tasks_response() {
        let json = r#"{
            "userTasks": [
                {"UserTaskId": "a1", "Status": "InExecution", "RequestURL": "POST /add_broker"},
                {"UserTaskId": "b2", "Status": "CompletedWithError", "RequestURL": "POST /rebalance"}
            ],
            "version": 1
        }"#;
        let response: UserTasksResponse = serde_json::from_str(json).unwrap();
        let states: Vec<_> = response
            .user_tasks
            .iter()
            .map(|t| TaskState::from_engine(&t.status))
            .collect();
        assert_eq!(
            states,
            vec![Some(TaskState::Active), Some(TaskState::CompletedWithError)]
        );
    }

    #[test]
    fn test_load_response() {
        let json = r#"{
            "brokers": [
                {"Broker": 0, "BrokerState": "ALIVE", "Replicas": 10},
                {"Broker": 3, "BrokerState": "BAD_DISKS", "Replicas": 2}
            ],
            "hosts": []
        }"#;
        let response: LoadResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.brokers[1].broker, 3);
        assert_eq!(response.brokers[1].state, KafkaBrokerState::BadDisks);
    }

    #[test]
    fn test_execution_params_force_dryrun_off() {
        let params = BTreeMap::from([("goals".to_string(), "DiskUsageDistributionGoal".to_string())]);
        let params = execution_params(&params);
        assert_eq!(params.get("dryrun"), Some(&"false".to_string()));

        let explicit = BTreeMap::from([("dryrun".to_string(), "true".to_string())]);
        assert_eq!(
            execution_params(&explicit).get("dryrun"),
            Some(&"true".to_string())
        );
        assert_eq!(
            broker_params(&["1".to_string(), "2".to_string()]).get("brokerid"),
            Some(&"1,2".to_string())
        );
    }

    const READY_STATE: &str = r#"{"MonitorState":{"state":"RUNNING"},"ExecutorState":{"state":"NO_TASK_IN_PROGRESS"},"AnalyzerState":{"isProposalReady":true,"readyGoals":["RackAwareGoal"]}}"#;

    /// Serves a ready engine state and answers every POST with `post_response`.
    /// Returns the base URL and the request lines of the POSTs received.
    async fn cruise_control_stub(
        post_response: &'static str,
    ) -> (String, Arc<parking_lot::Mutex<Vec<String>>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let posts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = posts.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request).to_string();
                let line = request.lines().next().unwrap_or_default().to_string();

                let response = if line.starts_with("GET /kafkacruisecontrol/state") {
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        READY_STATE.len(),
                        READY_STATE
                    )
                } else {
                    seen.lock().push(line);
                    post_response.to_string()
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), posts)
    }

    fn scaler(url: &str) -> HttpScaler {
        HttpScaler::new(url, CruiseControlClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_post_503_is_engine_not_ready() {
        let (url, posts) = cruise_control_stub(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let submission = scaler(&url).add_brokers(&["3".to_string()]).await.unwrap();
        assert_eq!(submission, Submission::EngineNotReady);
        assert_eq!(posts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_post_200_with_task_id_is_completed() {
        let (url, posts) = cruise_control_stub(
            "HTTP/1.1 200 OK\r\nUser-Task-ID: task-7\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
        )
        .await;

        let submission = scaler(&url).remove_brokers(&["4".to_string(), "5".to_string()]).await.unwrap();
        assert_eq!(
            submission,
            Submission::Accepted(TaskResult::new("task-7", TaskState::Completed))
        );

        let posts = posts.lock();
        assert!(posts[0].starts_with("POST /kafkacruisecontrol/remove_broker?"));
        assert!(posts[0].contains("brokerid=4%2C5"));
        assert!(posts[0].contains("dryrun=false"));
    }

    #[tokio::test]
    async fn test_post_202_with_task_id_is_active() {
        let (url, _) = cruise_control_stub(
            "HTTP/1.1 202 Accepted\r\nUser-Task-ID: task-8\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
        )
        .await;

        let submission = scaler(&url).stop_execution().await.unwrap();
        assert_eq!(
            submission,
            Submission::Accepted(TaskResult::new("task-8", TaskState::Active))
        );
    }

    #[tokio::test]
    async fn test_post_without_task_id_is_an_error() {
        let (url, _) = cruise_control_stub(
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
        )
        .await;

        let err = scaler(&url).rebalance_disks(&["1".to_string()]).await.unwrap_err();
        assert!(matches!(err, OperatorError::CruiseControl(_)));
        assert!(err.to_string().contains("User-Task-ID"));
    }

    #[tokio::test]
    async fn test_post_server_error_keeps_body() {
        let (url, _) = cruise_control_stub(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 11\r\nConnection: close\r\n\r\nno proposal",
        )
        .await;

        let err = scaler(&url).add_brokers(&["3".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("no proposal"));
    }

    #[tokio::test]
    async fn test_unreachable_engine_defers_without_posting() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let submission = scaler(&url).add_brokers(&["3".to_string()]).await.unwrap();
        assert_eq!(submission, Submission::EngineNotReady);
    }
}
