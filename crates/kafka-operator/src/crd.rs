//! Custom Resource Definitions for the Kafka operator
//!
//! This module defines the `KafkaCluster` CRD. The spec half is declared by
//! users; the status half is owned exclusively by the reconciler and carries
//! per-broker lifecycle state together with the Cruise Control operations
//! issued for the cluster.

use crate::error::BudgetError;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Rack assigned to brokers that do not declare one
pub const DEFAULT_RACK: &str = "default";

/// Label carrying the broker id on broker pods
pub const BROKER_ID_LABEL: &str = "kafka.operator.dev/broker-id";

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex is valid")
});

/// Regex for integer or percentage budgets ("1", "25%", "12.5%")
static BUDGET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+|[0-9]+(\.[0-9]+)?%)$").expect("static regex is valid")
});

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("empty_image")
            .with_message("cluster image must not be empty".into()));
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate the declared broker list
fn validate_brokers(brokers: &[Broker]) -> Result<(), ValidationError> {
    let mut seen = std::collections::BTreeSet::new();
    for broker in brokers {
        if broker.id < 0 {
            return Err(ValidationError::new("negative_broker_id")
                .with_message(format!("broker id {} must not be negative", broker.id).into()));
        }
        if !seen.insert(broker.id) {
            return Err(ValidationError::new("duplicate_broker_id")
                .with_message(format!("broker id {} is declared more than once", broker.id).into()));
        }
    }
    Ok(())
}

/// Validate a disruption budget string
fn validate_budget(value: &str) -> Result<(), ValidationError> {
    if !BUDGET_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_budget").with_message(
            format!(
                "'{}' must be an integer or percentage (e.g., '1' or '20%')",
                value
            )
            .into(),
        ));
    }
    Ok(())
}

/// Validate rebalance request names are unique and valid
fn validate_rebalance_requests(requests: &[RebalanceRequest]) -> Result<(), ValidationError> {
    let mut seen = std::collections::BTreeSet::new();
    for request in requests {
        if request.name.is_empty() {
            return Err(ValidationError::new("empty_request_name")
                .with_message("rebalance request name must not be empty".into()));
        }
        validate_k8s_name(&request.name)?;
        if !seen.insert(request.name.as_str()) {
            return Err(ValidationError::new("duplicate_request_name").with_message(
                format!("rebalance request '{}' is declared more than once", request.name).into(),
            ));
        }
    }
    Ok(())
}

/// KafkaCluster custom resource definition
///
/// Represents a Kafka cluster whose brokers, rolling upgrades and Cruise
/// Control rebalances are driven by the operator.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "kafka.operator.dev",
    version = "v1beta1",
    kind = "KafkaCluster",
    plural = "kafkaclusters",
    shortname = "kc",
    namespaced,
    status = "KafkaClusterStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Disrupted", "type":"integer", "jsonPath":".status.disruptedBrokers"}"#,
    printcolumn = r#"{"name":"KRaft", "type":"boolean", "jsonPath":".spec.kraftMode"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaClusterSpec {
    /// Declared brokers (1-1000), each with a unique id
    #[validate(length(min = 1, max = 1000, message = "between 1 and 1000 brokers required"))]
    #[validate(custom(function = "validate_brokers"))]
    pub brokers: Vec<Broker>,

    /// Named broker configurations shared by brokers
    #[serde(default)]
    pub broker_config_groups: BTreeMap<String, BrokerConfig>,

    /// Listener configuration
    #[validate(nested)]
    pub listeners_config: ListenersConfig,

    /// Default image for all brokers
    #[serde(default = "default_cluster_image")]
    #[validate(custom(function = "validate_image"))]
    pub cluster_image: String,

    /// Read-only broker configuration; changing it requires a rolling restart
    #[serde(default)]
    pub read_only_config: Option<String>,

    /// Rolling upgrade policy
    #[serde(default)]
    #[validate(nested)]
    pub rolling_upgrade_config: RollingUpgradeConfig,

    /// Disruption budget policy
    #[serde(default)]
    #[validate(nested)]
    pub disruption_budget: DisruptionBudgetSpec,

    /// Run with self-managed (KRaft) consensus instead of ZooKeeper
    #[serde(default)]
    pub kraft_mode: bool,

    /// Cruise Control integration
    #[serde(default)]
    #[validate(nested)]
    pub cruise_control_config: CruiseControlConfig,

    /// Monitoring configuration
    #[serde(default)]
    #[validate(nested)]
    pub monitoring_config: MonitoringConfig,
}

/// A declared broker
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Broker {
    /// Broker id, unique within the cluster
    pub id: i32,

    /// Name of the broker config group this broker uses
    #[serde(default)]
    pub broker_config_group: Option<String>,

    /// Per-broker overrides on top of the group configuration
    #[serde(default)]
    pub broker_config: Option<BrokerConfig>,
}

/// Process role of a node
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Broker,
    Controller,
}

/// Broker configuration shared by a group or overridden per broker
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Rack (availability zone) the broker runs in
    #[serde(default)]
    pub rack: Option<String>,

    /// Process roles; empty means broker-only
    #[serde(default)]
    pub roles: Vec<ProcessRole>,

    /// Image override
    #[serde(default)]
    pub image: Option<String>,

    /// Broker configuration properties
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

fn has_controller_role(roles: &[ProcessRole]) -> bool {
    roles.contains(&ProcessRole::Controller)
}

fn has_broker_role(roles: &[ProcessRole]) -> bool {
    roles.is_empty() || roles.contains(&ProcessRole::Broker)
}

impl BrokerConfig {
    /// Overlay `other` on top of this configuration
    pub fn merged(&self, other: &BrokerConfig) -> BrokerConfig {
        let mut config = self.config.clone();
        config.extend(other.config.clone());
        BrokerConfig {
            rack: other.rack.clone().or_else(|| self.rack.clone()),
            roles: if other.roles.is_empty() {
                self.roles.clone()
            } else {
                other.roles.clone()
            },
            image: other.image.clone().or_else(|| self.image.clone()),
            config,
        }
    }

    /// Node participates in the controller quorum
    pub fn is_controller_node(&self) -> bool {
        has_controller_role(&self.roles)
    }

    /// Node serves data
    pub fn is_broker_node(&self) -> bool {
        has_broker_role(&self.roles)
    }

    pub fn is_controller_only(&self) -> bool {
        self.is_controller_node() && !self.is_broker_node()
    }

    pub fn rack_or_default(&self) -> String {
        self.rack
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_RACK.to_string())
    }
}

/// Listener configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenersConfig {
    /// Listeners reachable inside the Kubernetes cluster
    #[validate(length(min = 1, message = "at least one internal listener is required"))]
    pub internal_listeners: Vec<InternalListener>,

    /// Listeners exposed outside the Kubernetes cluster
    #[serde(default)]
    pub external_listeners: Vec<ExternalListener>,
}

/// An internal listener
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InternalListener {
    pub name: String,
    pub container_port: i32,
    /// plaintext, ssl, sasl_plaintext or sasl_ssl
    #[serde(rename = "type")]
    pub listener_type: String,
    #[serde(default)]
    pub used_for_inner_broker_communication: bool,
    #[serde(default)]
    pub used_for_controller_communication: bool,
}

/// An external listener
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalListener {
    pub name: String,
    pub container_port: i32,
    #[serde(rename = "type")]
    pub listener_type: String,
    pub external_starting_port: i32,
    /// LoadBalancer or NodePort
    #[serde(default = "default_access_method")]
    pub access_method: String,
}

/// Rolling upgrade policy
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpgradeConfig {
    /// Failed restart attempts per broker before giving up (1-100)
    #[serde(default = "default_one")]
    #[validate(range(min = 1, max = 100, message = "failure threshold must be 1-100"))]
    pub failure_threshold: i32,

    /// Brokers restarted concurrently within one rack (1-50)
    #[serde(default = "default_one")]
    #[validate(range(min = 1, max = 50, message = "concurrent restarts per rack must be 1-50"))]
    pub concurrent_broker_restart_count_per_rack: i32,

    /// How long to wait for a restarted broker to rejoin (10-3600 seconds)
    #[serde(default = "default_health_wait_timeout")]
    #[validate(range(min = 10, max = 3600, message = "health wait timeout must be 10-3600 seconds"))]
    pub health_wait_timeout_seconds: i64,
}

impl Default for RollingUpgradeConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            concurrent_broker_restart_count_per_rack: 1,
            health_wait_timeout_seconds: default_health_wait_timeout(),
        }
    }
}

/// Disruption budget policy
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudgetSpec {
    /// Create PodDisruptionBudget objects for brokers (and controllers in KRaft mode)
    #[serde(default)]
    pub create: bool,

    /// Brokers allowed to be disrupted: an integer or a percentage such as "20%"
    #[serde(default = "default_budget")]
    #[validate(custom(function = "validate_budget"))]
    pub budget: String,
}

impl Default for DisruptionBudgetSpec {
    fn default() -> Self {
        Self {
            create: false,
            budget: default_budget(),
        }
    }
}

/// Cruise Control integration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CruiseControlConfig {
    /// Base URL of the Cruise Control REST API (defaults to the in-cluster service)
    #[serde(default)]
    pub url: Option<String>,

    /// Upper bound on a single Cruise Control task (60-86400 seconds)
    #[serde(default = "default_task_timeout")]
    #[validate(range(min = 60, max = 86400, message = "task timeout must be 60-86400 seconds"))]
    pub task_timeout_seconds: i64,

    /// Explicit rebalance / disk / stop requests
    #[serde(default)]
    #[validate(custom(function = "validate_rebalance_requests"))]
    pub rebalance_requests: Vec<RebalanceRequest>,
}

impl Default for CruiseControlConfig {
    fn default() -> Self {
        Self {
            url: None,
            task_timeout_seconds: default_task_timeout(),
            rebalance_requests: vec![],
        }
    }
}

/// An explicit request executed once through Cruise Control
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRequest {
    /// Unique request name; a request runs at most once per name
    pub name: String,

    pub kind: RebalanceKind,

    /// Target brokers, where the kind takes any
    #[serde(default)]
    pub broker_ids: Vec<i32>,

    /// Free-form Cruise Control parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Kind of an explicit request
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RebalanceKind {
    Rebalance,
    RebalanceDisks,
    RemoveDisks,
    StopExecution,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    /// Port serving Prometheus metrics on broker pods (1024-65535)
    #[serde(default = "default_metrics_port")]
    #[validate(range(min = 1024, max = 65535, message = "metrics port must be between 1024 and 65535"))]
    pub metrics_port: i32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
        }
    }
}

/// Status of a KafkaCluster resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KafkaClusterStatus {
    /// Aggregate cluster state
    #[serde(default)]
    pub state: ClusterState,

    /// Per-broker state, keyed by broker id
    #[serde(default)]
    pub brokers_state: BTreeMap<String, BrokerState>,

    /// Brokers currently disrupted by a rolling upgrade
    #[serde(default)]
    pub disrupted_brokers: i32,

    /// Broker availability floor computed on the last pass
    #[serde(default)]
    pub min_available_brokers: Option<i32>,

    /// Controller availability floor computed on the last pass (KRaft only)
    #[serde(default)]
    pub min_available_controllers: Option<i32>,

    /// Cruise Control operations, keyed by operation id
    #[serde(default)]
    pub scale_operations: BTreeMap<String, ScaleOperation>,

    /// Conditions describing cluster state
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Current observed generation
    #[serde(default)]
    pub observed_generation: i64,

    /// Last time the status was updated
    pub last_updated: Option<String>,

    /// Error message if any
    pub message: Option<String>,
}

/// Aggregate state of a cluster
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterState {
    #[default]
    Reconciling,
    Running,
    RollingUpgrading,
    Error,
}

/// Observed state of one broker or controller node
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerState {
    pub rack: String,

    #[serde(default)]
    pub roles: Vec<ProcessRole>,

    #[serde(default)]
    pub phase: BrokerPhase,

    #[serde(default)]
    pub upgrade: UnitUpgrade,
}

impl BrokerState {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            rack: config.rack_or_default(),
            roles: config.roles.clone(),
            phase: BrokerPhase::Configured,
            upgrade: UnitUpgrade::default(),
        }
    }

    pub fn is_controller_node(&self) -> bool {
        has_controller_role(&self.roles)
    }

    pub fn is_broker_node(&self) -> bool {
        has_broker_role(&self.roles)
    }

    pub fn is_controller_only(&self) -> bool {
        self.is_controller_node() && !self.is_broker_node()
    }
}

/// Lifecycle phase of a broker
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BrokerPhase {
    /// Declared and recorded, not yet confirmed by Cruise Control
    #[default]
    Configured,
    Running,
    /// Waiting for an add-broker task to complete
    Upscaling,
    /// Restarting as part of a rolling upgrade
    Upgrading,
    /// Waiting for a remove-broker task to drain it
    Downscaling,
    /// A scale task or upgrade failed permanently
    Failed,
}

/// Rolling upgrade bookkeeping for one unit
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitUpgrade {
    #[serde(default)]
    pub phase: UpgradePhase,

    /// Consecutive failed restart attempts
    #[serde(default)]
    pub attempts: u32,

    /// When the current attempt started (RFC 3339)
    #[serde(default)]
    pub started_at: Option<String>,

    /// Configuration revision the unit last came up healthy with
    #[serde(default)]
    pub observed_revision: Option<String>,

    /// Configuration revision the in-flight restart is rolling to
    #[serde(default)]
    pub target_revision: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

/// Rolling upgrade phase of a unit
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpgradePhase {
    #[default]
    Idle,
    /// Budget reserved, restart not yet issued
    Draining,
    /// Restart issued, pod not yet back
    Restarted,
    /// Pod back, waiting to rejoin the cluster healthy
    Rejoining,
    /// Exceeded the failure threshold; needs manual intervention
    TerminalFailure,
}

impl UpgradePhase {
    /// Unit is unavailable because of the rolling upgrade
    pub fn is_disrupted(&self) -> bool {
        !matches!(self, UpgradePhase::Idle)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            UpgradePhase::Draining | UpgradePhase::Restarted | UpgradePhase::Rejoining
        )
    }
}

/// One Cruise Control operation issued for the cluster
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleOperation {
    pub id: String,

    pub kind: ScaleOperationKind,

    #[serde(default)]
    pub broker_ids: Vec<i32>,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Cruise Control user task id, absent until accepted
    #[serde(default)]
    pub task_id: Option<String>,

    #[serde(default)]
    pub state: OperationState,

    #[serde(default)]
    pub retry_count: u32,

    /// When the operation started being tracked (RFC 3339)
    #[serde(default)]
    pub created_at: Option<String>,

    /// When the operation was first submitted (RFC 3339)
    #[serde(default)]
    pub first_scheduled: Option<String>,

    #[serde(default)]
    pub last_updated: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    /// Effect folded into broker state
    #[serde(default)]
    pub applied: bool,
}

impl ScaleOperation {
    pub fn new(
        id: impl Into<String>,
        kind: ScaleOperationKind,
        broker_ids: Vec<i32>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            broker_ids,
            parameters,
            task_id: None,
            state: OperationState::NotScheduled,
            retry_count: 0,
            created_at: None,
            first_scheduled: None,
            last_updated: None,
            error: None,
            applied: false,
        }
    }

    pub fn targets(&self, broker_id: i32) -> bool {
        self.broker_ids.contains(&broker_id)
    }
}

/// Kind of a Cruise Control operation
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ScaleOperationKind {
    AddBrokers,
    RemoveBrokers,
    RemoveDisks,
    Rebalance,
    RebalanceDisks,
    StopExecution,
}

impl From<RebalanceKind> for ScaleOperationKind {
    fn from(kind: RebalanceKind) -> Self {
        match kind {
            RebalanceKind::Rebalance => ScaleOperationKind::Rebalance,
            RebalanceKind::RebalanceDisks => ScaleOperationKind::RebalanceDisks,
            RebalanceKind::RemoveDisks => ScaleOperationKind::RemoveDisks,
            RebalanceKind::StopExecution => ScaleOperationKind::StopExecution,
        }
    }
}

/// State of a Cruise Control operation
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OperationState {
    #[default]
    NotScheduled,
    /// Accepted by Cruise Control, not yet observed running
    InProgress,
    /// Reported active by Cruise Control
    Active,
    Completed,
    CompletedWithError,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::CompletedWithError
        )
    }
}

/// Condition describing an aspect of cluster state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Reason for the condition
    pub reason: Option<String>,

    /// Human-readable message
    pub message: Option<String>,

    /// Last transition time
    pub last_transition_time: Option<String>,
}

impl KafkaClusterStatus {
    /// Insert or replace a condition, keeping the transition time when the status is unchanged
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
        now: &str,
    ) {
        let status = if status { "True" } else { "False" }.to_string();
        let message = Some(message.into());
        let reason = Some(reason.to_string());

        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if existing.status != status {
                existing.last_transition_time = Some(now.to_string());
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
            return;
        }

        self.conditions.push(ClusterCondition {
            condition_type: condition_type.to_string(),
            status,
            reason,
            message,
            last_transition_time: Some(now.to_string()),
        });
    }

    pub fn remove_condition(&mut self, condition_type: &str) {
        self.conditions
            .retain(|c| c.condition_type != condition_type);
    }

    pub fn condition(&self, condition_type: &str) -> Option<&ClusterCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

// Default value functions
fn default_cluster_image() -> String {
    "ghcr.io/kafka-operator/kafka:3.9.1".to_string()
}

fn default_access_method() -> String {
    "LoadBalancer".to_string()
}

fn default_one() -> i32 {
    1
}

fn default_health_wait_timeout() -> i64 {
    300
}

fn default_budget() -> String {
    "1".to_string()
}

fn default_task_timeout() -> i64 {
    3600
}

fn default_metrics_port() -> i32 {
    9020
}

impl KafkaClusterSpec {
    /// Effective configuration of a broker: its group overlaid by its own overrides
    pub fn effective_broker_config(&self, broker: &Broker) -> Result<BrokerConfig, BudgetError> {
        let base = match broker.broker_config_group.as_deref() {
            Some(group) if !group.is_empty() => self
                .broker_config_groups
                .get(group)
                .cloned()
                .ok_or_else(|| BudgetError::UnknownConfigGroup {
                    broker_id: broker.id,
                    group: group.to_string(),
                })?,
            _ => BrokerConfig::default(),
        };

        Ok(match &broker.broker_config {
            Some(overrides) => base.merged(overrides),
            None => base,
        })
    }

    pub fn broker(&self, id: i32) -> Option<&Broker> {
        self.brokers.iter().find(|b| b.id == id)
    }

    /// Image a broker runs with
    pub fn broker_image(&self, config: &BrokerConfig) -> String {
        config
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.cluster_image.clone())
    }

    /// Cruise Control base URL for this cluster
    pub fn cruise_control_url(&self, cluster_name: &str, namespace: &str) -> String {
        self.cruise_control_config
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| {
                format!(
                    "http://{}-cruisecontrol-svc.{}.svc.cluster.local:8090",
                    cluster_name, namespace
                )
            })
    }

    /// Get labels for managed resources
    pub fn get_labels(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(cluster_name);
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "kafka-operator".to_string(),
        );
        labels
    }

    /// Get selector labels matching every node of the cluster
    pub fn get_selector_labels(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), "kafka".to_string());
        labels.insert(
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        );
        labels
    }

    /// Selector labels for nodes of one role
    pub fn get_role_selector_labels(
        &self,
        cluster_name: &str,
        role: ProcessRole,
    ) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(cluster_name);
        let component = match role {
            ProcessRole::Broker => "broker",
            ProcessRole::Controller => "controller",
        };
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            component.to_string(),
        );
        labels
    }
}
