//! # Kafka Cluster Lifecycle Operator
//!
//! Kubernetes operator that drives the lifecycle of Kafka clusters declared
//! through the `KafkaCluster` custom resource.
//!
//! ## Features
//!
//! - **Disruption Budgets**: static or percentage budgets for brokers and KRaft
//!   controllers, published as PodDisruptionBudgets
//! - **Rolling Upgrades**: rack-aware, budget-bounded restarts with health
//!   gating and bounded retries
//! - **Cruise Control**: asynchronous add/remove broker, disk removal and
//!   rebalance tasks tracked by user task id
//! - **Scale Reconciliation**: broker additions and removals derived from the
//!   declared broker list, drained through Cruise Control
//! - **Observability**: structured tracing and Prometheus metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kafka_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, ReconcilerConfig::default()).await
//! }
//! ```
//!
//! ## Reconciliation Pass
//!
//! Each pass over a cluster runs, in order:
//!
//! 1. **Membership**: sync declared brokers into status
//! 2. **Budget**: compute minimum available brokers and controllers
//! 3. **Scale**: derive, submit and track Cruise Control operations
//! 4. **Upgrade**: advance in-flight restarts and start new ones within budget
//! 5. **Status**: aggregate cluster state and conditions
//!
//! Passes for the same cluster never overlap. All progress lives in the
//! cluster status so an interrupted pass resumes from where it stopped.
//!
//! ## Modules
//!
//! - [`crd`] - `KafkaCluster` custom resource and status types
//! - [`budget`] - disruption budget policies and PodDisruptionBudget builders
//! - [`cruise_control`] - Cruise Control task client
//! - [`rolling_upgrade`] - rolling restart state machine
//! - [`scale`] - scale and rebalance operation tracking
//! - [`reconciler`] - a single lifecycle pass
//! - [`controller`] - Kubernetes controller wiring
//! - [`health`] - node health probes
//! - [`workload`] - broker restarts
//! - [`error`] - error types
//!
//! ## Example Resource
//!
//! ```yaml
//! apiVersion: kafka.operator.dev/v1beta1
//! kind: KafkaCluster
//! metadata:
//!   name: production
//! spec:
//!   kraftMode: true
//!   brokers:
//!     - id: 0
//!       brokerConfig: { roles: [controller] }
//!     - id: 1
//!       brokerConfigGroup: default
//!   brokerConfigGroups:
//!     default: { roles: [broker], rack: eu-west-1a }
//!   listenersConfig:
//!     internalListeners:
//!       - name: internal
//!         containerPort: 29092
//!         type: plaintext
//!         usedForInnerBrokerCommunication: true
//!       - name: controller
//!         containerPort: 29093
//!         type: plaintext
//!         usedForControllerCommunication: true
//!   disruptionBudget:
//!     create: true
//!     budget: "20%"
//!   rollingUpgradeConfig:
//!     failureThreshold: 1
//!     concurrentBrokerRestartCountPerRack: 1
//!   cruiseControlConfig:
//!     url: http://cruise-control:8090
//! ```
//!
//! ## Metrics
//!
//! - `kafka_operator_reconciliations_total` - reconciliation attempts
//! - `kafka_operator_reconciliation_errors_total` - failed passes
//! - `kafka_operator_reconciliation_duration_seconds` - pass latency
//! - `kafka_operator_broker_restarts_total` - broker restarts issued
//! - `kafka_operator_cruise_control_tasks_total` - Cruise Control tasks submitted

pub mod budget;
pub mod config;
pub mod controller;
pub mod crd;
pub mod cruise_control;
pub mod error;
pub mod health;
pub mod reconciler;
pub mod rolling_upgrade;
pub mod scale;
pub mod workload;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::budget::{build_pdbs, BudgetPolicy, DisruptionBudget};
    pub use crate::config::ReconcilerConfig;
    pub use crate::controller::{run_controller, ControllerContext, ControllerMetrics};
    pub use crate::crd::{
        Broker, BrokerConfig, BrokerPhase, BrokerState, ClusterCondition, ClusterState,
        CruiseControlConfig, DisruptionBudgetSpec, KafkaCluster, KafkaClusterSpec,
        KafkaClusterStatus, OperationState, RebalanceKind, RebalanceRequest,
        RollingUpgradeConfig, ScaleOperation, ScaleOperationKind, UpgradePhase,
    };
    pub use crate::cruise_control::{
        HttpScaler, HttpScalerFactory, Scaler, ScalerFactory, Submission, TaskResult, TaskState,
    };
    pub use crate::error::{BudgetError, OperatorError, Result};
    pub use crate::health::{KubeHealthProbe, NodeHealth, NodeHealthProbe};
    pub use crate::reconciler::{LifecycleReconciler, PassOutcome};
    pub use crate::workload::{PodRestarter, WorkloadRestarter};
}
