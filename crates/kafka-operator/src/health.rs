//! Node health probing for rolling upgrades
//!
//! A restarted broker is healthy once its pod is Ready. Controller nodes in
//! KRaft mode must additionally report an active raft role (`leader` or
//! `follower`) on their Prometheus endpoint; a candidate or unattached node
//! has not rejoined the quorum yet.

use crate::crd::{BrokerState, KafkaCluster};
use crate::error::Result;
use crate::workload::broker_pod_selector;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Metric family reporting the raft role, suffixed by the role name
pub const RAFT_STATE_METRIC_PREFIX: &str = "kafka_server_raft_metrics_current_state_";

/// Raft roles of a member in good standing
const HEALTHY_RAFT_ROLES: &[&str] = &["leader", "follower"];

/// Timeout for a single metrics scrape
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health of a node after a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    /// No live pod for the node
    Down,
    /// Pod exists but the node has not rejoined yet
    Starting,
    Healthy,
}

/// Extract the current raft role from Prometheus text exposition
///
/// Returns the role of the first `kafka_server_raft_metrics_current_state_*`
/// sample whose value is 1.
pub fn raft_role(metrics: &str) -> Option<&str> {
    for line in metrics.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some(rest) = line.strip_prefix(RAFT_STATE_METRIC_PREFIX) else {
            continue;
        };

        let name_end = rest
            .find(|c: char| c == '{' || c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let role = &rest[..name_end];
        let mut remainder = &rest[name_end..];

        if remainder.starts_with('{') {
            match remainder.find('}') {
                Some(end) => remainder = &remainder[end + 1..],
                None => continue,
            }
        }

        let value = remainder
            .trim_start()
            .trim_start_matches('=')
            .split_whitespace()
            .next();

        if !role.is_empty() && value.and_then(|v| v.parse::<f64>().ok()) == Some(1.0) {
            return Some(role);
        }
    }
    None
}

pub fn is_healthy_raft_role(role: &str) -> bool {
    HEALTHY_RAFT_ROLES.contains(&role)
}

/// Reports whether a restarted node has rejoined the cluster
#[async_trait]
pub trait NodeHealthProbe: Send + Sync {
    async fn probe(
        &self,
        cluster: &KafkaCluster,
        broker_id: i32,
        state: &BrokerState,
    ) -> Result<NodeHealth>;
}

/// Probe backed by pod readiness and, for KRaft controllers, raft metrics
pub struct KubeHealthProbe {
    client: Client,
    http: reqwest::Client,
}

impl KubeHealthProbe {
    pub fn new(client: Client) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(SCRAPE_TIMEOUT).build()?;
        Ok(Self { client, http })
    }

    async fn scrape_raft_role(&self, pod_ip: &str, port: i32) -> Option<String> {
        let url = format!("http://{}:{}/metrics", pod_ip, port);
        let body = match self.http.get(&url).send().await {
            Ok(response) => response.text().await.ok()?,
            Err(e) => {
                debug!(url = %url, error = %e, "Metrics scrape failed");
                return None;
            }
        };
        raft_role(&body).map(str::to_string)
    }
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[async_trait]
impl NodeHealthProbe for KubeHealthProbe {
    async fn probe(
        &self,
        cluster: &KafkaCluster,
        broker_id: i32,
        state: &BrokerState,
    ) -> Result<NodeHealth> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let selector = broker_pod_selector(&cluster.name_any(), broker_id);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;

        let Some(pod) = list
            .items
            .into_iter()
            .find(|p| p.metadata.deletion_timestamp.is_none())
        else {
            return Ok(NodeHealth::Down);
        };

        if !is_pod_ready(&pod) {
            return Ok(NodeHealth::Starting);
        }

        if !(cluster.spec.kraft_mode && state.is_controller_node()) {
            return Ok(NodeHealth::Healthy);
        }

        let Some(pod_ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) else {
            return Ok(NodeHealth::Starting);
        };

        let role = self
            .scrape_raft_role(&pod_ip, cluster.spec.monitoring_config.metrics_port)
            .await;
        debug!(broker_id, role = ?role, "Observed raft role");

        Ok(match role {
            Some(role) if is_healthy_raft_role(&role) => NodeHealth::Healthy,
            _ => NodeHealth::Starting,
        })
    }
}

/// Probe answering from a fixed table, for tests and dry runs
#[derive(Debug)]
pub struct ScriptedHealthProbe {
    default: NodeHealth,
    nodes: Mutex<BTreeMap<i32, NodeHealth>>,
}

impl ScriptedHealthProbe {
    /// Every node not explicitly set reports `default`
    pub fn new(default: NodeHealth) -> Self {
        Self {
            default,
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set(&self, broker_id: i32, health: NodeHealth) {
        self.nodes.lock().insert(broker_id, health);
    }

    /// Derive the node's health from raft metrics text
    pub fn set_from_metrics(&self, broker_id: i32, metrics: &str) {
        let health = match raft_role(metrics) {
            Some(role) if is_healthy_raft_role(role) => NodeHealth::Healthy,
            _ => NodeHealth::Starting,
        };
        self.set(broker_id, health);
    }
}

#[async_trait]
impl NodeHealthProbe for ScriptedHealthProbe {
    async fn probe(
        &self,
        _cluster: &KafkaCluster,
        broker_id: i32,
        _state: &BrokerState,
    ) -> Result<NodeHealth> {
        Ok(self
            .nodes
            .lock()
            .get(&broker_id)
            .copied()
            .unwrap_or(self.default))
    }
}
