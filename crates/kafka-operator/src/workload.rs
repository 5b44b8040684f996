//! Broker workload restarts
//!
//! A broker is restarted by deleting its pod. Recreating the pod with the new
//! configuration belongs to the templating layer that owns the pod spec.

use crate::crd::{KafkaCluster, BROKER_ID_LABEL};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Label selector matching the pods of one broker
pub fn broker_pod_selector(cluster_name: &str, broker_id: i32) -> String {
    format!(
        "app.kubernetes.io/instance={},{}={}",
        cluster_name, BROKER_ID_LABEL, broker_id
    )
}

/// Issues restarts for broker workloads
#[async_trait]
pub trait WorkloadRestarter: Send + Sync {
    async fn restart(&self, cluster: &KafkaCluster, broker_id: i32) -> Result<()>;
}

/// Restarts brokers by deleting their pods
pub struct PodRestarter {
    client: Client,
}

impl PodRestarter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadRestarter for PodRestarter {
    async fn restart(&self, cluster: &KafkaCluster, broker_id: i32) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let selector = broker_pod_selector(&cluster.name_any(), broker_id);

        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        if list.items.is_empty() {
            warn!(broker_id, selector = %selector, "No pod found for broker, nothing to restart");
            return Ok(());
        }

        for pod in list.items {
            let name = pod.name_any();
            match pods.delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!(broker_id, pod = %name, "Deleted broker pod for restart"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => {
                    return Err(OperatorError::Workload(format!(
                        "failed to delete pod {}: {}",
                        name, e
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Records restarts instead of issuing them
#[derive(Debug, Default)]
pub struct RecordingRestarter {
    restarts: Mutex<Vec<i32>>,
    failing: Mutex<bool>,
}

impl RecordingRestarter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker ids restarted so far, in order
    pub fn restarts(&self) -> Vec<i32> {
        self.restarts.lock().clone()
    }

    pub fn restart_count(&self, broker_id: i32) -> usize {
        self.restarts
            .lock()
            .iter()
            .filter(|id| **id == broker_id)
            .count()
    }

    /// Make subsequent restarts fail
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl WorkloadRestarter for RecordingRestarter {
    async fn restart(&self, _cluster: &KafkaCluster, broker_id: i32) -> Result<()> {
        if *self.failing.lock() {
            return Err(OperatorError::Workload(format!(
                "restart of broker {} rejected",
                broker_id
            )));
        }
        self.restarts.lock().push(broker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_pod_selector() {
        assert_eq!(
            broker_pod_selector("kafka", 3),
            "app.kubernetes.io/instance=kafka,kafka.operator.dev/broker-id=3"
        );
    }

    #[test]
    fn test_recording_restarter_counts() {
        let restarter = RecordingRestarter::new();
        restarter.restarts.lock().extend([1, 2, 1]);
        assert_eq!(restarter.restart_count(1), 2);
        assert_eq!(restarter.restarts(), vec![1, 2, 1]);
    }
}
