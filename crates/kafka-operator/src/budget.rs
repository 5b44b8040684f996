//! Disruption budget calculation
//!
//! Derives how many brokers (and, in KRaft mode, controllers) must stay
//! available during voluntary disruptions. Budgets are recomputed on every
//! pass from the declared policy and current membership; membership changes
//! invalidate any previous value.
//!
//! The declared budget is either an absolute number of units that may be
//! disrupted (`"2"`) or a percentage of the units (`"20%"`). Percentages are
//! floored so availability is never over-estimated.

use crate::crd::{KafkaCluster, KafkaClusterSpec, KafkaClusterStatus, ProcessRole};
use crate::error::BudgetError;
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

/// Parsed budget policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetPolicy {
    /// Absolute number of units that may be disrupted
    Static(u32),
    /// Percentage of units that may be disrupted
    Percentage(f64),
}

impl BudgetPolicy {
    /// Parse a declared budget string
    pub fn parse(raw: &str) -> Result<Self, BudgetError> {
        let malformed = || BudgetError::Malformed(raw.to_string());
        let trimmed = raw.trim();

        if let Some(percentage) = trimmed.strip_suffix('%') {
            let value: f64 = percentage.parse().map_err(|_| malformed())?;
            if !value.is_finite() || value < 0.0 {
                return Err(malformed());
            }
            return Ok(BudgetPolicy::Percentage(value));
        }

        trimmed
            .parse::<u32>()
            .map(BudgetPolicy::Static)
            .map_err(|_| malformed())
    }

    /// Units that may be disrupted out of `units`
    pub fn allowed_disruptions(&self, units: u32) -> u32 {
        match *self {
            BudgetPolicy::Static(budget) => budget,
            BudgetPolicy::Percentage(percentage) => {
                let allowed = (percentage * f64::from(units) / 100.0).floor();
                if allowed >= f64::from(u32::MAX) {
                    u32::MAX
                } else {
                    allowed as u32
                }
            }
        }
    }

    /// Minimum available units, never below one
    pub fn min_available(&self, units: u32) -> u32 {
        units.saturating_sub(self.allowed_disruptions(units)).max(1)
    }
}

/// Availability floors derived for one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisruptionBudget {
    pub min_available_brokers: u32,
    /// Present only in KRaft mode
    pub min_available_controllers: Option<u32>,
}

impl DisruptionBudget {
    pub fn compute(
        spec: &KafkaClusterSpec,
        status: &KafkaClusterStatus,
    ) -> Result<Self, BudgetError> {
        let min_available_brokers = compute_broker_budget(spec, status)?;
        let min_available_controllers = if spec.kraft_mode {
            Some(compute_controller_budget(spec, status)?)
        } else {
            None
        };
        Ok(Self {
            min_available_brokers,
            min_available_controllers,
        })
    }
}

/// Count declared controller nodes
///
/// With `controller_only` set, dual-role nodes are not counted.
fn controller_count(spec: &KafkaClusterSpec, controller_only: bool) -> Result<u32, BudgetError> {
    let mut count = 0;
    for broker in &spec.brokers {
        let config = spec.effective_broker_config(broker)?;
        let counted = if controller_only {
            config.is_controller_only()
        } else {
            config.is_controller_node()
        };
        if counted {
            count += 1;
        }
    }
    Ok(count)
}

/// Minimum number of data-serving brokers that must stay available
///
/// Controller-only nodes are reported in the broker state map too, so they are
/// deducted from the observed membership before applying the budget.
pub fn compute_broker_budget(
    spec: &KafkaClusterSpec,
    status: &KafkaClusterStatus,
) -> Result<u32, BudgetError> {
    let policy = BudgetPolicy::parse(&spec.disruption_budget.budget)?;
    let controllers = controller_count(spec, true)?;
    let members = u32::try_from(status.brokers_state.len()).unwrap_or(u32::MAX);
    let brokers = members.saturating_sub(controllers);

    Ok(policy.min_available(brokers))
}

/// Minimum number of controller nodes that must stay available (KRaft only)
///
/// The declared budget is applied to the controller count, and at most one
/// controller may be disrupted at a time regardless of the budget.
pub fn compute_controller_budget(
    spec: &KafkaClusterSpec,
    _status: &KafkaClusterStatus,
) -> Result<u32, BudgetError> {
    if !spec.kraft_mode {
        return Err(BudgetError::ControllerBudgetNotApplicable);
    }

    let policy = BudgetPolicy::parse(&spec.disruption_budget.budget)?;
    let controllers = controller_count(spec, false)?;
    let from_policy = policy.min_available(controllers);
    let step_down_by_one = controllers.saturating_sub(1).max(1);

    Ok(from_policy.max(step_down_by_one))
}

/// Build the PodDisruptionBudget objects that mirror the computed budget
pub fn build_pdbs(
    cluster: &KafkaCluster,
    budget: &DisruptionBudget,
) -> Vec<PodDisruptionBudget> {
    let name = cluster.name_any();
    let spec = &cluster.spec;

    let broker_selector = if spec.kraft_mode {
        spec.get_role_selector_labels(&name, ProcessRole::Broker)
    } else {
        spec.get_selector_labels(&name)
    };

    let mut pdbs = vec![build_pdb(
        cluster,
        format!("{}-pdb", name),
        broker_selector,
        budget.min_available_brokers,
    )];

    if let Some(min_available) = budget.min_available_controllers {
        pdbs.push(build_pdb(
            cluster,
            format!("{}-controller-pdb", name),
            spec.get_role_selector_labels(&name, ProcessRole::Controller),
            min_available,
        ));
    }

    pdbs
}

fn build_pdb(
    cluster: &KafkaCluster,
    name: String,
    selector_labels: std::collections::BTreeMap<String, String>,
    min_available: u32,
) -> PodDisruptionBudget {
    let mut labels = cluster.spec.get_labels(&cluster.name_any());
    labels.extend(selector_labels.clone());

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels),
                ..Default::default()
            }),
            min_available: Some(IntOrString::Int(
                i32::try_from(min_available).unwrap_or(i32::MAX),
            )),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn owner_reference(cluster: &KafkaCluster) -> OwnerReference {
    OwnerReference {
        api_version: KafkaCluster::api_version(&()).to_string(),
        kind: KafkaCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Broker, BrokerConfig, BrokerState, CruiseControlConfig, DisruptionBudgetSpec,
        InternalListener, ListenersConfig, MonitoringConfig, RollingUpgradeConfig,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn spec(broker_roles: &[Vec<ProcessRole>], budget: &str, kraft: bool) -> KafkaClusterSpec {
        KafkaClusterSpec {
            brokers: broker_roles
                .iter()
                .enumerate()
                .map(|(id, roles)| Broker {
                    id: id as i32,
                    broker_config_group: None,
                    broker_config: Some(BrokerConfig {
                        roles: roles.clone(),
                        ..Default::default()
                    }),
                })
                .collect(),
            broker_config_groups: BTreeMap::new(),
            listeners_config: ListenersConfig {
                internal_listeners: vec![InternalListener {
                    name: "internal".to_string(),
                    container_port: 29092,
                    listener_type: "plaintext".to_string(),
                    used_for_inner_broker_communication: true,
                    used_for_controller_communication: false,
                }],
                external_listeners: vec![],
            },
            cluster_image: "kafka:3.9".to_string(),
            read_only_config: None,
            rolling_upgrade_config: RollingUpgradeConfig::default(),
            disruption_budget: DisruptionBudgetSpec {
                create: true,
                budget: budget.to_string(),
            },
            kraft_mode: kraft,
            cruise_control_config: CruiseControlConfig::default(),
            monitoring_config: MonitoringConfig::default(),
        }
    }

    fn brokers_only(n: usize, budget: &str) -> (KafkaClusterSpec, KafkaClusterStatus) {
        let spec = spec(&vec![vec![]; n], budget, false);
        let status = status_for(&spec);
        (spec, status)
    }

    fn status_for(spec: &KafkaClusterSpec) -> KafkaClusterStatus {
        let mut status = KafkaClusterStatus::default();
        for broker in &spec.brokers {
            let config = spec.effective_broker_config(broker).unwrap();
            status
                .brokers_state
                .insert(broker.id.to_string(), BrokerState::new(&config));
        }
        status
    }

    #[test]
    fn test_static_budget_three_brokers() {
        let (spec, status) = brokers_only(3, "1");
        assert_eq!(compute_broker_budget(&spec, &status).unwrap(), 2);
    }

    #[test]
    fn test_percentage_budget_ten_brokers() {
        let (spec, status) = brokers_only(10, "50%");
        assert_eq!(BudgetPolicy::parse("50%").unwrap().allowed_disruptions(10), 5);
        assert_eq!(compute_broker_budget(&spec, &status).unwrap(), 5);
    }

    #[test]
    fn test_percentage_is_floored() {
        // 33% of 5 brokers is 1.65, floored to 1 disruption
        let (spec, status) = brokers_only(5, "33%");
        assert_eq!(compute_broker_budget(&spec, &status).unwrap(), 4);
    }

    #[test]
    fn test_budget_larger_than_cluster() {
        let (spec, status) = brokers_only(3, "7");
        assert_eq!(compute_broker_budget(&spec, &status).unwrap(), 1);

        let (spec, status) = brokers_only(3, "100%");
        assert_eq!(compute_broker_budget(&spec, &status).unwrap(), 1);
    }

    #[test]
    fn test_malformed_budgets() {
        for raw in ["abc", "-5%x", "-1", "", "%", "1.5", "nan%", "-3%", "inf%"] {
            let (spec, status) = brokers_only(3, raw);
            assert_eq!(
                compute_broker_budget(&spec, &status),
                Err(BudgetError::Malformed(raw.to_string())),
                "budget {:?} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_controller_only_nodes_deducted() {
        let roles = vec![
            vec![ProcessRole::Controller],
            vec![ProcessRole::Controller],
            vec![ProcessRole::Controller],
            vec![ProcessRole::Broker],
            vec![ProcessRole::Broker],
            vec![ProcessRole::Broker],
            vec![ProcessRole::Broker],
        ];
        let spec = spec(&roles, "1", true);
        let status = status_for(&spec);
        assert_eq!(compute_broker_budget(&spec, &status).unwrap(), 3);
        assert_eq!(compute_controller_budget(&spec, &status).unwrap(), 2);
    }

    #[test]
    fn test_controller_budget_counts_dual_role_nodes() {
        let dual = vec![ProcessRole::Broker, ProcessRole::Controller];
        let spec = spec(&vec![dual; 5], "40%", true);
        let status = status_for(&spec);
        // 40% of 5 allows 2 disruptions (3), stepping down by one requires 4
        assert_eq!(compute_controller_budget(&spec, &status).unwrap(), 4);
    }

    #[test]
    fn test_controller_budget_small_quorums() {
        let controller = vec![ProcessRole::Controller];
        for (count, expected) in [(1usize, 1u32), (2, 1), (3, 2)] {
            let mut roles = vec![controller.clone(); count];
            roles.push(vec![ProcessRole::Broker]);
            let spec = spec(&roles, "0", true);
            let status = status_for(&spec);
            // a zero budget keeps every controller up
            assert_eq!(
                compute_controller_budget(&spec, &status).unwrap(),
                count as u32
            );

            let spec = KafkaClusterSpec {
                disruption_budget: DisruptionBudgetSpec {
                    create: true,
                    budget: "1".to_string(),
                },
                ..spec
            };
            assert_eq!(compute_controller_budget(&spec, &status).unwrap(), expected);
        }
    }

    #[test]
    fn test_controller_budget_requires_kraft() {
        let (spec, status) = brokers_only(3, "1");
        assert_eq!(
            compute_controller_budget(&spec, &status),
            Err(BudgetError::ControllerBudgetNotApplicable)
        );
        let budget = DisruptionBudget::compute(&spec, &status).unwrap();
        assert_eq!(budget.min_available_controllers, None);
    }

    #[test]
    fn test_build_pdbs() {
        let roles = vec![
            vec![ProcessRole::Controller],
            vec![ProcessRole::Broker],
            vec![ProcessRole::Broker],
        ];
        let cluster = KafkaCluster {
            metadata: ObjectMeta {
                name: Some("kafka".to_string()),
                namespace: Some("prod".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: spec(&roles, "1", true),
            status: None,
        };
        let status = status_for(&cluster.spec);
        let budget = DisruptionBudget::compute(&cluster.spec, &status).unwrap();

        let pdbs = build_pdbs(&cluster, &budget);
        assert_eq!(pdbs.len(), 2);
        assert_eq!(pdbs[0].metadata.name.as_deref(), Some("kafka-pdb"));
        assert_eq!(
            pdbs[1].metadata.name.as_deref(),
            Some("kafka-controller-pdb")
        );
        let broker_spec = pdbs[0].spec.as_ref().unwrap();
        assert_eq!(broker_spec.min_available, Some(IntOrString::Int(1)));
        let selector = broker_spec.selector.as_ref().unwrap();
        assert_eq!(
            selector
                .match_labels
                .as_ref()
                .unwrap()
                .get("app.kubernetes.io/component"),
            Some(&"broker".to_string())
        );
    }

    proptest! {
        #[test]
        fn prop_percentage_budget_within_bounds(n in 1u32..500, percentage in 0u32..=100) {
            let policy = BudgetPolicy::parse(&format!("{}%", percentage)).unwrap();
            let min = policy.min_available(n);
            prop_assert!(min >= 1);
            prop_assert!(min <= n);
        }

        #[test]
        fn prop_static_budget(n in 1u32..500, budget in 0u32..1000) {
            let policy = BudgetPolicy::parse(&budget.to_string()).unwrap();
            let min = policy.min_available(n);
            let expected = (i64::from(n) - i64::from(budget)).max(1) as u32;
            prop_assert_eq!(min, expected);
            if budget >= n {
                prop_assert_eq!(min, 1);
            }
        }

        #[test]
        fn prop_parse_never_panics(raw in "\\PC*") {
            let _ = BudgetPolicy::parse(&raw);
        }
    }
}
