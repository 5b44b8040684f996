//! Error types for the Kafka operator

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid configuration in the declared cluster spec
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Disruption budget could not be derived from the declared policy
    #[error("Disruption budget error: {0}")]
    Budget(#[from] BudgetError),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// HTTP transport error talking to Cruise Control or a broker metrics endpoint
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Cruise Control rejected or failed a request
    #[error("Cruise Control error: {0}")]
    CruiseControl(String),

    /// Workload restart could not be issued
    #[error("Workload error: {0}")]
    Workload(String),
}

/// Errors produced while computing a disruption budget.
///
/// These are user-input defects, never transient conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BudgetError {
    #[error("malformed disruption budget '{0}': expected an integer or a percentage such as '20%'")]
    Malformed(String),

    #[error("controller disruption budget is only applicable in KRaft mode")]
    ControllerBudgetNotApplicable,

    #[error("broker {broker_id} references unknown broker config group '{group}'")]
    UnknownConfigGroup { broker_id: i32, group: String },
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::ReconcileFailed(_)
                | OperatorError::Http(_)
                | OperatorError::CruiseControl(_)
                | OperatorError::Workload(_)
        )
    }

    /// Configuration errors are not retried until the declared spec changes
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            OperatorError::InvalidConfig(_) | OperatorError::Budget(_)
        )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::Http(_) | OperatorError::CruiseControl(_) => {
                Some(Duration::from_secs(15))
            }
            e if e.is_retryable() => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::Workload("pod kafka-0 could not be deleted".to_string());
        assert_eq!(err.to_string(), "Workload error: pod kafka-0 could not be deleted");

        let err = OperatorError::from(BudgetError::UnknownConfigGroup {
            broker_id: 3,
            group: "fast".to_string(),
        });
        assert!(err.to_string().contains("'fast'"));
    }

    #[test]
    fn test_retryable_errors() {
        let workload_err = OperatorError::Workload("test".to_string());
        assert!(workload_err.is_retryable());

        let cc_err = OperatorError::CruiseControl("connection refused".to_string());
        assert!(cc_err.is_retryable());

        let budget_err = OperatorError::from(BudgetError::Malformed("abc".to_string()));
        assert!(!budget_err.is_retryable());
        assert!(budget_err.is_configuration_error());
    }

    #[test]
    fn test_requeue_delay() {
        let retryable = OperatorError::ReconcileFailed("test".to_string());
        assert_eq!(retryable.requeue_delay(), Some(Duration::from_secs(30)));

        let engine = OperatorError::CruiseControl("503".to_string());
        assert_eq!(engine.requeue_delay(), Some(Duration::from_secs(15)));

        let not_retryable = OperatorError::InvalidConfig("test".to_string());
        assert!(not_retryable.requeue_delay().is_none());
    }

    #[test]
    fn test_budget_error_message_names_input() {
        let err = BudgetError::Malformed("-5%x".to_string());
        assert!(err.to_string().contains("-5%x"));
    }
}
