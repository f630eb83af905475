use thiserror::Error;

/// Failures raised by the regime engine.
///
/// Non-convergence is deliberately absent: a fit that exhausts `max_iter`
/// still returns parameters, flagged with `converged = false`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegimeError {
    #[error("insufficient data: need at least {required} observations, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("covariance of state {state} stayed degenerate after {attempts} regularization attempts")]
    DegenerateCovariance { state: usize, attempts: usize },

    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl From<tokio::task::JoinError> for RegimeError {
    fn from(err: tokio::task::JoinError) -> Self {
        RegimeError::TaskFailed(err.to_string())
    }
}

impl RegimeError {
    /// Short reason shown to the caller.
    pub fn reason(&self) -> &'static str {
        match self {
            RegimeError::InsufficientData { .. } => "not enough history",
            RegimeError::DegenerateCovariance { .. } | RegimeError::NumericalInstability(_) => {
                "numerical instability"
            }
            RegimeError::InvalidInput(_) => "invalid input",
            RegimeError::InvalidModel(_) => "invalid model",
            RegimeError::TaskFailed(_) => "task failed",
        }
    }
}

pub type RegimeResult<T> = std::result::Result<T, RegimeError>;

/// Reason attached to reports whose fit hit `max_iter` before `tol`.
pub const NON_CONVERGENCE_REASON: &str = "model did not converge";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_are_distinct() {
        let short = RegimeError::InsufficientData { required: 30, actual: 12 };
        let degenerate = RegimeError::DegenerateCovariance { state: 1, attempts: 5 };

        assert_eq!(short.reason(), "not enough history");
        assert_eq!(degenerate.reason(), "numerical instability");
        assert_ne!(short.reason(), NON_CONVERGENCE_REASON);
        assert_ne!(degenerate.reason(), NON_CONVERGENCE_REASON);
    }

    #[tokio::test]
    async fn test_panicked_task_is_not_numerical() {
        let joined = tokio::task::spawn_blocking(|| panic!("worker died")).await;
        let err = RegimeError::from(joined.unwrap_err());

        assert!(matches!(err, RegimeError::TaskFailed(_)));
        assert_eq!(err.reason(), "task failed");
    }

    #[test]
    fn test_display_includes_counts() {
        let err = RegimeError::InsufficientData { required: 30, actual: 29 };
        let msg = err.to_string();
        assert!(msg.contains("30"));
        assert!(msg.contains("29"));
    }
}
