use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::trainer::{FitOutcome, Trainer};
use crate::config::{CovarianceType, TrainingSettings};
use crate::error::{RegimeError, RegimeResult};

/// Information-criterion score of one candidate state count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub n_states: usize,
    pub log_likelihood: f64,
    pub bic: f64,
    pub converged: bool,
}

#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub n_states: usize,
    pub best: FitOutcome,
    /// Scores of every candidate that fitted, by ascending state count
    pub scores: Vec<CandidateScore>,
}

/// Count free parameters of a Gaussian HMM
pub fn free_parameters(n_states: usize, n_features: usize, covariance_type: CovarianceType) -> usize {
    let n = n_states;
    let d = n_features;

    // Initial: n-1 (one is constrained)
    // Transition: n * (n-1)
    // Means: n * d
    let covariance = match covariance_type {
        CovarianceType::Full => n * d * (d + 1) / 2,
        CovarianceType::Diagonal => n * d,
    };

    (n - 1) + n * (n - 1) + n * d + covariance
}

/// Bayesian Information Criterion
pub fn bic(log_likelihood: f64, n_params: usize, n_obs: usize) -> f64 {
    n_params as f64 * (n_obs as f64).ln() - 2.0 * log_likelihood
}

/// Fit one model per candidate state count on blocking tasks and keep the
/// one with the lowest BIC (ties go to fewer states).
///
/// Candidates that fail are skipped; if all fail, the error of the smallest
/// candidate is returned.
pub async fn select_state_count(
    observations: Arc<Array2<f64>>,
    candidates: Vec<usize>,
    settings: TrainingSettings,
) -> RegimeResult<SelectionOutcome> {
    if candidates.is_empty() {
        return Err(RegimeError::InvalidInput("no candidate state counts".to_string()));
    }

    let mut tasks = JoinSet::new();
    for n_states in candidates {
        let observations = Arc::clone(&observations);
        let trainer = Trainer::new(settings.clone());
        tasks.spawn_blocking(move || (n_states, trainer.fit_states(&observations, n_states)));
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (n_states, result) = joined?;
        results.push((n_states, result));
    }
    // Completion order must not influence the choice
    results.sort_by_key(|(n_states, _)| *n_states);

    let n_obs = observations.nrows();
    let n_features = observations.ncols();
    let mut scores = Vec::new();
    let mut best: Option<(f64, usize, FitOutcome)> = None;
    let mut first_error = None;

    for (n_states, result) in results {
        match result {
            Ok(outcome) => {
                let params = free_parameters(n_states, n_features, settings.covariance_type);
                let score = bic(outcome.log_likelihood, params, n_obs);
                info!(
                    "K={}: log-likelihood {:.3}, BIC {:.3}, converged={}",
                    n_states, outcome.log_likelihood, score, outcome.converged
                );
                scores.push(CandidateScore {
                    n_states,
                    log_likelihood: outcome.log_likelihood,
                    bic: score,
                    converged: outcome.converged,
                });
                let better = best.as_ref().map_or(true, |(b, _, _)| score < *b);
                if better {
                    best = Some((score, n_states, outcome));
                }
            }
            Err(e) => {
                warn!("K={} failed: {}", n_states, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match best {
        Some((_, n_states, best)) => Ok(SelectionOutcome { n_states, best, scores }),
        None => Err(first_error
            .unwrap_or_else(|| RegimeError::InvalidInput("no candidate state counts".to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::hmm::testing::{synthetic_two_state, SyntheticRegimes};

    #[test]
    fn test_free_parameters() {
        // 1 + 2 + 4 + 6
        assert_eq!(free_parameters(2, 2, CovarianceType::Full), 13);
        // 1 + 2 + 4 + 4
        assert_eq!(free_parameters(2, 2, CovarianceType::Diagonal), 11);
    }

    #[test]
    fn test_bic_penalizes_parameters() {
        assert!(bic(-100.0, 20, 500) > bic(-100.0, 10, 500));
    }

    #[tokio::test]
    async fn test_selects_two_states_for_two_regimes() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(600, 21);
        let outcome = select_state_count(Arc::new(observations), vec![4, 2, 3], TrainingSettings::default())
            .await
            .unwrap();

        assert_eq!(outcome.n_states, 2);
        assert_eq!(outcome.best.params.n_states(), 2);
        let ks: Vec<usize> = outcome.scores.iter().map(|s| s.n_states).collect();
        assert_eq!(ks, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_all_candidates_failing_returns_error() {
        let observations = Arc::new(Array2::zeros((3, 2)));
        let result = select_state_count(observations, vec![5, 6], TrainingSettings::default()).await;
        assert_eq!(
            result.unwrap_err(),
            RegimeError::InsufficientData { required: 5, actual: 3 }
        );
    }
}
