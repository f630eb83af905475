use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use super::features::RETURN_DIM;
use super::gaussian_hmm::{
    backward, check_observations, forward, log_emission_matrix, spd_determinant,
    state_posteriors, HmmParameters,
};
use crate::config::{CovarianceType, TrainingSettings};
use crate::error::{RegimeError, RegimeResult};

/// Relative size of the seeded perturbation applied to initial means
const INIT_JITTER: f64 = 1e-3;
/// Occupancy below which a state keeps its previous parameters
const MIN_OCCUPANCY: f64 = 1e-10;
/// Relative log-likelihood drop reported as an EM defect
const LL_DROP_TOL: f64 = 1e-9;

/// Result of a Baum-Welch fit.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub params: HmmParameters,
    /// False when `max_iter` ran out before the gain fell below `tol`
    pub converged: bool,
    /// Number of E-steps performed
    pub iterations: usize,
    /// Log-likelihood of `params`
    pub log_likelihood: f64,
    /// Log-likelihood after each E-step, in order
    pub history: Vec<f64>,
    /// Ridge additions applied to keep covariances invertible
    pub regularizations: usize,
}

/// State occupancy statistics from one E-step.
struct Expectations {
    log_likelihood: f64,
    gamma: Array2<f64>,
    xi_sum: Array2<f64>,
}

/// Fits Gaussian HMMs by expectation-maximization.
#[derive(Debug, Clone)]
pub struct Trainer {
    settings: TrainingSettings,
}

impl Trainer {
    pub fn new(settings: TrainingSettings) -> Self {
        Self { settings }
    }

    /// Fit with the configured number of states.
    pub fn fit(&self, observations: &Array2<f64>) -> RegimeResult<FitOutcome> {
        self.fit_states(observations, self.settings.n_states)
    }

    /// Train with Baum-Welch EM.
    ///
    /// Stops when an iteration improves the log-likelihood by less than
    /// `tol`. If `max_iter` runs out first, the parameters of the last
    /// M-step are returned with `converged = false`.
    pub fn fit_states(&self, observations: &Array2<f64>, n_states: usize) -> RegimeResult<FitOutcome> {
        if n_states < 2 {
            return Err(RegimeError::InvalidInput(format!(
                "need at least 2 states, got {}",
                n_states
            )));
        }
        let n_features = observations.ncols();
        check_observations(observations, n_features)?;
        if n_features <= RETURN_DIM {
            return Err(RegimeError::InvalidInput("observations have no return column".to_string()));
        }

        let n_obs = observations.nrows();
        let required = n_states.max(2);
        if n_obs < required {
            return Err(RegimeError::InsufficientData { required, actual: n_obs });
        }

        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let (mut params, mut regularizations) = self.initialize(observations, n_states, &mut rng)?;

        let mut history: Vec<f64> = Vec::new();
        let mut converged = false;
        let mut iterations = 0;

        for iteration in 1..=self.settings.max_iter {
            // E-step
            let expectations = expectations(&params, observations)?;
            let log_prob = expectations.log_likelihood;
            iterations = iteration;
            debug!("EM iteration {}: log-likelihood {:.6}", iteration, log_prob);

            if let Some(&prev) = history.last() {
                let gain = log_prob - prev;
                if gain < -LL_DROP_TOL * prev.abs().max(1.0) {
                    warn!(
                        "Log-likelihood decreased at iteration {} ({:.6} -> {:.6})",
                        iteration, prev, log_prob
                    );
                }
                history.push(log_prob);
                if gain < self.settings.tol {
                    converged = true;
                    break;
                }
            } else {
                history.push(log_prob);
            }

            // M-step
            let (next, added) = self.maximize(&params, observations, &expectations)?;
            params = next;
            regularizations += added;
        }

        let log_likelihood = if converged {
            history.last().copied().unwrap_or(f64::NEG_INFINITY)
        } else {
            warn!(
                "EM stopped after {} iterations without reaching tol {}",
                iterations, self.settings.tol
            );
            let final_score = params.score(observations)?;
            history.push(final_score);
            final_score
        };

        if regularizations > 0 {
            warn!("Covariance regularized {} times during fit", regularizations);
        }

        params.validate().map_err(|e| match e {
            RegimeError::InvalidModel(msg) => RegimeError::NumericalInstability(msg),
            other => other,
        })?;

        Ok(FitOutcome {
            params,
            converged,
            iterations,
            log_likelihood,
            history,
            regularizations,
        })
    }

    /// Seed means by splitting observations sorted on the return column into
    /// `n_states` equal groups; covariances start from the pooled sample
    /// covariance; transition and initial distributions start uniform.
    fn initialize(
        &self,
        observations: &Array2<f64>,
        n_states: usize,
        rng: &mut StdRng,
    ) -> RegimeResult<(HmmParameters, usize)> {
        let (n_obs, n_features) = observations.dim();

        let mut order: Vec<usize> = (0..n_obs).collect();
        order.sort_by(|&a, &b| {
            observations[[a, RETURN_DIM]].total_cmp(&observations[[b, RETURN_DIM]])
        });

        let column_std: Vec<f64> = observations
            .columns()
            .into_iter()
            .map(|col| {
                let mean = col.sum() / n_obs as f64;
                (col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n_obs as f64).sqrt()
            })
            .collect();

        let mut means = Array2::zeros((n_states, n_features));
        for state in 0..n_states {
            let start = state * n_obs / n_states;
            let end = (state + 1) * n_obs / n_states;
            let group = &order[start..end];
            for &i in group {
                for j in 0..n_features {
                    means[[state, j]] += observations[[i, j]];
                }
            }
            for j in 0..n_features {
                means[[state, j]] /= group.len() as f64;
                means[[state, j]] += rng.gen_range(-1.0..=1.0) * INIT_JITTER * column_std[j];
            }
        }

        let pooled_mean = observations.mean_axis(ndarray::Axis(0)).ok_or_else(|| {
            RegimeError::InsufficientData { required: 1, actual: 0 }
        })?;
        let weights = Array1::from_elem(n_obs, 1.0 / n_obs as f64);
        let pooled = weighted_covariance(observations, &pooled_mean, &weights, 1.0);
        let pooled = self.shape_covariance(pooled);

        let mut covariances = Vec::with_capacity(n_states);
        let mut regularizations = 0;
        for state in 0..n_states {
            let (cov, added) = self.stabilize_covariance(pooled.clone(), state)?;
            covariances.push(cov);
            regularizations += added;
        }

        let params = HmmParameters {
            means,
            covariances,
            transition: Array2::from_elem((n_states, n_states), 1.0 / n_states as f64),
            initial: Array1::from_elem(n_states, 1.0 / n_states as f64),
        };
        Ok((params, regularizations))
    }

    /// Re-estimate parameters from posterior-weighted statistics.
    fn maximize(
        &self,
        prev: &HmmParameters,
        observations: &Array2<f64>,
        expectations: &Expectations,
    ) -> RegimeResult<(HmmParameters, usize)> {
        let n_states = prev.n_states();
        let gamma = &expectations.gamma;

        // Initial distribution
        let mut initial = gamma.row(0).to_owned();
        let initial_sum = initial.sum();
        if initial_sum > 0.0 {
            initial /= initial_sum;
        } else {
            initial = prev.initial.clone();
        }

        // Transition matrix
        let mut transition = prev.transition.clone();
        for i in 0..n_states {
            let row_sum: f64 = expectations.xi_sum.row(i).sum();
            if row_sum > MIN_OCCUPANCY {
                for j in 0..n_states {
                    transition[[i, j]] = expectations.xi_sum[[i, j]] / row_sum;
                }
            }
        }

        // Means and covariances
        let mut means = prev.means.clone();
        let mut covariances = prev.covariances.clone();
        let mut regularizations = 0;
        for state in 0..n_states {
            let weights = gamma.column(state).to_owned();
            let gamma_sum = weights.sum();
            if gamma_sum < MIN_OCCUPANCY {
                debug!("State {} is unoccupied, keeping previous emission", state);
                continue;
            }

            let mean = weights.dot(observations) / gamma_sum;
            let cov = weighted_covariance(observations, &mean, &weights, gamma_sum);
            let (cov, added) = self.stabilize_covariance(self.shape_covariance(cov), state)?;

            means.row_mut(state).assign(&mean);
            covariances[state] = cov;
            regularizations += added;
        }

        let params = HmmParameters {
            means,
            covariances,
            transition,
            initial,
        };
        params.check_finite()?;
        Ok((params, regularizations))
    }

    fn shape_covariance(&self, mut cov: Array2<f64>) -> Array2<f64> {
        if self.settings.covariance_type == CovarianceType::Diagonal {
            let n = cov.nrows();
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        cov[[i, j]] = 0.0;
                    }
                }
            }
        }
        cov
    }

    /// Add a growing ridge to a near-singular covariance until its
    /// determinant clears `min_covar_det`, at most
    /// `max_regularization_retries` times.
    fn stabilize_covariance(&self, mut cov: Array2<f64>, state: usize) -> RegimeResult<(Array2<f64>, usize)> {
        if cov.iter().any(|v| !v.is_finite()) {
            return Err(RegimeError::NumericalInstability(format!(
                "non-finite covariance for state {}",
                state
            )));
        }

        let mut ridge = self.settings.reg_covar;
        let mut attempts = 0;
        loop {
            if spd_determinant(&cov) >= self.settings.min_covar_det {
                return Ok((cov, attempts));
            }
            if attempts >= self.settings.max_regularization_retries {
                return Err(RegimeError::DegenerateCovariance { state, attempts });
            }

            debug!("Regularizing covariance of state {} with ridge {:e}", state, ridge);
            for i in 0..cov.nrows() {
                cov[[i, i]] += ridge;
            }
            ridge *= 10.0;
            attempts += 1;
        }
    }
}

/// Free-function form of [`Trainer::fit_states`].
pub fn fit(
    observations: &Array2<f64>,
    n_states: usize,
    covariance_type: CovarianceType,
    max_iter: usize,
    tol: f64,
    seed: u64,
) -> RegimeResult<FitOutcome> {
    let settings = TrainingSettings {
        n_states,
        covariance_type,
        max_iter,
        tol,
        seed,
        ..TrainingSettings::default()
    };
    Trainer::new(settings).fit(observations)
}

fn expectations(params: &HmmParameters, observations: &Array2<f64>) -> RegimeResult<Expectations> {
    let n_obs = observations.nrows();
    let n_states = params.n_states();

    let log_b = log_emission_matrix(observations, &params.emissions()?);
    let log_start = params.initial.mapv(f64::ln);
    let log_trans = params.transition.mapv(f64::ln);

    let (log_alpha, log_prob) = forward(&log_b, &log_start, &log_trans);
    if !log_prob.is_finite() {
        return Err(RegimeError::NumericalInstability(format!(
            "log-likelihood is {}",
            log_prob
        )));
    }
    let log_beta = backward(&log_b, &log_trans);

    // Compute gamma (state occupation probabilities)
    let gamma = state_posteriors(&log_alpha, &log_beta);

    // Compute xi (expected transition counts)
    let mut xi_sum = Array2::zeros((n_states, n_states));
    for t in 0..n_obs - 1 {
        for i in 0..n_states {
            for j in 0..n_states {
                let log_xi = log_alpha[[t, i]]
                    + log_trans[[i, j]]
                    + log_b[[t + 1, j]]
                    + log_beta[[t + 1, j]]
                    - log_prob;
                xi_sum[[i, j]] += log_xi.exp();
            }
        }
    }

    Ok(Expectations {
        log_likelihood: log_prob,
        gamma,
        xi_sum,
    })
}

/// Symmetric weighted scatter matrix divided by `total`.
fn weighted_covariance(
    observations: &Array2<f64>,
    mean: &Array1<f64>,
    weights: &Array1<f64>,
    total: f64,
) -> Array2<f64> {
    let n_features = observations.ncols();
    let mut cov = Array2::zeros((n_features, n_features));
    for (row, &w) in observations.rows().into_iter().zip(weights.iter()) {
        for i in 0..n_features {
            let di = row[i] - mean[i];
            for j in i..n_features {
                cov[[i, j]] += w * di * (row[j] - mean[j]);
            }
        }
    }
    for i in 0..n_features {
        for j in i..n_features {
            cov[[i, j]] /= total;
            cov[[j, i]] = cov[[i, j]];
        }
    }
    cov
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::hmm::testing::{synthetic_two_state, SyntheticRegimes};
    use ndarray::array;

    fn settings(n_states: usize) -> TrainingSettings {
        TrainingSettings {
            n_states,
            max_iter: 200,
            tol: 1e-6,
            ..TrainingSettings::default()
        }
    }

    #[test]
    fn test_stochastic_invariants() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(400, 7);
        for k in 2..=3 {
            let outcome = Trainer::new(settings(k)).fit(&observations).unwrap();
            for row in outcome.params.transition.rows() {
                assert!((row.sum() - 1.0).abs() < 1e-6);
            }
            assert!((outcome.params.initial.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_log_likelihood_non_decreasing() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(500, 11);
        let outcome = Trainer::new(settings(2)).fit(&observations).unwrap();

        assert!(outcome.history.len() >= 2);
        for pair in outcome.history.windows(2) {
            let slack = 1e-8 * pair[0].abs().max(1.0);
            assert!(pair[1] >= pair[0] - slack, "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_recovers_synthetic_means() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(1000, 42);
        let outcome = Trainer::new(settings(2)).fit(&observations).unwrap();
        assert!(outcome.converged);

        let mut return_means: Vec<f64> = outcome.params.means.column(RETURN_DIM).to_vec();
        return_means.sort_by(f64::total_cmp);
        assert!((return_means[0] - (-0.02)).abs() < 0.01, "{:?}", return_means);
        assert!((return_means[1] - 0.02).abs() < 0.01, "{:?}", return_means);
    }

    #[test]
    fn test_same_seed_same_fit() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(300, 3);
        let trainer = Trainer::new(settings(2));
        let a = trainer.fit(&observations).unwrap();
        let b = trainer.fit(&observations).unwrap();
        assert_eq!(a.params, b.params);
        assert_eq!(a.history, b.history);
    }

    #[test]
    fn test_non_convergence_is_flagged() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(300, 5);
        let trainer = Trainer::new(TrainingSettings {
            max_iter: 1,
            tol: 1e-12,
            ..settings(2)
        });
        let outcome = trainer.fit(&observations).unwrap();

        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.log_likelihood.is_finite());
        assert!(outcome.params.validate().is_ok());
    }

    #[test]
    fn test_constant_series_does_not_produce_nan() {
        let observations = Array2::zeros((40, 2));
        match Trainer::new(settings(2)).fit(&observations) {
            Ok(outcome) => {
                assert!(outcome.params.check_finite().is_ok());
                assert!(outcome.log_likelihood.is_finite());
                assert!(outcome.regularizations > 0);
            }
            Err(RegimeError::DegenerateCovariance { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_degenerate_without_retry_budget() {
        let observations = Array2::zeros((40, 2));
        let trainer = Trainer::new(TrainingSettings {
            max_regularization_retries: 0,
            ..settings(2)
        });
        assert!(matches!(
            trainer.fit(&observations),
            Err(RegimeError::DegenerateCovariance { attempts: 0, .. })
        ));
    }

    #[test]
    fn test_too_few_observations() {
        let observations = array![[0.1, 0.0], [0.2, 0.1]];
        assert_eq!(
            Trainer::new(settings(3)).fit(&observations).unwrap_err(),
            RegimeError::InsufficientData { required: 3, actual: 2 }
        );
    }

    #[test]
    fn test_diagonal_covariances() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(300, 9);
        let trainer = Trainer::new(TrainingSettings {
            covariance_type: CovarianceType::Diagonal,
            ..settings(2)
        });
        let outcome = trainer.fit(&observations).unwrap();
        for cov in &outcome.params.covariances {
            assert_eq!(cov[[0, 1]], 0.0);
            assert_eq!(cov[[1, 0]], 0.0);
        }
    }

    #[test]
    fn test_free_function_contract() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(200, 1);
        let outcome = fit(&observations, 2, CovarianceType::Full, 50, 1e-4, 0).unwrap();
        assert_eq!(outcome.params.n_states(), 2);
        assert_eq!(outcome.params.n_features(), 2);
    }
}
