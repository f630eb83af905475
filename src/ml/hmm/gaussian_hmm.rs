use ndarray::{Array1, Array2, ArrayView1};
use std::f64::consts::PI;

use super::features::FeatureScaling;
use crate::error::{RegimeError, RegimeResult};

/// Tolerance for stochastic rows and vectors
pub const STOCHASTIC_TOL: f64 = 1e-6;

/// Parameters of a Gaussian hidden Markov model with K states over
/// D-dimensional observations.
///
/// A fitted instance is never mutated; relabeling and unit conversion
/// produce new values.
#[derive(Debug, Clone, PartialEq)]
pub struct HmmParameters {
    /// Emission means (K x D)
    pub means: Array2<f64>,
    /// Emission covariances, one D x D matrix per state
    pub covariances: Vec<Array2<f64>>,
    /// Row-stochastic transition matrix (K x K)
    pub transition: Array2<f64>,
    /// Initial state distribution (K)
    pub initial: Array1<f64>,
}

impl HmmParameters {
    /// Build and validate a parameter set.
    pub fn new(
        means: Array2<f64>,
        covariances: Vec<Array2<f64>>,
        transition: Array2<f64>,
        initial: Array1<f64>,
    ) -> RegimeResult<Self> {
        let params = Self {
            means,
            covariances,
            transition,
            initial,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn n_states(&self) -> usize {
        self.means.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.means.ncols()
    }

    /// Check shapes, finiteness, stochastic rows and positive-definite
    /// covariances.
    pub fn validate(&self) -> RegimeResult<()> {
        let k = self.n_states();
        let d = self.n_features();

        if k < 2 {
            return Err(RegimeError::InvalidModel(format!("need at least 2 states, got {}", k)));
        }
        if d == 0 {
            return Err(RegimeError::InvalidModel("observations have no features".to_string()));
        }
        if self.covariances.len() != k
            || self.covariances.iter().any(|c| c.dim() != (d, d))
        {
            return Err(RegimeError::InvalidModel(format!(
                "expected {} covariance matrices of {}x{}",
                k, d, d
            )));
        }
        if self.transition.dim() != (k, k) || self.initial.len() != k {
            return Err(RegimeError::InvalidModel(format!(
                "transition must be {}x{} and initial of length {}",
                k, k, k
            )));
        }

        self.check_finite()?;

        if self.transition.iter().chain(self.initial.iter()).any(|&p| p < 0.0) {
            return Err(RegimeError::InvalidModel("negative probability".to_string()));
        }
        for (i, row) in self.transition.rows().into_iter().enumerate() {
            let sum = row.sum();
            if (sum - 1.0).abs() > STOCHASTIC_TOL {
                return Err(RegimeError::InvalidModel(format!(
                    "transition row {} sums to {}",
                    i, sum
                )));
            }
        }
        let initial_sum = self.initial.sum();
        if (initial_sum - 1.0).abs() > STOCHASTIC_TOL {
            return Err(RegimeError::InvalidModel(format!(
                "initial distribution sums to {}",
                initial_sum
            )));
        }

        for (state, cov) in self.covariances.iter().enumerate() {
            for i in 0..d {
                for j in (i + 1)..d {
                    let scale = cov[[i, j]].abs().max(1.0);
                    if (cov[[i, j]] - cov[[j, i]]).abs() > 1e-9 * scale {
                        return Err(RegimeError::InvalidModel(format!(
                            "covariance of state {} is not symmetric",
                            state
                        )));
                    }
                }
            }
            if cholesky(cov).is_none() {
                return Err(RegimeError::InvalidModel(format!(
                    "covariance of state {} is not positive definite",
                    state
                )));
            }
        }

        Ok(())
    }

    /// Fail if any parameter is NaN or infinite.
    pub fn check_finite(&self) -> RegimeResult<()> {
        let all_finite = self.means.iter().all(|v| v.is_finite())
            && self.covariances.iter().all(|c| c.iter().all(|v| v.is_finite()))
            && self.transition.iter().all(|v| v.is_finite())
            && self.initial.iter().all(|v| v.is_finite());

        if all_finite {
            Ok(())
        } else {
            Err(RegimeError::NumericalInstability(
                "non-finite value in model parameters".to_string(),
            ))
        }
    }

    /// Reorder states: state `i` of the result is state `order[i]` of `self`.
    pub fn permuted(&self, order: &[usize]) -> Self {
        let k = self.n_states();
        let mut means = Array2::zeros(self.means.dim());
        let mut transition = Array2::zeros((k, k));
        let mut initial = Array1::zeros(k);
        let mut covariances = Vec::with_capacity(k);

        for (new, &old) in order.iter().enumerate() {
            means.row_mut(new).assign(&self.means.row(old));
            covariances.push(self.covariances[old].clone());
            initial[new] = self.initial[old];
            for (new_to, &old_to) in order.iter().enumerate() {
                transition[[new, new_to]] = self.transition[[old, old_to]];
            }
        }

        Self {
            means,
            covariances,
            transition,
            initial,
        }
    }

    /// Map parameters fitted on standardized features back to raw units.
    pub fn destandardize(&self, scaling: &[FeatureScaling]) -> RegimeResult<Self> {
        let d = self.n_features();
        if scaling.len() != d {
            return Err(RegimeError::InvalidModel(format!(
                "scaling has {} columns, model has {} features",
                scaling.len(),
                d
            )));
        }

        let mut means = self.means.clone();
        for mut row in means.rows_mut() {
            for (value, s) in row.iter_mut().zip(scaling) {
                *value = s.invert(*value);
            }
        }

        let covariances = self
            .covariances
            .iter()
            .map(|cov| {
                let mut raw = cov.clone();
                for i in 0..d {
                    for j in 0..d {
                        raw[[i, j]] *= scaling[i].std * scaling[j].std;
                    }
                }
                raw
            })
            .collect();

        Ok(Self {
            means,
            covariances,
            transition: self.transition.clone(),
            initial: self.initial.clone(),
        })
    }

    /// Precompute the per-state emission densities.
    pub fn emissions(&self) -> RegimeResult<Vec<GaussianEmission>> {
        (0..self.n_states())
            .map(|state| {
                GaussianEmission::new(self.means.row(state).to_owned(), &self.covariances[state])
                    .ok_or_else(|| {
                        RegimeError::NumericalInstability(format!(
                            "covariance of state {} is not positive definite",
                            state
                        ))
                    })
            })
            .collect()
    }

    /// Total log-likelihood of an observation sequence under these parameters.
    pub fn score(&self, observations: &Array2<f64>) -> RegimeResult<f64> {
        check_observations(observations, self.n_features())?;
        let log_b = log_emission_matrix(observations, &self.emissions()?);
        let (_, log_prob) = forward(&log_b, &self.initial.mapv(f64::ln), &self.transition.mapv(f64::ln));
        if log_prob.is_finite() {
            Ok(log_prob)
        } else {
            Err(RegimeError::NumericalInstability(format!(
                "log-likelihood is {}",
                log_prob
            )))
        }
    }
}

/// Multivariate normal density with a cached Cholesky factor.
#[derive(Debug, Clone)]
pub struct GaussianEmission {
    mean: Array1<f64>,
    chol: Array2<f64>,
    log_norm: f64,
}

impl GaussianEmission {
    /// Returns `None` when `covariance` is not positive definite.
    pub fn new(mean: Array1<f64>, covariance: &Array2<f64>) -> Option<Self> {
        let chol = cholesky(covariance)?;
        let d = mean.len() as f64;
        let half_log_det: f64 = chol.diag().iter().map(|v| v.ln()).sum();
        let log_norm = -0.5 * d * (2.0 * PI).ln() - half_log_det;
        Some(Self { mean, chol, log_norm })
    }

    pub fn log_pdf(&self, x: ArrayView1<f64>) -> f64 {
        // Solve L z = (x - mu); the Mahalanobis term is |z|^2
        let n = self.mean.len();
        let mut z = vec![0.0; n];
        let mut mahal = 0.0;
        for i in 0..n {
            let mut acc = x[i] - self.mean[i];
            for k in 0..i {
                acc -= self.chol[[i, k]] * z[k];
            }
            z[i] = acc / self.chol[[i, i]];
            mahal += z[i] * z[i];
        }
        self.log_norm - 0.5 * mahal
    }
}

/// Lower-triangular Cholesky factor, or `None` if the matrix is not
/// positive definite.
pub fn cholesky(mat: &Array2<f64>) -> Option<Array2<f64>> {
    let n = mat.nrows();
    if mat.ncols() != n {
        return None;
    }

    let mut l = Array2::zeros((n, n));
    for j in 0..n {
        let mut diag = mat[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if !(diag > 0.0) || !diag.is_finite() {
            return None;
        }
        let pivot = diag.sqrt();
        l[[j, j]] = pivot;

        for i in (j + 1)..n {
            let mut acc = mat[[i, j]];
            for k in 0..j {
                acc -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = acc / pivot;
        }
    }
    Some(l)
}

/// Determinant of a symmetric matrix via Cholesky; 0.0 when it is not
/// positive definite.
pub fn spd_determinant(mat: &Array2<f64>) -> f64 {
    match cholesky(mat) {
        Some(l) => l.diag().iter().map(|v| v * v).product(),
        None => 0.0,
    }
}

/// Log emission probabilities (n_obs x n_states).
pub fn log_emission_matrix(observations: &Array2<f64>, emissions: &[GaussianEmission]) -> Array2<f64> {
    let n_obs = observations.nrows();
    let mut log_b = Array2::zeros((n_obs, emissions.len()));
    for (t, obs) in observations.rows().into_iter().enumerate() {
        for (state, emission) in emissions.iter().enumerate() {
            log_b[[t, state]] = emission.log_pdf(obs);
        }
    }
    log_b
}

/// Forward algorithm in log space. Returns (log_alpha, total log-likelihood).
pub fn forward(
    log_b: &Array2<f64>,
    log_start: &Array1<f64>,
    log_trans: &Array2<f64>,
) -> (Array2<f64>, f64) {
    let (n_obs, n_states) = log_b.dim();
    let mut log_alpha = Array2::from_elem((n_obs, n_states), f64::NEG_INFINITY);
    if n_obs == 0 {
        return (log_alpha, f64::NEG_INFINITY);
    }

    // Initialization
    for state in 0..n_states {
        log_alpha[[0, state]] = log_start[state] + log_b[[0, state]];
    }

    // Recursion
    let mut terms = vec![0.0; n_states];
    for t in 1..n_obs {
        for j in 0..n_states {
            for i in 0..n_states {
                terms[i] = log_alpha[[t - 1, i]] + log_trans[[i, j]];
            }
            log_alpha[[t, j]] = log_sum_exp(&terms) + log_b[[t, j]];
        }
    }

    // Termination
    let log_prob = log_sum_exp(&log_alpha.row(n_obs - 1).to_vec());

    (log_alpha, log_prob)
}

/// Backward algorithm in log space.
pub fn backward(log_b: &Array2<f64>, log_trans: &Array2<f64>) -> Array2<f64> {
    let (n_obs, n_states) = log_b.dim();
    let mut log_beta = Array2::from_elem((n_obs, n_states), f64::NEG_INFINITY);
    if n_obs == 0 {
        return log_beta;
    }

    // Initialization: log(1)
    log_beta.row_mut(n_obs - 1).fill(0.0);

    // Recursion (backward)
    let mut terms = vec![0.0; n_states];
    for t in (0..n_obs - 1).rev() {
        for i in 0..n_states {
            for j in 0..n_states {
                terms[j] = log_trans[[i, j]] + log_b[[t + 1, j]] + log_beta[[t + 1, j]];
            }
            log_beta[[t, i]] = log_sum_exp(&terms);
        }
    }

    log_beta
}

/// Per-timestep state posteriors from forward and backward passes.
pub fn state_posteriors(log_alpha: &Array2<f64>, log_beta: &Array2<f64>) -> Array2<f64> {
    let (n_obs, n_states) = log_alpha.dim();
    let mut gamma = Array2::zeros((n_obs, n_states));
    let mut terms = vec![0.0; n_states];

    for t in 0..n_obs {
        for s in 0..n_states {
            terms[s] = log_alpha[[t, s]] + log_beta[[t, s]];
        }
        let log_denom = log_sum_exp(&terms);
        for s in 0..n_states {
            gamma[[t, s]] = (terms[s] - log_denom).exp();
        }
    }

    gamma
}

/// Log-sum-exp trick for numerical stability
pub fn log_sum_exp(log_values: &[f64]) -> f64 {
    if log_values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max_val = log_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let sum_exp: f64 = log_values.iter().map(|&v| (v - max_val).exp()).sum();
    max_val + sum_exp.ln()
}

pub(crate) fn check_observations(observations: &Array2<f64>, n_features: usize) -> RegimeResult<()> {
    if observations.nrows() == 0 {
        return Err(RegimeError::InsufficientData { required: 1, actual: 0 });
    }
    if observations.ncols() != n_features {
        return Err(RegimeError::InvalidInput(format!(
            "observations have {} features, model expects {}",
            observations.ncols(),
            n_features
        )));
    }
    if observations.iter().any(|v| !v.is_finite()) {
        return Err(RegimeError::InvalidInput("non-finite observation".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    fn two_state_params() -> HmmParameters {
        HmmParameters::new(
            array![[-1.0, 0.0], [1.0, 0.5]],
            vec![Array2::eye(2), array![[2.0, 0.3], [0.3, 1.0]]],
            array![[0.9, 0.1], [0.2, 0.8]],
            array![0.6, 0.4],
        )
        .unwrap()
    }

    #[test]
    fn test_log_sum_exp() {
        let values = vec![-1.0, -2.0, -3.0];
        let result = log_sum_exp(&values);
        let expected = values.iter().map(|v: &f64| v.exp()).sum::<f64>().ln();
        assert!((result - expected).abs() < 1e-12);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_cholesky_reconstructs() {
        let m = array![[4.0, 2.0], [2.0, 3.0]];
        let l = cholesky(&m).unwrap();
        let rebuilt = l.dot(&l.t());
        for (a, b) in rebuilt.iter().zip(m.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!((spd_determinant(&m) - 8.0).abs() < 1e-12);
        assert!(cholesky(&array![[1.0, 2.0], [2.0, 1.0]]).is_none());
    }

    #[test]
    fn test_log_pdf_matches_closed_form() {
        let cov = array![[2.0, 0.5], [0.5, 1.0]];
        let emission = GaussianEmission::new(array![0.5, -0.5], &cov).unwrap();
        let x = array![1.0, 0.0];

        let det: f64 = 2.0 * 1.0 - 0.25;
        let inv = array![[1.0, -0.5], [-0.5, 2.0]] / det;
        let diff = array![0.5, 0.5];
        let mahal = diff.dot(&inv.dot(&diff));
        let expected = -0.5 * (2.0 * (2.0 * PI).ln() + det.ln() + mahal);

        assert!((emission.log_pdf(x.view()) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_forward_matches_enumeration() {
        let params = two_state_params();
        let obs = array![[-0.8, 0.1], [0.9, 0.4], [1.2, 0.6]];

        let emissions = params.emissions().unwrap();
        let pdf = |t: usize, s: usize| emissions[s].log_pdf(obs.row(t)).exp();

        // Sum over all 2^3 paths
        let mut total = 0.0;
        for path in 0..8usize {
            let s: Vec<usize> = (0..3).map(|t| (path >> t) & 1).collect();
            let mut p = params.initial[s[0]] * pdf(0, s[0]);
            for t in 1..3 {
                p *= params.transition[[s[t - 1], s[t]]] * pdf(t, s[t]);
            }
            total += p;
        }

        let score = params.score(&obs).unwrap();
        assert!((score - total.ln()).abs() < 1e-10);
    }

    #[test]
    fn test_posteriors_sum_to_one() {
        let params = two_state_params();
        let obs = Array::linspace(-2.0, 2.0, 20)
            .into_shape_with_order((10, 2))
            .unwrap();
        let log_b = log_emission_matrix(&obs, &params.emissions().unwrap());
        let log_trans = params.transition.mapv(f64::ln);
        let (log_alpha, _) = forward(&log_b, &params.initial.mapv(f64::ln), &log_trans);
        let log_beta = backward(&log_b, &log_trans);
        let gamma = state_posteriors(&log_alpha, &log_beta);

        for row in gamma.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_validate_rejects_bad_rows() {
        let mut params = two_state_params();
        params.transition[[0, 0]] = 0.5;
        assert!(matches!(params.validate(), Err(RegimeError::InvalidModel(_))));
    }

    #[test]
    fn test_check_finite_flags_nan() {
        let mut params = two_state_params();
        params.means[[1, 0]] = f64::NAN;
        assert!(matches!(
            params.check_finite(),
            Err(RegimeError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_permuted_reorders_everything() {
        let params = two_state_params();
        let swapped = params.permuted(&[1, 0]);

        assert_eq!(swapped.means.row(0), params.means.row(1));
        assert_eq!(swapped.covariances[0], params.covariances[1]);
        assert_eq!(swapped.transition[[0, 0]], params.transition[[1, 1]]);
        assert_eq!(swapped.transition[[0, 1]], params.transition[[1, 0]]);
        assert_eq!(swapped.initial[0], params.initial[1]);
        assert_eq!(swapped.permuted(&[1, 0]), params);
    }

    #[test]
    fn test_destandardize() {
        let params = two_state_params();
        let scaling = vec![
            FeatureScaling { mean: 0.001, std: 0.02 },
            FeatureScaling { mean: 0.1, std: 0.5 },
        ];
        let raw = params.destandardize(&scaling).unwrap();

        assert!((raw.means[[0, 0]] - (-1.0 * 0.02 + 0.001)).abs() < 1e-15);
        assert!((raw.covariances[1][[0, 1]] - 0.3 * 0.02 * 0.5).abs() < 1e-15);
        assert_eq!(raw.transition, params.transition);
    }
}
