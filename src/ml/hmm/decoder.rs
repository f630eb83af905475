use ndarray::{Array1, Array2};

use super::gaussian_hmm::{
    backward, check_observations, forward, log_emission_matrix, state_posteriors, HmmParameters,
};
use crate::error::{RegimeError, RegimeResult};

/// One decoded timestep: the Viterbi state and the forward-backward
/// posterior over all states.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedStep {
    pub state: usize,
    pub posterior: Array1<f64>,
}

/// Decoded state sequence, one step per observation.
#[derive(Debug, Clone, PartialEq)]
pub struct StatePath {
    steps: Vec<DecodedStep>,
    log_likelihood: f64,
}

impl StatePath {
    pub(crate) fn from_parts(steps: Vec<DecodedStep>, log_likelihood: f64) -> Self {
        Self { steps, log_likelihood }
    }

    pub fn steps(&self) -> &[DecodedStep] {
        &self.steps
    }

    pub fn states(&self) -> Vec<usize> {
        self.steps.iter().map(|s| s.state).collect()
    }

    pub fn last(&self) -> Option<&DecodedStep> {
        self.steps.last()
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Fraction of timesteps spent in each state along the hard path
    pub fn occupancy(&self, n_states: usize) -> Vec<f64> {
        let mut counts = vec![0usize; n_states];
        for step in &self.steps {
            if step.state < n_states {
                counts[step.state] += 1;
            }
        }
        let total = self.steps.len().max(1) as f64;
        counts.into_iter().map(|c| c as f64 / total).collect()
    }
}

/// Most likely state path (Viterbi) together with per-step posteriors.
pub fn decode(observations: &Array2<f64>, params: &HmmParameters) -> RegimeResult<StatePath> {
    check_observations(observations, params.n_features())?;

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
    let gamma = state_posteriors(&log_alpha, &log_beta);
    if gamma.iter().any(|p| !p.is_finite()) {
        return Err(RegimeError::NumericalInstability(
            "non-finite state posterior".to_string(),
        ));
    }

    let states = viterbi(&log_b, &log_start, &log_trans);

    let steps = states
        .into_iter()
        .zip(gamma.rows())
        .map(|(state, posterior)| DecodedStep {
            state,
            posterior: posterior.to_owned(),
        })
        .collect();

    Ok(StatePath::from_parts(steps, log_prob))
}

/// Viterbi decoding in log space. Ties resolve to the lowest state index.
pub fn viterbi(log_b: &Array2<f64>, log_start: &Array1<f64>, log_trans: &Array2<f64>) -> Vec<usize> {
    let (n_obs, n_states) = log_b.dim();
    if n_obs == 0 {
        return Vec::new();
    }

    let mut log_delta = Array2::from_elem((n_obs, n_states), f64::NEG_INFINITY);
    let mut psi = Array2::<usize>::zeros((n_obs, n_states));

    // Initialization
    for state in 0..n_states {
        log_delta[[0, state]] = log_start[state] + log_b[[0, state]];
    }

    // Recursion
    for t in 1..n_obs {
        for j in 0..n_states {
            let mut max_val = f64::NEG_INFINITY;
            let mut max_state = 0;

            for i in 0..n_states {
                let val = log_delta[[t - 1, i]] + log_trans[[i, j]];
                if val > max_val {
                    max_val = val;
                    max_state = i;
                }
            }

            log_delta[[t, j]] = max_val + log_b[[t, j]];
            psi[[t, j]] = max_state;
        }
    }

    // Backtracking
    let mut states = vec![0; n_obs];
    let mut max_val = f64::NEG_INFINITY;
    for state in 0..n_states {
        if log_delta[[n_obs - 1, state]] > max_val {
            max_val = log_delta[[n_obs - 1, state]];
            states[n_obs - 1] = state;
        }
    }

    for t in (0..n_obs - 1).rev() {
        states[t] = psi[[t + 1, states[t + 1]]];
    }

    states
}
