use ndarray::Array1;
use tracing::debug;

use crate::config::SignalSettings;
use crate::error::{RegimeError, RegimeResult};
use crate::ml::hmm::{HmmParameters, RETURN_DIM};
use crate::types::{Signal, SignalLabel};

/// Turns the current regime into a BUY/SELL/HOLD call.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    threshold: f64,
}

impl SignalGenerator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn from_settings(settings: &SignalSettings) -> Self {
        Self::new(settings.threshold)
    }

    /// One-step-ahead expected return: sum_j P(current -> j) * mean_j[return].
    pub fn expected_return(&self, current_state: usize, params: &HmmParameters) -> RegimeResult<f64> {
        let n_states = params.n_states();
        if current_state >= n_states {
            return Err(RegimeError::InvalidInput(format!(
                "state {} out of range for a {}-state model",
                current_state, n_states
            )));
        }

        let expected = params
            .transition
            .row(current_state)
            .dot(&params.means.column(RETURN_DIM));

        if expected.is_finite() {
            Ok(expected)
        } else {
            Err(RegimeError::NumericalInstability(format!(
                "expected return is {}",
                expected
            )))
        }
    }

    /// `params` must be in raw return units for the threshold to apply.
    pub fn signal(
        &self,
        current_state: usize,
        params: &HmmParameters,
        posterior_at_current: &Array1<f64>,
    ) -> RegimeResult<Signal> {
        if posterior_at_current.len() != params.n_states() {
            return Err(RegimeError::InvalidInput(format!(
                "posterior has {} entries, model has {} states",
                posterior_at_current.len(),
                params.n_states()
            )));
        }

        let expected_return = self.expected_return(current_state, params)?;
        let confidence = posterior_at_current[current_state];
        if !confidence.is_finite() {
            return Err(RegimeError::NumericalInstability(format!(
                "posterior of state {} is {}",
                current_state, confidence
            )));
        }

        let label = if expected_return > self.threshold {
            SignalLabel::Buy
        } else if expected_return < -self.threshold {
            SignalLabel::Sell
        } else {
            SignalLabel::Hold
        };

        debug!(
            "State {}: expected return {:.5}, signal {}",
            current_state, expected_return, label
        );

        Ok(Signal {
            label,
            expected_return,
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}
