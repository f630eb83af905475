use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::ml::hmm::RegimeState;
use crate::types::SignalLabel;

/// Outcome of one prediction request. Every state index is canonical
/// (0 = bear, n_states - 1 = bull).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionReport {
    pub run_id: Uuid,
    pub ticker: Option<String>,
    pub as_of: NaiveDate,

    // Regime
    pub n_states: usize,
    pub current_state: usize,
    pub current_label: RegimeState,
    pub bull_probability: f64,
    pub next_state_probabilities: Vec<f64>,
    pub transition: Vec<Vec<f64>>,
    /// Emission means in raw units (log-return, sentiment[, volatility])
    pub state_means: Vec<Vec<f64>>,
    /// Share of the decoded path spent in each state
    pub state_occupancy: Vec<f64>,

    // Signal
    pub expected_return: f64,
    pub signal: SignalLabel,
    pub confidence: f64,

    // Fit diagnostics
    pub n_observations: usize,
    pub converged: bool,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub from_cache: bool,
    pub warning: Option<String>,
}

impl fmt::Display for PredictionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Ticker: {}", self.ticker.as_deref().unwrap_or("-"))?;
        writeln!(f, "As of: {}", self.as_of)?;
        writeln!(
            f,
            "Current state: {} ({}) of {}",
            self.current_state,
            self.current_label.description(),
            self.n_states
        )?;
        writeln!(f, "Bull probability: {:.2}", self.bull_probability)?;
        writeln!(f, "Next-state probabilities: {:?}", self.next_state_probabilities)?;
        writeln!(f, "State occupancy: {:?}", self.state_occupancy)?;
        writeln!(f, "Expected next-period return: {:.4}", self.expected_return)?;
        writeln!(f, "Signal: {} (confidence {:.2})", self.signal, self.confidence)?;
        writeln!(
            f,
            "Observations: {}, iterations: {}, log-likelihood: {:.2}{}",
            self.n_observations,
            self.iterations,
            self.log_likelihood,
            if self.from_cache { " (cached model)" } else { "" }
        )?;
        if let Some(warning) = &self.warning {
            writeln!(f, "Warning: {}", warning)?;
        }
        Ok(())
    }
}
