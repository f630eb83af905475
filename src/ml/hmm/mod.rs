pub mod decoder;
pub mod features;
pub mod gaussian_hmm;
pub mod interpreter;
pub mod selection;
pub mod trainer;

#[cfg(test)]
pub(crate) mod testing;

pub use decoder::decode;
pub use features::{FeatureBuilder, FeatureMatrix, FeatureScaling, RETURN_DIM};
pub use gaussian_hmm::HmmParameters;
pub use interpreter::canonicalize;
pub use selection::select_state_count;
pub use trainer::{FitOutcome, Trainer};

use serde::{Deserialize, Serialize};

/// Market regime of a canonical state index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeState {
    Bear,
    Neutral,
    Bull,
}

impl RegimeState {
    /// Index 0 is bear, index `n_states - 1` is bull, anything between is
    /// neutral/transitional.
    pub fn from_canonical(index: usize, n_states: usize) -> Self {
        if index == 0 {
            RegimeState::Bear
        } else if index + 1 >= n_states {
            RegimeState::Bull
        } else {
            RegimeState::Neutral
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RegimeState::Bull => "Bull",
            RegimeState::Bear => "Bear",
            RegimeState::Neutral => "Neutral",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            RegimeState::Bull => "bull",
            RegimeState::Bear => "bear",
            RegimeState::Neutral => "neutral/transitional",
        }
    }
}
