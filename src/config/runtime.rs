use serde::{Deserialize, Serialize};

/// Engine configuration. Every section falls back to its defaults, so a
/// config file only needs the keys it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub alignment: AlignmentSettings,
    pub features: FeatureSettings,
    pub training: TrainingSettings,
    pub signal: SignalSettings,
    pub selection: SelectionSettings,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Alignment validation
        if self.alignment.min_observations < 2 {
            errors.push("alignment.min_observations must be >= 2".to_string());
        }
        if !(-1.0..=1.0).contains(&self.alignment.neutral_sentiment) {
            errors.push("alignment.neutral_sentiment must be within [-1, 1]".to_string());
        }

        // Feature validation
        if self.features.include_volatility && self.features.volatility_window < 2 {
            errors.push("features.volatility_window must be >= 2".to_string());
        }

        // Training validation
        if self.training.n_states < 2 {
            errors.push("training.n_states must be >= 2".to_string());
        }
        if self.training.n_states > self.alignment.min_observations {
            errors.push("training.n_states must not exceed alignment.min_observations".to_string());
        }
        if self.training.max_iter == 0 {
            errors.push("training.max_iter must be > 0".to_string());
        }
        if !(self.training.tol > 0.0) {
            errors.push("training.tol must be > 0".to_string());
        }
        if !(self.training.reg_covar > 0.0) {
            errors.push("training.reg_covar must be > 0".to_string());
        }
        if !(self.training.min_covar_det > 0.0) {
            errors.push("training.min_covar_det must be > 0".to_string());
        }

        // Signal validation
        if !(self.signal.threshold >= 0.0) {
            errors.push("signal.threshold must be >= 0".to_string());
        }

        // Selection validation
        if self.selection.min_states < 2 {
            errors.push("selection.min_states must be >= 2".to_string());
        }
        if self.selection.min_states > self.selection.max_states {
            errors.push("selection.min_states must be <= selection.max_states".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentSettings {
    /// Shortest aligned series accepted for fitting
    pub min_observations: usize,
    /// Sentiment used before the first known score
    pub neutral_sentiment: f64,
    /// Drop price dates outside the sentiment coverage window
    pub restrict_to_sentiment_window: bool,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            min_observations: 30,
            neutral_sentiment: 0.0,
            restrict_to_sentiment_window: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub standardize: bool,
    pub include_volatility: bool,
    pub volatility_window: usize,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            standardize: true,
            include_volatility: false,
            volatility_window: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CovarianceType {
    #[default]
    Full,
    Diagonal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub n_states: usize,
    pub covariance_type: CovarianceType,
    pub max_iter: usize,
    /// Minimum log-likelihood gain per EM iteration
    pub tol: f64,
    pub seed: u64,
    /// Ridge added to a degenerate covariance; grows tenfold per retry
    pub reg_covar: f64,
    pub max_regularization_retries: usize,
    /// Determinant below which a covariance counts as near-singular
    pub min_covar_det: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            n_states: 2,
            covariance_type: CovarianceType::Full,
            max_iter: 100,
            tol: 1e-4,
            seed: 0,
            reg_covar: 1e-6,
            max_regularization_retries: 5,
            min_covar_det: 1e-15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSettings {
    /// Expected per-period log-return beyond which a BUY/SELL is issued
    pub threshold: f64,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self { threshold: 0.001 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionSettings {
    pub min_states: usize,
    pub max_states: usize,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            min_states: 2,
            max_states: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = EngineConfig::default();
        config.training.n_states = 1;
        config.training.tol = 0.0;
        config.selection.min_states = 5;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str("[training]\nn_states = 3\n").unwrap();
        assert_eq!(config.training.n_states, 3);
        assert_eq!(config.training.max_iter, 100);
        assert_eq!(config.alignment.min_observations, 30);
        assert_eq!(config.signal.threshold, 0.001);
    }

    #[test]
    fn test_covariance_type_names() {
        let config: EngineConfig =
            toml::from_str("[training]\ncovariance_type = \"diagonal\"\n").unwrap();
        assert_eq!(config.training.covariance_type, CovarianceType::Diagonal);
    }
}
