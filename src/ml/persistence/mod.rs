use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::config::CovarianceType;
use crate::error::{RegimeError, RegimeResult};
use crate::ml::hmm::{FeatureScaling, HmmParameters};
use crate::types::ObservationWindow;

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Fixed-shape record of HMM parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamsRecord {
    pub k: usize,
    pub d: usize,
    pub means: Vec<Vec<f64>>,
    pub covariances: Vec<Vec<Vec<f64>>>,
    pub transition: Vec<Vec<f64>>,
    pub initial: Vec<f64>,
}

impl From<&HmmParameters> for ParamsRecord {
    fn from(params: &HmmParameters) -> Self {
        Self {
            k: params.n_states(),
            d: params.n_features(),
            means: rows_of(&params.means),
            covariances: params.covariances.iter().map(rows_of).collect(),
            transition: rows_of(&params.transition),
            initial: params.initial.to_vec(),
        }
    }
}

impl TryFrom<&ParamsRecord> for HmmParameters {
    type Error = RegimeError;

    fn try_from(record: &ParamsRecord) -> RegimeResult<Self> {
        let (k, d) = (record.k, record.d);
        if record.initial.len() != k || record.covariances.len() != k {
            return Err(RegimeError::InvalidModel(format!(
                "record declares {} states but stores {} initial probabilities and {} covariances",
                k,
                record.initial.len(),
                record.covariances.len()
            )));
        }

        let means = matrix_from_rows(&record.means, k, d, "means")?;
        let transition = matrix_from_rows(&record.transition, k, k, "transition")?;
        let covariances = record
            .covariances
            .iter()
            .map(|rows| matrix_from_rows(rows, d, d, "covariance"))
            .collect::<RegimeResult<Vec<_>>>()?;

        HmmParameters::new(means, covariances, transition, Array1::from_vec(record.initial.clone()))
    }
}

/// Fitted model persisted for reuse across requests over the same window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: u32,
    pub trained_at: DateTime<Utc>,
    pub ticker: Option<String>,
    pub window: ObservationWindow,
    pub covariance_type: CovarianceType,
    pub converged: bool,
    pub iterations: usize,
    pub log_likelihood: f64,
    /// Scaling applied to observations before fitting, if standardized
    pub scaling: Option<Vec<FeatureScaling>>,
    /// Rolling window of the volatility column, when it was fitted with one
    #[serde(default)]
    pub volatility_window: Option<usize>,
    /// Canonicalized parameters in the fitted (possibly standardized) units
    pub params: ParamsRecord,
}

impl ModelSnapshot {
    pub fn params(&self) -> RegimeResult<HmmParameters> {
        HmmParameters::try_from(&self.params)
    }

    /// A snapshot only applies to the exact window (and ticker) it was fitted on.
    pub fn is_valid_for(&self, window: &ObservationWindow, ticker: Option<&str>) -> bool {
        self.version == SNAPSHOT_VERSION
            && self.window == *window
            && self.ticker.as_deref() == ticker
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Unsupported snapshot version {} (expected {})",
                snapshot.version,
                SNAPSHOT_VERSION
            ));
        }
        // Reject malformed parameters at load time
        snapshot.params()?;
        if let Some(scaling) = &snapshot.scaling {
            if scaling.len() != snapshot.params.d {
                return Err(anyhow!(
                    "Scaling has {} columns, model has {} features",
                    scaling.len(),
                    snapshot.params.d
                ));
            }
        }
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)?;
        info!(
            "Saved {}-state model ({} observations) to {}",
            self.params.k,
            self.window.count,
            path.display()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read model file {}: {}", path.display(), e))?;
        let snapshot = Self::from_json(&json)?;
        info!("Loaded {}-state model from {}", snapshot.params.k, path.display());
        Ok(snapshot)
    }
}

fn rows_of(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|r| r.to_vec()).collect()
}

fn matrix_from_rows(rows: &[Vec<f64>], n_rows: usize, n_cols: usize, what: &str) -> RegimeResult<Array2<f64>> {
    if rows.len() != n_rows || rows.iter().any(|r| r.len() != n_cols) {
        return Err(RegimeError::InvalidModel(format!(
            "{} must be {}x{}",
            what, n_rows, n_cols
        )));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat)
        .map_err(|e| RegimeError::InvalidModel(format!("{}: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingSettings;
    use crate::engine::signal::SignalGenerator;
    use crate::ml::hmm::testing::{synthetic_two_state, SyntheticRegimes};
    use crate::ml::hmm::{canonicalize, decode, Trainer};
    use chrono::NaiveDate;

    fn window() -> ObservationWindow {
        ObservationWindow {
            first: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            last: NaiveDate::from_ymd_opt(2024, 6, 28).unwrap(),
            count: 120,
        }
    }

    fn snapshot(params: &HmmParameters) -> ModelSnapshot {
        ModelSnapshot {
            version: SNAPSHOT_VERSION,
            trained_at: Utc::now(),
            ticker: Some("AAPL".to_string()),
            window: window(),
            covariance_type: CovarianceType::Full,
            converged: true,
            iterations: 12,
            log_likelihood: -10.0,
            scaling: None,
            volatility_window: None,
            params: ParamsRecord::from(params),
        }
    }

    #[test]
    fn test_round_trip_preserves_decoding_and_signal() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(300, 17);
        let outcome = Trainer::new(TrainingSettings::default()).fit(&observations).unwrap();
        let (params, _) = canonicalize(&outcome.params);

        let json = snapshot(&params).to_json().unwrap();
        let restored = ModelSnapshot::from_json(&json).unwrap().params().unwrap();

        let original_path = decode(&observations, &params).unwrap();
        let restored_path = decode(&observations, &restored).unwrap();
        assert_eq!(original_path.states(), restored_path.states());
        for (a, b) in original_path.steps().iter().zip(restored_path.steps()) {
            for (x, y) in a.posterior.iter().zip(b.posterior.iter()) {
                assert!((x - y).abs() < 1e-9);
            }
        }

        let generator = SignalGenerator::new(0.001);
        let last = original_path.last().unwrap();
        let s1 = generator.signal(last.state, &params, &last.posterior).unwrap();
        let s2 = generator.signal(last.state, &restored, &restored_path.last().unwrap().posterior).unwrap();
        assert_eq!(s1.label, s2.label);
        assert!((s1.expected_return - s2.expected_return).abs() < 1e-12);
        assert!((s1.confidence - s2.confidence).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_malformed_record() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(100, 2);
        let outcome = Trainer::new(TrainingSettings::default()).fit(&observations).unwrap();
        let mut snap = snapshot(&outcome.params);
        snap.params.transition[0] = vec![0.7, 0.7];

        let json = serde_json::to_string(&snap).unwrap();
        assert!(ModelSnapshot::from_json(&json).is_err());

        snap.params.transition.pop();
        assert!(matches!(
            HmmParameters::try_from(&snap.params),
            Err(RegimeError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_window_invalidation() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(100, 4);
        let outcome = Trainer::new(TrainingSettings::default()).fit(&observations).unwrap();
        let snap = snapshot(&outcome.params);

        assert!(snap.is_valid_for(&window(), Some("AAPL")));
        assert!(!snap.is_valid_for(&window(), Some("MSFT")));

        let mut moved = window();
        moved.last = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        moved.count += 1;
        assert!(!snap.is_valid_for(&moved, Some("AAPL")));
    }

    #[test]
    fn test_save_and_load() {
        let SyntheticRegimes { observations, .. } = synthetic_two_state(100, 8);
        let outcome = Trainer::new(TrainingSettings::default()).fit(&observations).unwrap();
        let snap = snapshot(&outcome.params);

        let path = std::env::temp_dir().join(format!("regime-model-{}.json", uuid::Uuid::new_v4()));
        snap.save(&path).unwrap();
        let loaded = ModelSnapshot::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.window, snap.window);
        assert_eq!(loaded.params.k, 2);
        assert_eq!(loaded.ticker.as_deref(), Some("AAPL"));
    }
}
