use chrono::NaiveDate;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::FeatureSettings;
use crate::error::{RegimeError, RegimeResult};
use crate::types::AlignedSeries;

/// Column of the log-return in every observation matrix
pub const RETURN_DIM: usize = 0;
/// Column of the sentiment score
pub const SENTIMENT_DIM: usize = 1;
/// Column of the rolling volatility, when enabled
pub const VOLATILITY_DIM: usize = 2;

/// Per-column affine transform used for standardization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaling {
    pub mean: f64,
    pub std: f64,
}

impl FeatureScaling {
    pub fn apply(&self, value: f64) -> f64 {
        (value - self.mean) / self.std
    }

    pub fn invert(&self, value: f64) -> f64 {
        value * self.std + self.mean
    }
}

/// Observation matrix (n_obs x n_features) with its dates and the scaling
/// used to produce it, if any.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub observations: Array2<f64>,
    pub dates: Vec<NaiveDate>,
    pub scaling: Option<Vec<FeatureScaling>>,
}

impl FeatureMatrix {
    pub fn n_obs(&self) -> usize {
        self.observations.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.observations.ncols()
    }
}

/// Derives observation vectors (log-return, sentiment[, volatility]) from an
/// aligned series.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    settings: FeatureSettings,
}

impl FeatureBuilder {
    pub fn new(settings: FeatureSettings) -> Self {
        Self { settings }
    }

    pub fn n_features(&self) -> usize {
        if self.settings.include_volatility {
            3
        } else {
            2
        }
    }

    /// Build the observation matrix, standardizing each column when enabled.
    pub fn build(&self, series: &AlignedSeries) -> RegimeResult<FeatureMatrix> {
        let raw = self.raw_matrix(series)?;

        if !self.settings.standardize {
            return Ok(FeatureMatrix {
                observations: raw,
                dates: dates_of(series),
                scaling: None,
            });
        }

        let scaling = fit_scaling(&raw);
        let observations = apply_scaling(&raw, &scaling);
        Ok(FeatureMatrix {
            observations,
            dates: dates_of(series),
            scaling: Some(scaling),
        })
    }

    /// Build the observation matrix with a previously fitted scaling, as
    /// stored alongside a persisted model.
    pub fn build_with_scaling(
        &self,
        series: &AlignedSeries,
        scaling: &[FeatureScaling],
    ) -> RegimeResult<FeatureMatrix> {
        let raw = self.raw_matrix(series)?;
        if scaling.len() != raw.ncols() {
            return Err(RegimeError::InvalidModel(format!(
                "scaling has {} columns, observations have {}",
                scaling.len(),
                raw.ncols()
            )));
        }

        Ok(FeatureMatrix {
            observations: apply_scaling(&raw, scaling),
            dates: dates_of(series),
            scaling: Some(scaling.to_vec()),
        })
    }

    fn raw_matrix(&self, series: &AlignedSeries) -> RegimeResult<Array2<f64>> {
        let n_obs = series.records().len();
        if n_obs == 0 {
            return Err(RegimeError::InsufficientData { required: 1, actual: 0 });
        }

        let n_features = self.n_features();
        let mut data = Array2::zeros((n_obs, n_features));
        for (i, record) in series.records().iter().enumerate() {
            data[[i, RETURN_DIM]] = record.log_return;
            data[[i, SENTIMENT_DIM]] = record.sentiment;
        }

        if self.settings.include_volatility {
            let returns: Vec<f64> = series.records().iter().map(|r| r.log_return).collect();
            for (i, vol) in rolling_volatility(&returns, self.settings.volatility_window)
                .into_iter()
                .enumerate()
            {
                data[[i, VOLATILITY_DIM]] = vol;
            }
        }

        Ok(data)
    }
}

/// Rolling sample standard deviation over the trailing `window` values.
/// Windows holding a single value yield 0.0.
pub fn rolling_volatility(returns: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    (0..returns.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let slice = &returns[start..=i];
            if slice.len() < 2 {
                return 0.0;
            }
            let mean = slice.iter().sum::<f64>() / slice.len() as f64;
            let variance = slice.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / (slice.len() - 1) as f64;
            variance.sqrt()
        })
        .collect()
}

fn fit_scaling(raw: &Array2<f64>) -> Vec<FeatureScaling> {
    let n_obs = raw.nrows() as f64;
    raw.columns()
        .into_iter()
        .map(|col| {
            let mean = col.sum() / n_obs;
            let variance = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n_obs;
            let std = variance.sqrt();
            // Constant columns are only centred
            let std = if std > 0.0 && std.is_finite() { std } else { 1.0 };
            FeatureScaling { mean, std }
        })
        .collect()
}

fn apply_scaling(raw: &Array2<f64>, scaling: &[FeatureScaling]) -> Array2<f64> {
    let mut scaled = raw.clone();
    for (mut col, s) in scaled.columns_mut().into_iter().zip(scaling) {
        col.mapv_inplace(|v| s.apply(v));
    }
    scaled
}

fn dates_of(series: &AlignedSeries) -> Vec<NaiveDate> {
    series.records().iter().map(|r| r.date).collect()
}
