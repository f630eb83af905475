use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::results::PredictionReport;
use super::signal::SignalGenerator;
use crate::config::EngineConfig;
use crate::error::{RegimeError, RegimeResult, NON_CONVERGENCE_REASON};
use crate::ml::alignment::Aligner;
use crate::ml::hmm::{
    canonicalize, decode, FeatureBuilder, FeatureMatrix, FitOutcome, HmmParameters, RegimeState,
    Trainer,
};
use crate::ml::persistence::{ModelSnapshot, ParamsRecord, SNAPSHOT_VERSION};
use crate::sources::{PriceSource, SentimentSource};
use crate::types::{AlignedSeries, ObservationWindow, PriceSeries, SentimentSeries};

/// Everything one request produced.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub report: PredictionReport,
    /// Canonical fitted model, reusable while the window is unchanged
    pub snapshot: ModelSnapshot,
}

/// Aligner -> FeatureBuilder -> Trainer -> Interpreter -> Decoder -> SignalGenerator.
///
/// Holds configuration only; each call works on its own values, so one
/// pipeline can serve concurrent requests.
#[derive(Debug, Clone)]
pub struct RegimePipeline {
    config: EngineConfig,
}

impl RegimePipeline {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fetch both inputs concurrently, then run the pipeline.
    pub async fn run_from_sources(
        &self,
        ticker: Option<&str>,
        prices: &dyn PriceSource,
        sentiment: &dyn SentimentSource,
        cached: Option<&ModelSnapshot>,
    ) -> anyhow::Result<PipelineRun> {
        let (prices, sentiment) = tokio::try_join!(prices.daily_closes(), sentiment.daily_sentiment())?;
        Ok(self.run(ticker, &prices, &sentiment, cached)?)
    }

    pub fn run(
        &self,
        ticker: Option<&str>,
        prices: &PriceSeries,
        sentiment: &SentimentSeries,
        cached: Option<&ModelSnapshot>,
    ) -> RegimeResult<PipelineRun> {
        let aligned = Aligner::new(self.config.alignment.clone()).align(prices, sentiment)?;
        let window = aligned.window().ok_or(RegimeError::InsufficientData {
            required: self.config.alignment.min_observations.max(1),
            actual: 0,
        })?;
        info!(
            "Aligned {} observations ({} to {})",
            window.count, window.first, window.last
        );

        let builder = FeatureBuilder::new(self.config.features.clone());
        let reusable = cached.filter(|snapshot| self.can_reuse(snapshot, &builder, &window, ticker));

        let (features, snapshot, from_cache) = match reusable {
            Some(snapshot) => {
                info!("Reusing cached {}-state model", snapshot.params.k);
                let features = match &snapshot.scaling {
                    Some(scaling) => builder.build_with_scaling(&aligned, scaling)?,
                    None => builder.build(&aligned)?,
                };
                (features, snapshot.clone(), true)
            }
            None => {
                if cached.is_some() {
                    debug!("Cached model does not match the current window, refitting");
                }
                let (features, snapshot) = self.fit(&aligned, ticker)?;
                (features, snapshot, false)
            }
        };

        let params = snapshot.params()?;
        let path = decode(&features.observations, &params)?;
        debug!("Decoded path log-likelihood {:.3}", path.log_likelihood());
        let last = path.last().ok_or(RegimeError::InsufficientData { required: 1, actual: 0 })?;

        let raw_params = match &features.scaling {
            Some(scaling) => params.destandardize(scaling)?,
            None => params.clone(),
        };
        raw_params.check_finite()?;

        let generator = SignalGenerator::from_settings(&self.config.signal);
        let signal = generator.signal(last.state, &raw_params, &last.posterior)?;

        let n_states = params.n_states();
        let report = PredictionReport {
            run_id: Uuid::new_v4(),
            ticker: ticker.map(str::to_string),
            as_of: window.last,
            n_states,
            current_state: last.state,
            current_label: RegimeState::from_canonical(last.state, n_states),
            bull_probability: last.posterior[n_states - 1],
            next_state_probabilities: params.transition.row(last.state).to_vec(),
            transition: ParamsRecord::from(&params).transition,
            state_means: ParamsRecord::from(&raw_params).means,
            state_occupancy: path.occupancy(n_states),
            expected_return: signal.expected_return,
            signal: signal.label,
            confidence: signal.confidence,
            n_observations: window.count,
            converged: snapshot.converged,
            iterations: snapshot.iterations,
            log_likelihood: snapshot.log_likelihood,
            from_cache,
            warning: (!snapshot.converged).then(|| NON_CONVERGENCE_REASON.to_string()),
        };

        info!(
            "Regime {} ({}), signal {} expected return {:.5} confidence {:.2}",
            report.current_state,
            report.current_label.as_str(),
            report.signal,
            report.expected_return,
            report.confidence
        );

        Ok(PipelineRun { report, snapshot })
    }

    fn fit(&self, aligned: &AlignedSeries, ticker: Option<&str>) -> RegimeResult<(FeatureMatrix, ModelSnapshot)> {
        let features = FeatureBuilder::new(self.config.features.clone()).build(aligned)?;
        let training = &self.config.training;

        info!(
            "Fitting {}-state Gaussian HMM on {} x {} observations",
            training.n_states,
            features.n_obs(),
            features.n_features()
        );
        let outcome = Trainer::new(training.clone()).fit(&features.observations)?;
        if !outcome.converged {
            warn!("{} after {} iterations", NON_CONVERGENCE_REASON, outcome.iterations);
        }

        let (params, labels) = canonicalize(&outcome.params);
        if !labels.is_identity() {
            let order: Vec<usize> = (0..params.n_states()).filter_map(|c| labels.fitted(c)).collect();
            debug!("Relabeled fitted states {:?} to canonical order", order);
        }

        let snapshot = self.snapshot(ticker, aligned, &features, &params, &outcome)?;
        Ok((features, snapshot))
    }

    fn snapshot(
        &self,
        ticker: Option<&str>,
        aligned: &AlignedSeries,
        features: &FeatureMatrix,
        params: &HmmParameters,
        outcome: &FitOutcome,
    ) -> RegimeResult<ModelSnapshot> {
        let window = aligned.window().ok_or(RegimeError::InsufficientData { required: 1, actual: 0 })?;
        Ok(ModelSnapshot {
            version: SNAPSHOT_VERSION,
            trained_at: Utc::now(),
            ticker: ticker.map(str::to_string),
            window,
            covariance_type: self.config.training.covariance_type,
            converged: outcome.converged,
            iterations: outcome.iterations,
            log_likelihood: outcome.log_likelihood,
            scaling: features.scaling.clone(),
            volatility_window: self.volatility_window(),
            params: ParamsRecord::from(params),
        })
    }

    fn can_reuse(
        &self,
        snapshot: &ModelSnapshot,
        builder: &FeatureBuilder,
        window: &ObservationWindow,
        ticker: Option<&str>,
    ) -> bool {
        snapshot.is_valid_for(window, ticker)
            && snapshot.scaling.is_some() == self.config.features.standardize
            && snapshot.params.d == builder.n_features()
            && snapshot.params.k == self.config.training.n_states
            && snapshot.covariance_type == self.config.training.covariance_type
            && snapshot.volatility_window == self.volatility_window()
    }

    fn volatility_window(&self) -> Option<usize> {
        self.config
            .features
            .include_volatility
            .then_some(self.config.features.volatility_window)
    }
}
