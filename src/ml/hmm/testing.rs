//! Seeded synthetic regime data shared by unit tests.

use chrono::{Duration, NaiveDate};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rust_decimal::Decimal;

use crate::types::{PriceSeries, SentimentSeries};

/// Ground-truth bear/bull return means
pub const TRUE_RETURN_MEANS: [f64; 2] = [-0.02, 0.02];
const TRUE_SENTIMENT_MEANS: [f64; 2] = [-0.4, 0.4];
const RETURN_SD: f64 = 0.01;
const SENTIMENT_SD: f64 = 0.1;
const PERSISTENCE: f64 = 0.95;

pub struct SyntheticRegimes {
    /// Raw (log-return, sentiment) rows
    pub observations: Array2<f64>,
    /// Generating state per row; 0 = bear, 1 = bull
    pub states: Vec<usize>,
}

/// Two-state chain with 0.95 self-persistence.
pub fn synthetic_two_state(n_obs: usize, seed: u64) -> SyntheticRegimes {
    let mut rng = StdRng::seed_from_u64(seed);
    let return_noise = Normal::new(0.0, RETURN_SD).unwrap();
    let sentiment_noise = Normal::new(0.0, SENTIMENT_SD).unwrap();

    let mut observations = Array2::zeros((n_obs, 2));
    let mut states = Vec::with_capacity(n_obs);
    let mut state = usize::from(rng.gen_bool(0.5));

    for t in 0..n_obs {
        if t > 0 && !rng.gen_bool(PERSISTENCE) {
            state = 1 - state;
        }
        states.push(state);
        observations[[t, 0]] = TRUE_RETURN_MEANS[state] + return_noise.sample(&mut rng);
        observations[[t, 1]] =
            (TRUE_SENTIMENT_MEANS[state] + sentiment_noise.sample(&mut rng)).clamp(-1.0, 1.0);
    }

    SyntheticRegimes { observations, states }
}

/// Price and sentiment series whose aligned log-returns follow
/// [`synthetic_two_state`]. Prices start one day before the first return.
pub fn synthetic_market(n_obs: usize, seed: u64) -> (PriceSeries, SentimentSeries, Vec<usize>) {
    let SyntheticRegimes { observations, states } = synthetic_two_state(n_obs, seed);
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();

    let mut prices = PriceSeries::new();
    let mut sentiment = SentimentSeries::new();
    let mut close = 100.0f64;
    prices.insert(start, Decimal::try_from(close).unwrap());
    sentiment.insert(start, 0.0);

    for (t, row) in observations.rows().into_iter().enumerate() {
        let date = start + Duration::days(t as i64 + 1);
        close *= row[0].exp();
        prices.insert(date, Decimal::try_from(close).unwrap());
        sentiment.insert(date, row[1]);
    }

    (prices, sentiment, states)
}
