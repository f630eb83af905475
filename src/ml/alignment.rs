use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::AlignmentSettings;
use crate::error::{RegimeError, RegimeResult};
use crate::types::{AlignedSeries, ObservationRecord, PriceSeries, SentimentSeries};

/// Merges a price series and a sentiment series into one per-date
/// observation sequence.
#[derive(Debug, Clone)]
pub struct Aligner {
    settings: AlignmentSettings,
}

impl Aligner {
    pub fn new(settings: AlignmentSettings) -> Self {
        Self { settings }
    }

    /// Align closes with sentiment.
    ///
    /// Each price date takes the latest sentiment known on or before it
    /// (carry-forward), or the neutral default when nothing is known yet.
    /// The first retained price date only anchors the first return and is
    /// dropped from the output.
    pub fn align(
        &self,
        prices: &PriceSeries,
        sentiment: &SentimentSeries,
    ) -> RegimeResult<AlignedSeries> {
        validate_sentiment(sentiment)?;

        let window = if self.settings.restrict_to_sentiment_window {
            match (sentiment.keys().next(), sentiment.keys().next_back()) {
                (Some(&first), Some(&last)) => Some((first, last)),
                _ => None,
            }
        } else {
            None
        };

        let mut records = Vec::with_capacity(prices.len());
        let mut prev_close: Option<f64> = None;

        for (&date, &close) in prices {
            if let Some((first, last)) = window {
                if date < first || date > last {
                    continue;
                }
            }

            let close = price_to_f64(date, close)?;

            if let Some(prev) = prev_close {
                let score = sentiment
                    .range(..=date)
                    .next_back()
                    .map(|(_, &s)| s)
                    .unwrap_or(self.settings.neutral_sentiment);

                records.push(ObservationRecord {
                    date,
                    log_return: (close / prev).ln(),
                    sentiment: score,
                });
            }
            prev_close = Some(close);
        }

        debug!(
            "Aligned {} observations from {} prices and {} sentiment scores",
            records.len(),
            prices.len(),
            sentiment.len()
        );

        AlignedSeries::new(records, self.settings.min_observations)
    }
}

fn price_to_f64(date: NaiveDate, close: Decimal) -> RegimeResult<f64> {
    let value: f64 = close
        .try_into()
        .map_err(|_| RegimeError::InvalidInput(format!("unrepresentable close on {}", date)))?;

    if !value.is_finite() || value <= 0.0 {
        return Err(RegimeError::InvalidInput(format!(
            "close on {} must be positive, got {}",
            date, close
        )));
    }

    Ok(value)
}

fn validate_sentiment(sentiment: &SentimentSeries) -> RegimeResult<()> {
    for (date, &score) in sentiment {
        if !score.is_finite() || !(-1.0..=1.0).contains(&score) {
            return Err(RegimeError::InvalidInput(format!(
                "sentiment on {} must be within [-1, 1], got {}",
                date, score
            )));
        }
    }
    Ok(())
}
