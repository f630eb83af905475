use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{RegimeError, RegimeResult};

/// Daily closing prices keyed by trading date.
pub type PriceSeries = BTreeMap<NaiveDate, Decimal>;

/// Daily sentiment scores in [-1, 1] keyed by date.
pub type SentimentSeries = BTreeMap<NaiveDate, f64>;

/// One aligned trading day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub date: NaiveDate,
    pub log_return: f64,
    pub sentiment: f64,
}

/// Span of dates covered by an aligned series; used to key cached models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationWindow {
    pub first: NaiveDate,
    pub last: NaiveDate,
    pub count: usize,
}

/// Date-ordered observations, one per trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedSeries {
    records: Vec<ObservationRecord>,
}

impl AlignedSeries {
    /// Build a series, enforcing strictly increasing dates, finite values and
    /// a minimum length.
    pub fn new(records: Vec<ObservationRecord>, min_len: usize) -> RegimeResult<Self> {
        if records.len() < min_len {
            return Err(RegimeError::InsufficientData {
                required: min_len,
                actual: records.len(),
            });
        }

        for pair in records.windows(2) {
            if pair[1].date <= pair[0].date {
                return Err(RegimeError::InvalidInput(format!(
                    "dates must be strictly increasing ({} follows {})",
                    pair[1].date, pair[0].date
                )));
            }
        }

        if let Some(bad) = records
            .iter()
            .find(|r| !r.log_return.is_finite() || !r.sentiment.is_finite())
        {
            return Err(RegimeError::InvalidInput(format!(
                "non-finite observation on {}",
                bad.date
            )));
        }

        Ok(Self { records })
    }

    pub fn records(&self) -> &[ObservationRecord] {
        &self.records
    }

    pub fn window(&self) -> Option<ObservationWindow> {
        let first = self.records.first()?;
        let last = self.records.last()?;
        Some(ObservationWindow {
            first: first.date,
            last: last.date,
            count: self.records.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(day: u32, log_return: f64) -> ObservationRecord {
        ObservationRecord {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            log_return,
            sentiment: 0.0,
        }
    }

    #[test]
    fn test_rejects_duplicate_dates() {
        let records = vec![record(2, 0.01), record(2, 0.02)];
        assert!(matches!(
            AlignedSeries::new(records, 1),
            Err(RegimeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_short_series() {
        let records = vec![record(2, 0.01), record(3, 0.02)];
        assert_eq!(
            AlignedSeries::new(records, 3),
            Err(RegimeError::InsufficientData { required: 3, actual: 2 })
        );
    }

    #[test]
    fn test_window() {
        let series = AlignedSeries::new(vec![record(2, 0.01), record(5, -0.01)], 2).unwrap();
        let window = series.window().unwrap();
        assert_eq!(window.first, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(window.last, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(window.count, 2);
    }
}
