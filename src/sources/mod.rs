pub mod csv_files;

pub use csv_files::{CsvPriceFile, CsvSentimentFile};

use async_trait::async_trait;

use crate::types::{PriceSeries, SentimentSeries};

/// Provider of daily closing prices.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn daily_closes(&self) -> anyhow::Result<PriceSeries>;
}

/// Provider of daily sentiment scores in [-1, 1].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SentimentSource: Send + Sync {
    async fn daily_sentiment(&self) -> anyhow::Result<SentimentSeries>;
}
