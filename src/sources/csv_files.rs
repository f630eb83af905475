use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{PriceSource, SentimentSource};
use crate::error::RegimeError;
use crate::types::{PriceSeries, SentimentSeries};

#[derive(Debug, Deserialize)]
struct PriceRow {
    date: NaiveDate,
    close: Decimal,
}

#[derive(Debug, Deserialize)]
struct SentimentRow {
    date: NaiveDate,
    sentiment: f64,
}

/// CSV file with `date,close` columns.
#[derive(Debug, Clone)]
pub struct CsvPriceFile {
    path: PathBuf,
}

impl CsvPriceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PriceSource for CsvPriceFile {
    async fn daily_closes(&self) -> Result<PriceSeries> {
        let bytes = read_file(&self.path).await?;
        let rows = parse_rows::<PriceRow>(&bytes, &self.path)?;
        if let Some(row) = rows.iter().find(|r| r.close <= Decimal::ZERO) {
            return Err(RegimeError::InvalidInput(format!(
                "{}: close on {} must be positive, got {}",
                self.path.display(),
                row.date,
                row.close
            ))
            .into());
        }
        let series = collect_unique(rows.into_iter().map(|r| (r.date, r.close)), &self.path)?;
        debug!("Read {} closes from {}", series.len(), self.path.display());
        Ok(series)
    }
}

/// CSV file with `date,sentiment` columns.
#[derive(Debug, Clone)]
pub struct CsvSentimentFile {
    path: PathBuf,
}

impl CsvSentimentFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SentimentSource for CsvSentimentFile {
    async fn daily_sentiment(&self) -> Result<SentimentSeries> {
        let bytes = read_file(&self.path).await?;
        let rows = parse_rows::<SentimentRow>(&bytes, &self.path)?;
        if let Some(row) = rows
            .iter()
            .find(|r| !r.sentiment.is_finite() || !(-1.0..=1.0).contains(&r.sentiment))
        {
            return Err(RegimeError::InvalidInput(format!(
                "{}: sentiment on {} must be within [-1, 1], got {}",
                self.path.display(),
                row.date,
                row.sentiment
            ))
            .into());
        }
        let series = collect_unique(rows.into_iter().map(|r| (r.date, r.sentiment)), &self.path)?;
        debug!("Read {} sentiment scores from {}", series.len(), self.path.display());
        Ok(series)
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn parse_rows<T: for<'de> Deserialize<'de>>(bytes: &[u8], path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);

    reader
        .deserialize()
        .enumerate()
        .map(|(i, row)| {
            row.with_context(|| format!("{}: malformed row {}", path.display(), i + 2))
        })
        .collect()
}

fn collect_unique<V>(rows: impl Iterator<Item = (NaiveDate, V)>, path: &Path) -> Result<BTreeMap<NaiveDate, V>> {
    let mut series = BTreeMap::new();
    for (date, value) in rows {
        if series.insert(date, value).is_some() {
            return Err(anyhow!("{}: duplicate date {}", path.display(), date));
        }
    }
    Ok(series)
}
