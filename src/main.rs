mod config;
mod engine;
mod error;
mod ml;
mod sources;
mod types;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{load_config, render_config, EngineConfig};
use engine::RegimePipeline;
use ml::alignment::Aligner;
use ml::hmm::{select_state_count, FeatureBuilder};
use ml::persistence::ModelSnapshot;
use sources::{CsvPriceFile, CsvSentimentFile, PriceSource, SentimentSource};

#[derive(Parser)]
#[command(name = "sentiment-regime")]
#[command(version = "0.1.0")]
#[command(about = "Market regime inference from price returns and news sentiment", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "regime.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a regime model and emit a trading signal for the latest date
    Predict {
        /// CSV of daily closes (date,close)
        #[arg(short, long)]
        prices: PathBuf,
        /// CSV of daily sentiment scores (date,sentiment)
        #[arg(short, long)]
        sentiment: PathBuf,
        /// Override the number of hidden states
        #[arg(long)]
        states: Option<usize>,
        /// Ticker recorded in the report and the model cache
        #[arg(short, long)]
        ticker: Option<String>,
        /// Model JSON reused while the window is unchanged
        #[arg(long)]
        model_cache: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Choose the number of hidden states by BIC
    SelectStates {
        #[arg(short, long)]
        prices: PathBuf,
        #[arg(short, long)]
        sentiment: PathBuf,
        #[arg(long)]
        min_states: Option<usize>,
        #[arg(long)]
        max_states: Option<usize>,
    },
    /// Write the default configuration to the config path
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Predict { prices, sentiment, states, ticker, model_cache, json } => {
            let mut engine = load_config(&cli.config)?;
            if let Some(n_states) = states {
                engine.training.n_states = n_states;
                engine
                    .validate()
                    .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join(", ")))?;
            }
            predict(engine, &prices, &sentiment, ticker.as_deref(), model_cache.as_deref(), json).await?;
        }
        Commands::SelectStates { prices, sentiment, min_states, max_states } => {
            let mut engine = load_config(&cli.config)?;
            if let Some(min) = min_states {
                engine.selection.min_states = min;
            }
            if let Some(max) = max_states {
                engine.selection.max_states = max;
            }
            engine
                .validate()
                .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join(", ")))?;
            select_states(engine, &prices, &sentiment).await?;
        }
        Commands::InitConfig { force } => {
            init_config(&cli.config, force)?;
        }
    }

    Ok(())
}

async fn predict(
    engine: EngineConfig,
    prices_path: &Path,
    sentiment_path: &Path,
    ticker: Option<&str>,
    cache_path: Option<&Path>,
    json: bool,
) -> Result<()> {
    info!("━━━ Step 1: Loading inputs ━━━");
    let prices = CsvPriceFile::new(prices_path);
    let sentiment = CsvSentimentFile::new(sentiment_path);

    let cached = match cache_path {
        Some(path) if path.exists() => match ModelSnapshot::load(path) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Ignoring unreadable model cache {}: {}", path.display(), e);
                None
            }
        },
        _ => None,
    };

    info!("━━━ Step 2: Fitting and decoding ━━━");
    let pipeline = RegimePipeline::new(engine);
    let run = pipeline
        .run_from_sources(ticker, &prices, &sentiment, cached.as_ref())
        .await
        .map_err(with_reason)?;

    if let Some(path) = cache_path {
        if !run.report.from_cache {
            run.snapshot.save(path)?;
        }
    }

    info!("━━━ Step 3: Report ━━━");
    if json {
        println!("{}", serde_json::to_string_pretty(&run.report)?);
    } else {
        print!("{}", run.report);
    }

    Ok(())
}

async fn select_states(engine: EngineConfig, prices_path: &Path, sentiment_path: &Path) -> Result<()> {
    info!("━━━ Step 1: Loading inputs ━━━");
    let price_file = CsvPriceFile::new(prices_path);
    let sentiment_file = CsvSentimentFile::new(sentiment_path);
    let (prices, sentiment) = tokio::try_join!(price_file.daily_closes(), sentiment_file.daily_sentiment())
        .map_err(with_reason)?;

    let aligned = Aligner::new(engine.alignment.clone())
        .align(&prices, &sentiment)
        .map_err(|e| with_reason(e.into()))?;
    let features = FeatureBuilder::new(engine.features.clone())
        .build(&aligned)
        .map_err(|e| with_reason(e.into()))?;
    info!("✓ {} observations with {} features", features.n_obs(), features.n_features());

    info!(
        "━━━ Step 2: Fitting {} to {} states ━━━",
        engine.selection.min_states, engine.selection.max_states
    );
    let candidates: Vec<usize> = (engine.selection.min_states..=engine.selection.max_states).collect();
    let outcome = select_state_count(Arc::new(features.observations), candidates, engine.training.clone())
        .await
        .map_err(|e| with_reason(e.into()))?;

    println!("{:>6} {:>16} {:>16} {:>10}", "states", "log-likelihood", "BIC", "converged");
    for score in &outcome.scores {
        println!(
            "{:>6} {:>16.3} {:>16.3} {:>10}",
            score.n_states, score.log_likelihood, score.bic, score.converged
        );
    }
    println!("Selected {} states", outcome.n_states);

    Ok(())
}

/// Prefix engine failures with their caller-facing reason.
fn with_reason(err: anyhow::Error) -> anyhow::Error {
    match err.downcast_ref::<error::RegimeError>() {
        Some(regime) => anyhow!("{}: {}", regime.reason(), regime),
        None => err,
    }
}

fn init_config(path: &str, force: bool) -> Result<()> {
    if Path::new(path).exists() && !force {
        return Err(anyhow!("{} already exists (use --force to overwrite)", path));
    }
    std::fs::write(path, render_config(&EngineConfig::default())?)?;
    info!("✓ Wrote default configuration to {}", path);
    Ok(())
}
