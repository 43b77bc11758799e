use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

mod config;
mod db;
mod error;
mod feeds;
mod model;
mod pipeline;

use config::Config;
use db::Database;
use feeds::{FixtureFeed, FotMobClient, OddsApiClient, PriceFeed, ResultFeed};
use pipeline::{Pipeline, RunOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    let fotmob = Arc::new(FotMobClient::new(&config.fotmob_api_url)?);
    let odds = Arc::new(OddsApiClient::new(
        &config.odds_api_url,
        config.odds_api_key.clone(),
    )?);
    if !odds.is_configured() {
        warn!("No ODDS_API_KEY configured; the run will predict but place no wagers");
    }

    let results: Arc<dyn ResultFeed> = fotmob.clone();
    let fixtures: Arc<dyn FixtureFeed> = fotmob;
    let prices: Arc<dyn PriceFeed> = odds;
    let pipeline = Pipeline::new(config.clone(), db, results, fixtures, prices);

    let now = Utc::now();

    // Standalone commands exit early.
    if config.seed {
        info!("Seeding match history from {} ...", config.fotmob_api_url);
        let (inserted, duplicates) = pipeline.seed().await?;
        info!("Seed complete: {inserted} new matches, {duplicates} already known");
        return Ok(());
    }

    if config.calibrate {
        match pipeline.calibration_report()? {
            Some(report) => println!("{report}"),
            None => println!("No resolved predictions yet. Run the pipeline for a few days first."),
        }
        return Ok(());
    }

    if config.reset {
        pipeline.reset()?;
        info!("Experiment reset to EUR {:.2}", config.initial_bankroll);
        return Ok(());
    }

    if config.fit {
        pipeline.refit(now.date_naive(), now).await?;
        return Ok(());
    }

    // The daily run.
    let opts = RunOptions::from_config(&config, now);
    if opts.dry_run {
        info!("DRY RUN - recommendations will be shown but nothing persisted");
    }
    let summary = pipeline.run_day(&opts).await?;

    if summary.skipped {
        info!("Nothing to do. Use --force to re-run today.");
    } else {
        info!(
            "Day complete: {} resolved, {} predictions, {} wagers (EUR {:.2} staked), bankroll EUR {:.2}",
            summary.resolved,
            summary.predictions,
            summary.wagers_placed,
            summary.total_staked,
            summary.bankroll,
        );
    }
    Ok(())
}
