use bandbot::config::{interval_ms, Settings};
use bandbot::engine::Engine;
use bandbot::exchange::feed::KlineFeed;
use bandbot::exchange::binance::BinanceFutures;
use bandbot::indicators::compute_band_with_fallback;
use bandbot::models::{Bar, BarEvent};
use bandbot::store::PostgresStore;

use anyhow::{Context, Result};
use clap::Parser;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Paging size for historical kline backfill
const BACKFILL_PAGE: usize = 500;

#[derive(Parser)]
#[command(name = "bandbot", about = "Band-crossing futures trading bot")]
struct Cli {
    /// Trading pair, overrides SYMBOL
    #[arg(long)]
    symbol: Option<String>,

    /// Kline interval, overrides INTERVAL
    #[arg(long)]
    interval: Option<String>,

    /// Log orders instead of sending them
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    if let Some(symbol) = cli.symbol {
        settings.symbol = symbol;
    }
    if let Some(interval) = cli.interval {
        settings.interval = interval;
    }
    if cli.simulate {
        settings.simulate = true;
    }

    tracing::info!(
        "bandbot starting: {} {} (period {}, mult {}, simulate {})",
        settings.symbol,
        settings.interval,
        settings.band_period,
        settings.band_multiplier,
        settings.simulate
    );

    let store = Arc::new(
        PostgresStore::connect(&settings.database_url)
            .await
            .context("connecting to Postgres")?,
    );
    let gateway = Arc::new(BinanceFutures::new(
        settings.api_key.clone(),
        settings.api_secret.clone(),
        settings.use_testnet,
        settings.simulate,
    ));

    backfill(&gateway, &store, &settings)
        .await
        .context("backfilling klines")?;

    let mut engine = Engine::new(settings.clone(), Arc::clone(&gateway), Arc::clone(&store));
    engine.reconcile().await?;
    tracing::info!("startup state: {}", engine.state());

    // Window large enough for the band plus policy trimming
    let window = (settings.band_period * 3).max(settings.band_period + 5);
    let mut bars: Vec<Bar> = store
        .recent_bars(&settings.symbol, &settings.interval, window as i64)
        .await?;
    tracing::info!("loaded {} bars into the evaluation window", bars.len());

    let (tx, mut rx) = mpsc::channel::<BarEvent>(1024);
    let feed = KlineFeed::new(&settings.symbol, &settings.interval, settings.use_testnet);
    let feed_task = tokio::spawn(feed.run(tx));

    // Intermediate tick updates evaluate at most once a second; a bar close
    // always evaluates regardless of the throttle.
    let throttle: DefaultDirectRateLimiter =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(1).unwrap()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down");
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    tracing::error!("kline feed channel closed");
                    break;
                };
                handle_event(&mut engine, &store, &settings, &throttle, &mut bars, window, event)
                    .await;
            }
        }
    }

    feed_task.abort();
    tracing::info!("bandbot stopped");
    Ok(())
}

async fn handle_event(
    engine: &mut Engine<BinanceFutures, PostgresStore>,
    store: &PostgresStore,
    settings: &Settings,
    throttle: &DefaultDirectRateLimiter,
    bars: &mut Vec<Bar>,
    window: usize,
    event: BarEvent,
) {
    // Merge into the local window: same open time replaces, newer appends
    let last_open = bars.last().map(|b| b.open_time);
    match last_open {
        Some(open_time) if open_time == event.bar.open_time => {
            *bars.last_mut().unwrap() = event.bar.clone();
        }
        Some(open_time) if open_time > event.bar.open_time => {
            tracing::warn!(
                "out-of-order bar event ({} after {open_time}), dropping",
                event.bar.open_time
            );
            return;
        }
        _ => bars.push(event.bar.clone()),
    }
    if bars.len() > window {
        let excess = bars.len() - window;
        bars.drain(..excess);
    }

    if event.is_closed {
        if let Err(e) = store.upsert_bar(&event.bar).await {
            tracing::warn!("failed to persist closed bar: {e}");
        }
    } else if throttle.check().is_err() {
        return;
    }

    let tick = event.bar.close;
    let latest_close = if event.is_closed {
        event.bar.close
    } else if bars.len() >= 2 {
        bars[bars.len() - 2].close
    } else {
        return;
    };

    let band = match compute_band_with_fallback(
        bars,
        settings.band_period,
        settings.band_multiplier,
        tick,
        settings.large_gap_pct,
        settings.band_stddev,
    ) {
        Ok(band) => band,
        Err(e) => {
            tracing::warn!("band unavailable: {e}");
            return;
        }
    };

    if let Err(e) = engine.evaluate(latest_close, tick, &band).await {
        tracing::error!("evaluation failed: {e}");
    }
}

/// Fill the kline table up to the present
///
/// An empty store bootstraps with the most recent `initial_bars`; otherwise
/// pages forward from the last stored bar.
async fn backfill(
    gateway: &BinanceFutures,
    store: &PostgresStore,
    settings: &Settings,
) -> Result<()> {
    let step = interval_ms(&settings.interval)?;
    let latest = store
        .latest_bar_time(&settings.symbol, &settings.interval)
        .await?;

    let mut start = match latest {
        Some(open_time) => Some(open_time + step),
        None => {
            let bars = gateway
                .fetch_klines(
                    &settings.symbol,
                    &settings.interval,
                    settings.initial_bars,
                    None,
                )
                .await?;
            let inserted = store.insert_bars(&bars).await?;
            tracing::info!("bootstrapped {} bars", inserted);
            return Ok(());
        }
    };

    let mut total = 0;
    loop {
        let bars = gateway
            .fetch_klines(&settings.symbol, &settings.interval, BACKFILL_PAGE, start)
            .await?;
        if bars.is_empty() {
            break;
        }
        total += store.insert_bars(&bars).await?;
        if bars.len() < BACKFILL_PAGE {
            break;
        }
        start = bars.last().map(|b| b.open_time + step);
    }
    if total > 0 {
        tracing::info!("backfilled {} bars", total);
    }
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bandbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
