use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tick_fanout::callback::{DepthUpdate, PriceKind, PriceUpdate, SubscriberHandle};
use tick_fanout::{FanoutConfig, FanoutEngine, SubscriptionSet};
use types::ids::SubscriberId;
use types::tick::{DepthLevel, TickRecord, DEPTH_LEVELS};

const FEED_DURATION: Duration = Duration::from_secs(3);

struct Instrument {
    symbol: &'static str,
    price: f64,
    volume: i64,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => FanoutConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {path}"))?,
        None => FanoutConfig::default(),
    };

    tracing::info!(
        version = tick_fanout::SERVICE_VERSION,
        shards = config.shard_count,
        "Starting tick fan-out demo"
    );

    let engine = Arc::new(FanoutEngine::new(config)?);

    let monitor = engine.health_monitor();
    let health_task = tokio::spawn(async move { monitor.run().await });
    let retry_engine = engine.clone();
    let retry_task = tokio::spawn(async move { retry_engine.run_unresolved_retry().await });

    let mut alerts = engine.subscribe_alerts();
    let alert_task = tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            tracing::debug!(metric = alert.metric(), "Alert received: {}", alert);
        }
    });

    // Demo subscribers: an index, an equity and a depth consumer.
    let index_updates = Arc::new(AtomicU64::new(0));
    let equity_volume = Arc::new(AtomicU64::new(0));
    let depth_levels = Arc::new(AtomicU64::new(0));

    let mut subscriptions = SubscriptionSet::new();
    {
        let counter = index_updates.clone();
        subscriptions.register_callback(
            "NIFTY",
            SubscriberHandle::new(SubscriberId::new()).index(),
            Arc::new(move |update: &PriceUpdate| {
                if update.kind == PriceKind::Last {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }),
        );
    }
    {
        let counter = equity_volume.clone();
        subscriptions.register_callback(
            "RELIANCE",
            SubscriberHandle::new(SubscriberId::new()),
            Arc::new(move |update: &PriceUpdate| {
                if update.kind == PriceKind::Last {
                    counter.fetch_add(update.size as u64, Ordering::Relaxed);
                }
            }),
        );
    }
    {
        let counter = depth_levels.clone();
        subscriptions.register_depth(
            "BANKNIFTY",
            SubscriberId::new(),
            Arc::new(move |_: &DepthUpdate| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );
    }
    engine.update_subscriptions(&subscriptions)?;

    // Synthetic random-walk feed on a producer thread.
    let running = Arc::new(AtomicBool::new(true));
    let producer = {
        let engine = engine.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("synthetic-feed".to_string())
            .spawn(move || run_feed(&engine, &running))
            .context("spawning feed thread")?
    };

    tokio::time::sleep(FEED_DURATION).await;
    running.store(false, Ordering::Relaxed);
    let produced = producer
        .join()
        .map_err(|_| anyhow::anyhow!("feed thread panicked"))?;

    let report = engine.health_monitor().sample();
    engine.health_monitor().publish(&report);

    let metrics = engine.metrics();
    tracing::info!(
        produced,
        queued = metrics.ticks_queued,
        processed = metrics.ticks_processed,
        dropped = metrics.ticks_dropped,
        avg_ms = metrics.avg_processing_ms,
        p99_ms = metrics.p99_processing_ms,
        ticks_per_second = metrics.current_ticks_per_second,
        "Feed finished"
    );
    tracing::info!(
        index_updates = index_updates.load(Ordering::Relaxed),
        equity_volume = equity_volume.load(Ordering::Relaxed),
        depth_levels = depth_levels.load(Ordering::Relaxed),
        "Subscriber totals"
    );
    tracing::info!("Diagnostics:\n{}", engine.diagnostic_info());

    let shutdown = engine.shutdown()?;
    tracing::info!(
        processed = shutdown.processed,
        unprocessed = shutdown.unprocessed,
        timed_out = shutdown.timed_out,
        "Shutdown complete"
    );

    health_task.await?;
    retry_task.await?;
    alert_task.abort();

    Ok(())
}

/// Publish random-walk ticks until `running` clears. Returns ticks offered.
fn run_feed(engine: &FanoutEngine, running: &AtomicBool) -> u64 {
    let mut rng = rand::thread_rng();
    let mut instruments = vec![
        Instrument { symbol: "NIFTY", price: 22_000.0, volume: 0 },
        Instrument { symbol: "BANKNIFTY", price: 48_000.0, volume: 0 },
        Instrument { symbol: "RELIANCE", price: 2_950.0, volume: 0 },
        Instrument { symbol: "INFY", price: 1_500.0, volume: 0 },
        Instrument { symbol: "TCS", price: 3_900.0, volume: 0 },
    ];

    let mut offered = 0u64;
    while running.load(Ordering::Relaxed) {
        for instrument in instruments.iter_mut() {
            let step = instrument.price * rng.gen_range(-0.0005..0.0005);
            instrument.price = (instrument.price + step).max(0.05);
            let traded = if instrument.symbol.contains("NIFTY") {
                0
            } else {
                rng.gen_range(0..50)
            };
            instrument.volume += traded;

            let mut tick = TickRecord::new(instrument.symbol, instrument.price, traded, instrument.volume);
            tick.bid_price = instrument.price - 0.05;
            tick.ask_price = instrument.price + 0.05;
            tick.bid_quantity = rng.gen_range(1..500);
            tick.ask_quantity = rng.gen_range(1..500);
            tick.exchange_timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            for level in 0..DEPTH_LEVELS {
                let offset = 0.05 * (level as f64 + 1.0);
                tick.depth.bids[level] = DepthLevel::new(tick.bid_price - offset, rng.gen_range(1..200));
                tick.depth.asks[level] = DepthLevel::new(tick.ask_price + offset, rng.gen_range(1..200));
            }

            engine.queue_tick(instrument.symbol, tick);
            offered += 1;
        }
        thread::sleep(Duration::from_micros(200));
    }
    offered
}
