use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::signal;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use arbcore::config::CoreConfig;
use arbcore::metrics;
use event_processor::PriceUpdateEvent;
use price_store::now_ns;
use pricing_engine::PricingEngine;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const VENUES: [&str; 2] = ["uniswapv2", "sushiswap"];
const DEMO_TICKS: u64 = 200;

/// (pair, mid price, base reserve). WETH -> USDC -> DAI -> WETH is close to flat.
const MARKET: [(&str, f64, f64); 4] = [
    ("WETH/USDC", 2_000.0, 5_000.0),
    ("USDC/DAI", 1.0, 10_000_000.0),
    ("DAI/WETH", 0.0005, 10_000_000.0),
    ("WBTC/WETH", 16.0, 300.0),
];

struct ArbSystem {
    engine: Arc<PricingEngine>,
    consumer_running: Arc<AtomicBool>,
    consumer: Option<JoinHandle<u64>>,
}

impl ArbSystem {
    fn new(config: &CoreConfig) -> anyhow::Result<Self> {
        info!("Initializing pricing engine components...");
        let engine = Arc::new(PricingEngine::in_memory(config.engine.clone())?);
        Ok(Self {
            engine,
            consumer_running: Arc::new(AtomicBool::new(false)),
            consumer: None,
        })
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.engine.start()?;
        self.consumer = self.spawn_consumer()?;
        info!("Pricing engine started successfully");
        Ok(())
    }

    async fn stop(&mut self) {
        info!("Stopping pricing engine...");
        self.engine.shutdown().await;
        self.consumer_running.store(false, Ordering::Release);
        if let Some(handle) = self.consumer.take() {
            match handle.join() {
                Ok(received) => info!("Opportunity consumer received {} events", received),
                Err(_) => warn!("Opportunity consumer panicked"),
            }
        }
    }

    fn spawn_consumer(&self) -> anyhow::Result<Option<JoinHandle<u64>>> {
        let Some(receiver) = self.engine.subscribe() else {
            return Ok(None);
        };
        self.consumer_running.store(true, Ordering::Release);
        let running = Arc::clone(&self.consumer_running);
        let handle = std::thread::Builder::new()
            .name("opportunity-consumer".to_string())
            .spawn(move || {
                let mut received = 0u64;
                while running.load(Ordering::Acquire) || !receiver.is_empty() {
                    if let Ok(event) = receiver.recv_timeout(std::time::Duration::from_millis(50)) {
                        received += 1;
                        info!(
                            sequence = event.sequence,
                            latency_us = event.observation_latency_ns() / 1_000,
                            "Opportunity {}",
                            event.opportunity
                        );
                    }
                }
                received
            })?;
        Ok(Some(handle))
    }

    /// Feeds a drifting synthetic market. Every 50th tick one venue mispricing
    /// opens a loop for the detector to find.
    async fn run_demo(&self) -> anyhow::Result<()> {
        info!("Feeding synthetic market for {} ticks...", DEMO_TICKS);
        let mut ticker = interval(Duration::from_millis(5));

        for tick in 0..DEMO_TICKS {
            ticker.tick().await;
            for (venue_id, venue) in VENUES.iter().enumerate() {
                for (pair_id, (pair, mid, reserve_base)) in MARKET.iter().enumerate() {
                    let phase = (tick as f64 * 0.1) + (pair_id * 3 + venue_id) as f64;
                    let mut price = mid * (1.0 + 0.0005 * phase.sin());
                    if tick % 50 == 49 && venue_id == 1 && *pair == "DAI/WETH" {
                        price *= 1.02;
                    }
                    let update = PriceUpdateEvent::new(*pair, *venue, price, *reserve_base, reserve_base * price, now_ns())
                        .with_sequence(tick + 1);
                    if let Err(e) = self.engine.ingest(update) {
                        warn!("Update not accepted: {}", e);
                    }
                }
            }
        }

        info!("Demo feed completed");
        Ok(())
    }

    fn print_stats(&self) {
        let stats = self.engine.stats();
        metrics::record_engine_stats(&stats);
        info!("=== Engine Statistics ===");
        info!(
            "ingest: submitted={} processed={} coalesced={} rejected={}",
            stats.processor.submitted, stats.processor.processed, stats.processor.coalesced, stats.processor.rejected
        );
        info!(
            "cache: l1={} l2={} l3={} misses={} resident={} evictions={}",
            stats.cache.l1_hits,
            stats.cache.l2_hits,
            stats.cache.l3_hits,
            stats.cache.misses,
            stats.cache.resident,
            stats.cache.evictions
        );
        info!(
            "detector: cycles={} opportunities={} invalid={} truncated={} tokens={} edges={}",
            stats.detector.cycles,
            stats.detector.opportunities,
            stats.detector.invalid_routes,
            stats.detector.truncated_cycles,
            stats.detector.tokens,
            stats.detector.edges
        );
        info!(
            "publish: published={} dropped={} prewarms={}",
            stats.published, stats.publish_dropped, stats.prewarms_scheduled
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = CoreConfig::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting arbcore v{}", arbcore::VERSION);
    let prometheus = if config.logging.prometheus {
        Some(metrics::install_prometheus()?)
    } else {
        None
    };

    let mut system = ArbSystem::new(&config)?;
    system.start()?;

    tokio::select! {
        result = system.run_demo() => result?,
        _ = signal::ctrl_c() => info!("Interrupted"),
    }

    system.stop().await;
    system.print_stats();

    if let Some(handle) = prometheus {
        println!("{}", handle.render());
    }

    info!("arbcore shutdown complete");
    Ok(())
}
