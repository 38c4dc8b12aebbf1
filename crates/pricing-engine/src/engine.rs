use crate::config::{ConfigError, EngineConfig};
use correlation_tracker::{CorrelationTracker, TrackerStats};
use crossbeam_channel::Receiver;
use event_processor::{
    ChannelPublisher, IngestionProcessor, OpportunityEvent, OpportunityPublisher, PriceUpdateEvent, ProcessorError,
    ProcessorStats,
};
use metrics::counter;
use opportunity_detector::{DetectionReport, DetectorStats, OpportunityDetector, TouchedQueue};
use parking_lot::Mutex;
use price_store::{CellReader, IndexMapper, PriceStore, StoreError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tiered_cache::{
    CacheError, CacheKey, CacheLookup, CacheStats, ColdStore, HierarchicalCache, KvStore, MemoryColdStore,
    MemoryKvStore,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] ProcessorError),
    #[error("Engine must be started from within a tokio runtime")]
    NoRuntime,
    #[error("Failed to start engine threads: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStats {
    pub cycles: u64,
    pub published: u64,
    pub publish_dropped: u64,
    pub prewarms_scheduled: u64,
    pub processor: ProcessorStats,
    pub cache: CacheStats,
    pub detector: DetectorStats,
    pub tracker: TrackerStats,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    published: AtomicU64,
    publish_dropped: AtomicU64,
    prewarms_scheduled: AtomicU64,
}

/// State shared by the ingestion handler and the detection thread.
struct Pipeline {
    mapper: Arc<IndexMapper>,
    cache: Arc<HierarchicalCache>,
    detector: Arc<OpportunityDetector>,
    tracker: Arc<CorrelationTracker>,
    publisher: Arc<dyn OpportunityPublisher>,
    updated: TouchedQueue,
    prewarm_limit: usize,
    sequence: AtomicU64,
    counters: Counters,
}

impl Pipeline {
    /// Ingestion path: L1 write, then mark the pair for detection.
    fn apply(&self, update: &PriceUpdateEvent) -> anyhow::Result<()> {
        let data = update.to_price_data()?;
        let key = CacheKey::new(update.pair_key.as_str(), update.venue_key.as_str());
        let outcome = match self.cache.set(&key, data) {
            Ok(outcome) => outcome,
            Err(CacheError::Capacity(e)) => {
                counter!("engine_capacity_rejections_total").increment(1);
                warn!(pair = %update.pair_key, venue = %update.venue_key, "Dropping update: {}", e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        if outcome.write.is_written() {
            self.detector.touch(outcome.pair);
            self.updated.touch(outcome.pair);
        }
        Ok(())
    }

    fn run_cycle(&self, runtime: Option<&Handle>) -> DetectionReport {
        let report = self.detector.run_cycle();
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);

        for opportunity in &report.opportunities {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(sequence, "Opportunity: {}", opportunity);
            if self.publisher.publish(OpportunityEvent::new(sequence, opportunity.clone())) {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.publish_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.track_correlations(runtime);
        report
    }

    /// Pairs written since the last cycle count as co-occurring.
    fn track_correlations(&self, runtime: Option<&Handle>) {
        self.tracker.maybe_prune();

        let updated: Vec<Arc<str>> = self
            .updated
            .drain()
            .into_iter()
            .filter_map(|pair| self.mapper.pair_key(pair))
            .collect();
        if updated.is_empty() {
            return;
        }
        self.tracker.record_updates(updated.iter().map(|pair_key| &**pair_key));

        if let Some(runtime) = runtime {
            self.schedule_prewarm(runtime, &updated);
        }
    }

    fn schedule_prewarm(&self, runtime: &Handle, updated: &[Arc<str>]) {
        if self.prewarm_limit == 0 {
            return;
        }

        let mut targets: HashSet<Arc<str>> = HashSet::new();
        for pair_key in updated {
            for correlated in self.tracker.get_correlated(pair_key, self.prewarm_limit) {
                targets.insert(correlated.pair);
            }
        }

        for pair_key in targets {
            let cache = Arc::clone(&self.cache);
            self.counters.prewarms_scheduled.fetch_add(1, Ordering::Relaxed);
            runtime.spawn(async move {
                cache.prewarm(&pair_key).await;
            });
        }
    }
}

/// Owns every component and the threads that drive them.
///
/// Ingestion workers write through the cache into the store; one detection
/// thread drains touched pairs on a fixed interval and publishes what it finds.
pub struct PricingEngine {
    config: EngineConfig,
    store: Arc<PriceStore>,
    pipeline: Arc<Pipeline>,
    processor: Arc<IngestionProcessor>,
    channel: Option<ChannelPublisher>,
    running: Arc<AtomicBool>,
    detection: Mutex<Option<JoinHandle<()>>>,
}

impl PricingEngine {
    /// Engine with in-memory L2/L3 and a channel publisher.
    pub fn in_memory(config: EngineConfig) -> Result<Self, EngineError> {
        Self::new(config, Arc::new(MemoryKvStore::new()), Arc::new(MemoryColdStore::new()))
    }

    pub fn new(config: EngineConfig, l2: Arc<dyn KvStore>, l3: Arc<dyn ColdStore>) -> Result<Self, EngineError> {
        let channel = ChannelPublisher::new(config.publish_buffer);
        let publisher: Arc<dyn OpportunityPublisher> = Arc::new(channel.clone());
        let mut engine = Self::with_publisher(config, l2, l3, publisher)?;
        engine.channel = Some(channel);
        Ok(engine)
    }

    pub fn with_publisher(
        config: EngineConfig,
        l2: Arc<dyn KvStore>,
        l3: Arc<dyn ColdStore>,
        publisher: Arc<dyn OpportunityPublisher>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let store = Arc::new(PriceStore::with_config(config.store)?);
        let mapper = Arc::new(IndexMapper::new(config.store.max_pairs, config.store.max_venues));
        let cache = Arc::new(HierarchicalCache::new(
            Arc::clone(&store),
            Arc::clone(&mapper),
            l2,
            l3,
            config.cache_config(),
        ));
        let reader: Arc<dyn CellReader> = cache.clone();
        let detector = Arc::new(OpportunityDetector::new(reader, Arc::clone(&mapper), config.detector_config()));
        let tracker = Arc::new(CorrelationTracker::with_config(config.tracker.clone()));

        let pipeline = Arc::new(Pipeline {
            updated: TouchedQueue::new(config.store.max_pairs),
            prewarm_limit: config.prewarm_limit,
            sequence: AtomicU64::new(0),
            counters: Counters::default(),
            mapper,
            cache,
            detector,
            tracker,
            publisher,
        });

        let processor = Arc::new(IngestionProcessor::with_config(config.processor.clone()));
        let handler_pipeline = Arc::clone(&pipeline);
        processor.add_handler(Arc::new(move |update: &PriceUpdateEvent| -> anyhow::Result<()> {
            handler_pipeline.apply(update)
        }));

        Ok(Self {
            config,
            store,
            pipeline,
            processor,
            channel: None,
            running: Arc::new(AtomicBool::new(false)),
            detection: Mutex::new(None),
        })
    }

    /// Starts the cache worker, the ingestion workers and the detection thread.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.pipeline.cache.start();
        self.processor
            .start()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        let pipeline = Arc::clone(&self.pipeline);
        let running = Arc::clone(&self.running);
        let interval = self.config.cycle_interval();
        let handle = std::thread::Builder::new()
            .name("detector".to_string())
            .spawn(move || {
                debug!("Detection thread started");
                while running.load(Ordering::Acquire) {
                    let started = Instant::now();
                    pipeline.run_cycle(Some(&runtime));
                    if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                        std::thread::sleep(remaining);
                    }
                }
                debug!("Detection thread stopped");
            })
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        *self.detection.lock() = Some(handle);

        info!(
            workers = self.config.processor.worker_threads,
            max_pairs = self.config.store.max_pairs,
            max_venues = self.config.store.max_venues,
            "Pricing engine started"
        );
        Ok(())
    }

    /// Drains ingestion, runs a last detection pass and flushes the cache.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        // Joining OS threads blocks, so keep it off the runtime's workers.
        let processor = Arc::clone(&self.processor);
        let pipeline = Arc::clone(&self.pipeline);
        let detection = self.detection.lock().take();
        let drained = tokio::task::spawn_blocking(move || {
            processor.stop();
            if let Some(handle) = detection {
                if handle.join().is_err() {
                    tracing::error!("Detection thread panicked");
                }
            }
            pipeline.run_cycle(None);
        })
        .await;
        if let Err(e) = drained {
            tracing::error!("Shutdown drain failed: {}", e);
        }

        let report = self.pipeline.cache.shutdown().await;
        info!(flushed = report.written, "Pricing engine stopped");
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queues an update for the ingestion workers without blocking.
    #[inline]
    pub fn ingest(&self, update: PriceUpdateEvent) -> Result<(), EngineError> {
        self.processor.submit(update).map_err(EngineError::from)
    }

    /// Applies an update on the calling thread.
    #[inline]
    pub fn apply_update(&self, update: &PriceUpdateEvent) -> anyhow::Result<()> {
        self.pipeline.apply(update)
    }

    /// Runs one detection cycle on the calling thread and publishes its results.
    pub fn detect_now(&self) -> DetectionReport {
        let runtime = Handle::try_current().ok();
        self.pipeline.run_cycle(runtime.as_ref())
    }

    pub async fn get_price(&self, pair_key: &str, venue_key: &str) -> CacheLookup {
        self.pipeline.cache.get(&CacheKey::new(pair_key, venue_key)).await
    }

    /// Receiver for published opportunities when the engine owns the channel.
    pub fn subscribe(&self) -> Option<Receiver<OpportunityEvent>> {
        self.channel.as_ref().map(|channel| channel.receiver().clone())
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    #[inline]
    pub fn mapper(&self) -> &Arc<IndexMapper> {
        &self.pipeline.mapper
    }

    #[inline]
    pub fn cache(&self) -> &Arc<HierarchicalCache> {
        &self.pipeline.cache
    }

    #[inline]
    pub fn detector(&self) -> &Arc<OpportunityDetector> {
        &self.pipeline.detector
    }

    #[inline]
    pub fn tracker(&self) -> &Arc<CorrelationTracker> {
        &self.pipeline.tracker
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.pipeline.counters;
        EngineStats {
            cycles: counters.cycles.load(Ordering::Relaxed),
            published: counters.published.load(Ordering::Relaxed),
            publish_dropped: counters.publish_dropped.load(Ordering::Relaxed),
            prewarms_scheduled: counters.prewarms_scheduled.load(Ordering::Relaxed),
            processor: self.processor.stats(),
            cache: self.pipeline.cache.stats(),
            detector: self.pipeline.detector.stats(),
            tracker: self.pipeline.tracker.stats(),
        }
    }
}

impl Drop for PricingEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.processor.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use price_store::now_ns;
    use std::time::Duration;
    use tiered_cache::Tier;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.store.max_pairs = 16;
        config.store.max_venues = 4;
        config.cache.l1_eviction.capacity = Some(64);
        config.processor.worker_threads = 2;
        config.processor.buffer_size = 64;
        config
    }

    fn quote(pair: &str, price: f64) -> PriceUpdateEvent {
        PriceUpdateEvent::new(pair, "uniswapv2", price, 1_000_000.0, 1_000_000.0 * price, now_ns())
    }

    // A -> B -> C -> A multiplies to 1.02 before fees.
    fn triangle() -> Vec<PriceUpdateEvent> {
        vec![quote("A/B", 2.0), quote("B/C", 3.0), quote("C/A", 0.17)]
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let engine = PricingEngine::in_memory(test_config()).unwrap();
        assert!(!engine.is_running());
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.shutdown().await;
        assert!(!engine.is_running());
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let engine = PricingEngine::in_memory(test_config()).unwrap();
        assert!(matches!(engine.start(), Err(EngineError::NoRuntime)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.detector.max_leg_depth = 1;
        assert!(matches!(PricingEngine::in_memory(config), Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_applied_triangle_is_published() {
        let engine = PricingEngine::in_memory(test_config()).unwrap();
        let subscriber = engine.subscribe().unwrap();
        for update in triangle() {
            engine.apply_update(&update).unwrap();
        }

        let report = engine.detect_now();
        assert_eq!(report.opportunities.len(), 1);

        let event = subscriber.try_recv().unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(event.opportunity.leg_count(), 3);
        assert!(event.opportunity.profit_ratio() > 0.001);
        assert_eq!(engine.stats().published, 1);

        // Nothing new was touched, so the next cycle is empty.
        assert!(engine.detect_now().opportunities.is_empty());
    }

    #[tokio::test]
    async fn test_workers_and_detection_thread_publish() {
        let engine = PricingEngine::in_memory(test_config()).unwrap();
        let subscriber = engine.subscribe().unwrap();
        engine.start().unwrap();

        for update in triangle() {
            engine.ingest(update).unwrap();
        }

        let event = subscriber.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.opportunity.leg_count(), 3);

        engine.shutdown().await;
        let stats = engine.stats();
        assert_eq!(stats.processor.submitted, 3);
        assert!(stats.cycles > 0);
    }

    #[tokio::test]
    async fn test_rejected_update_surfaces_error() {
        let engine = PricingEngine::in_memory(test_config()).unwrap();
        let bad = PriceUpdateEvent::new("A/B", "x", f64::NAN, 1.0, 1.0, now_ns());
        assert!(engine.apply_update(&bad).is_err());
        assert_eq!(engine.detector().pending_pairs(), 0);
    }

    #[tokio::test]
    async fn test_capacity_exhaustion_is_non_fatal() {
        let mut config = test_config();
        config.store.max_pairs = 1;
        config.cache.l1_eviction.capacity = Some(4);
        let engine = PricingEngine::in_memory(config).unwrap();

        engine.apply_update(&quote("A/B", 2.0)).unwrap();
        assert!(engine.apply_update(&quote("B/C", 3.0)).is_err());
        engine.apply_update(&quote("A/B", 2.1)).unwrap();

        match engine.get_price("A/B", "uniswapv2").await {
            CacheLookup::Hit { tier, .. } => assert_eq!(tier, Tier::L1),
            CacheLookup::Miss => panic!("expected L1 hit"),
        }
    }

    #[tokio::test]
    async fn test_correlated_pairs_are_prewarmed() {
        let engine = PricingEngine::in_memory(test_config()).unwrap();
        for update in triangle() {
            engine.apply_update(&update).unwrap();
        }
        engine.detect_now();
        assert!(engine.stats().prewarms_scheduled > 0);
        assert!(engine.tracker().stats().tracked_pairs >= 2);
    }

    #[tokio::test]
    async fn test_correlations_sampled_off_ingestion_path() {
        let engine = PricingEngine::in_memory(test_config()).unwrap();
        for update in triangle() {
            engine.apply_update(&update).unwrap();
        }
        assert_eq!(engine.tracker().stats().updates, 0);

        engine.detect_now();
        assert_eq!(engine.tracker().stats().updates, 3);
        assert_eq!(engine.tracker().get_correlated("C/A", 10).len(), 2);
    }

    #[tokio::test]
    async fn test_decayed_correlations_are_reclaimed() {
        let mut config = test_config();
        config.tracker.half_life_ms = 1;
        config.tracker.min_score = 0.5;
        config.tracker.prune_interval_ms = 1;
        let engine = PricingEngine::in_memory(config).unwrap();
        for update in triangle() {
            engine.apply_update(&update).unwrap();
        }
        engine.detect_now();
        assert_eq!(engine.tracker().stats().tracked_pairs, 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.detect_now();
        assert_eq!(engine.tracker().stats().tracked_pairs, 0);
    }

    #[tokio::test]
    async fn test_one_staleness_window_for_cache_and_detector() {
        let mut config = test_config();
        config.staleness_window_ms = 1_234;
        let engine = PricingEngine::in_memory(config).unwrap();
        assert_eq!(engine.cache().config().staleness_window_ms, 1_234);
        assert_eq!(engine.detector().config().staleness_window_ms, 1_234);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_runtime_responsive() {
        let mut config = test_config();
        config.cycle_interval_ms = 200;
        let engine = PricingEngine::in_memory(config).unwrap();
        engine.start().unwrap();
        // Let the detection thread settle into its pause between cycles.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ticks = Arc::new(AtomicU64::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        engine.shutdown().await;
        ticker.abort();
        assert!(!engine.is_running());
        assert!(ticks.load(Ordering::Relaxed) > 0);
    }
}
