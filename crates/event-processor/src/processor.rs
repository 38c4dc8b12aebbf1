use crate::batch::{BatchConfig, UpdateBatch};
use crate::events::PriceUpdateEvent;
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

pub type UpdateHandler = Arc<dyn Fn(&PriceUpdateEvent) -> Result<()> + Send + Sync>;

const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("Ingestion queue for worker {worker} is full")]
    Backpressure { worker: usize },
    #[error("Processor is not running")]
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub worker_threads: usize,
    /// Queue depth per worker.
    pub buffer_size: usize,
    pub batch: BatchConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().clamp(1, 8),
            buffer_size: 10_000,
            batch: BatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub submitted: u64,
    pub rejected: u64,
    pub processed: u64,
    pub coalesced: u64,
    pub handler_errors: u64,
    pub batches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    coalesced: AtomicU64,
    handler_errors: AtomicU64,
    batches: AtomicU64,
}

/// Fans venue updates out to a fixed set of worker threads.
///
/// Each cell hashes to one worker, so updates for the same (pair, venue) are
/// applied in submission order. Workers coalesce a short burst per cell before
/// calling the registered handlers.
pub struct IngestionProcessor {
    config: ProcessorConfig,
    senders: Vec<Sender<PriceUpdateEvent>>,
    receivers: Vec<Receiver<PriceUpdateEvent>>,
    handlers: Arc<RwLock<Vec<UpdateHandler>>>,
    workers: RwLock<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl IngestionProcessor {
    #[inline]
    pub fn new() -> Self {
        Self::with_config(ProcessorConfig::default())
    }

    pub fn with_config(mut config: ProcessorConfig) -> Self {
        config.worker_threads = config.worker_threads.max(1);
        let (senders, receivers) = (0..config.worker_threads)
            .map(|_| bounded(config.buffer_size.max(1)))
            .unzip();
        Self {
            config,
            senders,
            receivers,
            handlers: Arc::new(RwLock::new(Vec::new())),
            workers: RwLock::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    #[inline]
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    #[inline]
    pub fn add_handler(&self, handler: UpdateHandler) {
        self.handlers.write().push(handler);
    }

    /// Non-blocking enqueue. A full worker queue is reported as backpressure
    /// and the update is not taken.
    pub fn submit(&self, update: PriceUpdateEvent) -> Result<(), ProcessorError> {
        let worker = self.shard(&update);
        match self.senders[worker].try_send(update) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                counter!("ingest_backpressure_total").increment(1);
                Err(ProcessorError::Backpressure { worker })
            }
            Err(TrySendError::Disconnected(_)) => Err(ProcessorError::NotRunning),
        }
    }

    /// Waits up to `timeout` for queue space.
    pub fn submit_timeout(&self, update: PriceUpdateEvent, timeout: Duration) -> Result<(), ProcessorError> {
        let worker = self.shard(&update);
        match self.senders[worker].send_timeout(update, timeout) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                counter!("ingest_backpressure_total").increment(1);
                Err(ProcessorError::Backpressure { worker })
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => Err(ProcessorError::NotRunning),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut workers = self.workers.write();
        for (worker_id, receiver) in self.receivers.iter().enumerate() {
            let worker = Worker {
                id: worker_id,
                receiver: receiver.clone(),
                handlers: Arc::clone(&self.handlers),
                running: Arc::clone(&self.running),
                counters: Arc::clone(&self.counters),
                batch: self.config.batch.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("ingest-{}", worker_id))
                .spawn(move || worker.run())?;
            workers.push(handle);
        }

        tracing::info!("Ingestion processor started with {} workers", self.config.worker_threads);
        Ok(())
    }

    /// Stops the workers after they drain what is already queued.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handles = std::mem::take(&mut *self.workers.write());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Ingestion worker panicked");
            }
        }
        tracing::info!("Ingestion processor stopped");
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.senders.iter().map(Sender::len).sum()
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn shard(&self, update: &PriceUpdateEvent) -> usize {
        let mut hasher = DefaultHasher::new();
        update.pair_key.hash(&mut hasher);
        update.venue_key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }
}

impl Default for IngestionProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IngestionProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    id: usize,
    receiver: Receiver<PriceUpdateEvent>,
    handlers: Arc<RwLock<Vec<UpdateHandler>>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    batch: BatchConfig,
}

impl Worker {
    fn run(self) {
        tracing::debug!("Ingestion worker {} started", self.id);

        while self.running.load(Ordering::Acquire) {
            match self.receiver.recv_timeout(IDLE_POLL) {
                Ok(first) => self.collect_and_apply(first),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Drain what was accepted before stop.
        while let Ok(first) = self.receiver.try_recv() {
            self.collect_and_apply(first);
        }

        tracing::debug!("Ingestion worker {} stopped", self.id);
    }

    fn collect_and_apply(&self, first: PriceUpdateEvent) {
        let started = Instant::now();
        let mut batch = UpdateBatch::with_capacity(self.batch.max_batch_size.min(1024));
        batch.push(first);
        while !batch.should_flush(&self.batch) {
            match self.receiver.try_recv() {
                Ok(update) => batch.push(update),
                Err(_) => break,
            }
        }

        let coalesced = batch.coalesced() as u64;
        let handlers = self.handlers.read();
        for update in batch.updates() {
            for handler in handlers.iter() {
                if let Err(e) = handler(update) {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        pair = %update.pair_key,
                        venue = %update.venue_key,
                        "Update handler error: {}",
                        e
                    );
                }
            }
        }

        self.counters.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.counters.coalesced.fetch_add(coalesced, Ordering::Relaxed);
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        counter!("ingest_updates_total").increment(batch.received() as u64);
        histogram!("ingest_batch_latency_ns").record(started.elapsed().as_nanos() as f64);
    }
}
