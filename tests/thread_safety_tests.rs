//! Thread safety validation tests for the pricing core
//!
//! These tests verify that all components work correctly under concurrent access

use arbcore::*;
use event_processor::PriceUpdateEvent;
use opportunity_detector::{DetectorConfig, OpportunityDetector};
use price_store::{now_ns, CellRead, IndexMapper, Liquidity, PairIndex, Price, PriceData, PriceStore, VenueIndex};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_seqlock_reads_are_never_torn() {
    let store = Arc::new(PriceStore::new(4, 2).unwrap());
    let num_writers = 2;
    let num_readers = 6;
    let writes_per_thread = 20_000u64;
    let done = AtomicBool::new(false);
    let consistent_reads = AtomicU64::new(0);
    let barrier = Barrier::new(num_writers + num_readers);

    crossbeam::thread::scope(|scope| {
        for writer in 0..num_writers as u64 {
            let store = Arc::clone(&store);
            let barrier = &barrier;
            scope.spawn(move |_| {
                barrier.wait();
                for i in 0..writes_per_thread {
                    // Every field carries the same integer, so a torn read shows up as a mismatch.
                    let value = (i * num_writers as u64 + writer + 1) as f64;
                    let data = PriceData::new(
                        Price::new(value),
                        Liquidity::new(value),
                        Liquidity::new(value),
                        value as u64,
                    );
                    store.write(PairIndex(1), VenueIndex(1), &data).unwrap();
                }
            });
        }

        for _ in 0..num_readers {
            let store = Arc::clone(&store);
            let (barrier, done, consistent_reads) = (&barrier, &done, &consistent_reads);
            scope.spawn(move |_| {
                barrier.wait();
                while !done.load(Ordering::Acquire) {
                    match store.read(PairIndex(1), VenueIndex(1)).unwrap() {
                        CellRead::Value(snapshot) => {
                            let data = snapshot.data;
                            let value = data.price.to_f64();
                            assert_eq!(data.reserve_base.to_f64(), value);
                            assert_eq!(data.reserve_quote.to_f64(), value);
                            assert_eq!(data.observed_at_ns, value as u64);
                            consistent_reads.fetch_add(1, Ordering::Relaxed);
                        }
                        CellRead::NotFound | CellRead::Stale => {}
                    }
                }
            });
        }

        thread::sleep(Duration::from_millis(200));
        done.store(true, Ordering::Release);
    })
    .unwrap();

    println!("Consistent reads: {}", consistent_reads.load(Ordering::Relaxed));
    assert!(store.stats().writes > 0);
}

#[test]
fn test_concurrent_index_assignment_agrees() {
    let mapper = Arc::new(IndexMapper::new(64, 8));
    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let mapper = Arc::clone(&mapper);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut assigned = Vec::new();
                for i in 0..32 {
                    // Walk the keys in a different order per thread.
                    let key = (i + thread_id * 5) % 32;
                    let pair_key = format!("T{}/USDC", key);
                    let venue_key = format!("venue-{}", key % 4);
                    let (pair, venue) = mapper.get_or_assign(&pair_key, &venue_key).unwrap();
                    assigned.push((pair_key, venue_key, pair, venue));
                }
                assigned
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.extend(handle.join().unwrap());
    }

    for (pair_key, venue_key, pair, venue) in &results {
        assert_eq!(mapper.lookup(pair_key, venue_key), Some((*pair, *venue)));
    }
    let distinct_pairs: HashSet<PairIndex> = results.iter().map(|(_, _, pair, _)| *pair).collect();
    assert_eq!(distinct_pairs.len(), 32);
    assert_eq!(mapper.pair_count(), 32);
    assert_eq!(mapper.venue_count(), 4);
}

#[test]
fn test_detection_while_prices_move() {
    let store = Arc::new(PriceStore::new(8, 2).unwrap());
    let mapper = Arc::new(IndexMapper::new(8, 2));
    let detector = Arc::new(OpportunityDetector::new(
        store.clone(),
        Arc::clone(&mapper),
        DetectorConfig::default(),
    ));

    let pairs = ["A/B", "B/C", "C/A"];
    let cells: Vec<_> = pairs
        .iter()
        .map(|pair| mapper.get_or_assign(pair, "amm").unwrap())
        .collect();
    let running = Arc::new(AtomicBool::new(true));

    let writer = {
        let (store, detector, running, cells) = (Arc::clone(&store), Arc::clone(&detector), Arc::clone(&running), cells.clone());
        thread::spawn(move || {
            let mut tick = 0u64;
            while running.load(Ordering::Acquire) {
                tick += 1;
                for (i, (pair, venue)) in cells.iter().enumerate() {
                    let price = [2.0, 3.0, 0.17][i] * (1.0 + 0.01 * ((tick + i as u64) % 3) as f64);
                    let data = PriceData::new(
                        Price::new(price),
                        Liquidity::new(1_000_000.0),
                        Liquidity::new(1_000_000.0 * price),
                        now_ns(),
                    );
                    store.write(*pair, *venue, &data).unwrap();
                    detector.touch(*pair);
                }
            }
            tick
        })
    };

    let mut found = 0usize;
    for _ in 0..200 {
        let report = detector.run_cycle();
        for opportunity in &report.opportunities {
            assert!(opportunity.profit_ratio() > detector.config().min_profit_threshold);
            assert!(opportunity.amount_out() > opportunity.amount_in());
        }
        found += report.opportunities.len();
        thread::sleep(Duration::from_micros(200));
    }

    running.store(false, Ordering::Release);
    let ticks = writer.join().unwrap();
    println!("Writer ticks: {}, opportunities: {}", ticks, found);
    assert!(ticks > 0);
    assert!(detector.stats().cycles > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_ingestion_accounts_for_every_update() {
    let mut config = EngineConfig::default();
    config.store.max_pairs = 64;
    config.store.max_venues = 4;
    config.cache.l1_eviction.capacity = Some(256);
    config.processor.worker_threads = 4;
    config.processor.buffer_size = 100_000;
    let engine = Arc::new(PricingEngine::in_memory(config).unwrap());
    engine.start().unwrap();

    let num_threads = 4;
    let updates_per_thread = 2_000u64;
    let barrier = Arc::new(Barrier::new(num_threads));
    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..updates_per_thread {
                    let pair = format!("T{}/USDC", (i % 16) as usize + thread_id * 16);
                    let update = PriceUpdateEvent::new(pair, "amm", 1.0 + i as f64 * 1e-4, 1_000.0, 1_000.0, now_ns())
                        .with_sequence(i + 1);
                    engine.ingest(update).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    engine.shutdown().await;
    let stats = engine.stats().processor;
    assert_eq!(stats.submitted, num_threads as u64 * updates_per_thread);
    assert_eq!(stats.processed + stats.coalesced, stats.submitted);
    assert_eq!(stats.handler_errors, 0);
    assert_eq!(engine.mapper().pair_count(), 64);
}
