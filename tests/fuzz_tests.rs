//! Fuzzing tests to discover edge cases and ensure system robustness
//!
//! These tests use property-based testing and random input generation
//! to find potential bugs and edge cases

use arbcore::*;
use event_processor::{PriceUpdateEvent, UpdateBatch};
use opportunity_detector::{ConfidenceDecay, Direction, Edge, TokenIndex};
use price_store::{now_ns, IndexMapper, Liquidity, PairIndex, Price, VenueIndex};
use proptest::prelude::*;
use std::collections::HashMap;

prop_compose! {
    fn valid_price()(price in 0.0001f64..100_000.0) -> f64 {
        price
    }
}

prop_compose! {
    fn venue_update()(
        pair in 0..4usize,
        venue in 0..3usize,
        price in valid_price(),
        sequence in 1..1_000u64,
    ) -> PriceUpdateEvent {
        let pairs = ["A/B", "B/C", "C/A", "A/C"];
        let venues = ["x", "y", "z"];
        PriceUpdateEvent::new(pairs[pair], venues[venue], price, 10_000.0, 10_000.0 * price, now_ns())
            .with_sequence(sequence)
    }
}

fn engine() -> PricingEngine {
    let mut config = EngineConfig::default();
    config.store.max_pairs = 16;
    config.store.max_venues = 4;
    config.cache.l1_eviction.capacity = Some(64);
    config.processor.worker_threads = 1;
    PricingEngine::in_memory(config).unwrap()
}

proptest! {
    #[test]
    fn fuzz_fixed_point_conversion(value in 0.0f64..1e12) {
        let price = Price::from_f64(value).unwrap();
        let relative = (price.to_f64() - value).abs() / value.max(1.0);
        prop_assert!(relative < 1e-12);
        prop_assert_eq!(Liquidity::from_f64(-value - 1.0), None);
    }

    #[test]
    fn fuzz_reported_opportunities_clear_threshold(
        ab in 0.5f64..4.0,
        bc in 0.5f64..4.0,
        ca in 0.05f64..2.0,
    ) {
        let engine = engine();
        for (pair, price) in [("A/B", ab), ("B/C", bc), ("C/A", ca)] {
            engine.apply_update(&PriceUpdateEvent::new(pair, "x", price, 1e6, 1e6 * price, now_ns())).unwrap();
        }
        let report = engine.detect_now();
        let threshold = engine.config().detector.min_profit_threshold;
        let gross = ab * bc * ca;

        for opportunity in &report.opportunities {
            prop_assert!(opportunity.profit_ratio() > threshold);
            prop_assert!(opportunity.confidence() >= engine.config().detector.min_confidence);
            prop_assert_eq!(opportunity.leg_count(), 3);
        }
        // Three 30 bps fees need more than 0.9% gross edge.
        if gross < 1.0 {
            prop_assert!(report.opportunities.is_empty());
        }
    }

    #[test]
    fn fuzz_batch_keeps_highest_sequence(updates in prop::collection::vec(venue_update(), 1..64)) {
        let mut batch = UpdateBatch::new();
        let mut expected: HashMap<(String, String), u64> = HashMap::new();
        for update in &updates {
            let entry = expected.entry((update.pair_key.clone(), update.venue_key.clone())).or_insert(0);
            *entry = (*entry).max(update.venue_sequence);
            batch.push(update.clone());
        }

        prop_assert_eq!(batch.len(), expected.len());
        prop_assert_eq!(batch.received(), updates.len());
        for update in batch.updates() {
            let key = (update.pair_key.clone(), update.venue_key.clone());
            prop_assert_eq!(update.venue_sequence, expected[&key]);
        }
    }

    #[test]
    fn fuzz_index_mapper_is_injective(keys in prop::collection::hash_set("[A-Z]{2,5}/[A-Z]{2,5}", 1..40)) {
        let mapper = IndexMapper::new(64, 2);
        let mut seen = HashMap::new();
        for key in &keys {
            let (pair, venue) = mapper.get_or_assign(key, "amm").unwrap();
            prop_assert_eq!(venue, VenueIndex(0));
            prop_assert!(seen.insert(pair, key.clone()).is_none());
        }
        for (pair, key) in &seen {
            let stored = mapper.pair_key(*pair);
            prop_assert_eq!(stored.as_deref(), Some(key.as_str()));
        }
    }

    #[test]
    fn fuzz_confidence_stays_in_unit_range(
        age_ms in 0u64..20_000,
        window_ms in 1u64..10_000,
        half_life_ms in 1u64..10_000,
    ) {
        let age_ns = age_ms * 1_000_000;
        let window_ns = window_ms * 1_000_000;
        for decay in [ConfidenceDecay::Linear, ConfidenceDecay::Exponential { half_life_ms }] {
            let confidence = decay.confidence(age_ns, window_ns);
            prop_assert!((0.0..=1.0).contains(&confidence));
        }
    }

    #[test]
    fn fuzz_edges_on_one_cell_collide(pair in 0..1_000u32, venue in 0..32u32) {
        let forward = Edge {
            pair: PairIndex(pair),
            venue: VenueIndex(venue),
            direction: Direction::BaseToQuote,
            from: TokenIndex(0),
            to: TokenIndex(1),
        };
        let reverse = Edge { direction: Direction::QuoteToBase, from: TokenIndex(1), to: TokenIndex(0), ..forward };
        prop_assert!(forward.same_cell(&reverse));
    }
}
