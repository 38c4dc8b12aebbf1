use crate::graph::TokenGraph;
use crate::profit::{quote_leg, ConfidenceDecay, RouteError};
use crate::search::{canonical_cycle, CycleSearch, SearchBudget};
use crate::touched::TouchedQueue;
use crate::types::{DetectionReport, Direction, Edge, Opportunity, SwapLeg, TokenIndex};
use metrics::{counter, histogram};
use price_store::{now_ns, CellReader, CellSnapshot, IndexMapper, PairIndex, VenueIndex};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Minimum net profit as a fraction of the trade amount.
    pub min_profit_threshold: f64,
    /// Longest cycle searched, 2 to 5 legs.
    pub max_leg_depth: usize,
    /// Set by the owning engine from its shared window.
    #[serde(skip)]
    pub staleness_window_ms: u64,
    pub detection_cycle_budget_ms: u64,
    pub default_fee_bps: u32,
    pub venue_fees_bps: HashMap<String, u32>,
    /// Start amount for every cycle, in units of the start token.
    pub trade_amount: f64,
    pub min_confidence: f64,
    pub confidence_decay: ConfidenceDecay,
    pub max_search_states: usize,
    /// Also trade each cell quote->base at `1 / price`.
    pub reverse_edges: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_profit_threshold: 0.001,
            max_leg_depth: 4,
            staleness_window_ms: 5_000,
            detection_cycle_budget_ms: 5,
            default_fee_bps: 30,
            venue_fees_bps: HashMap::new(),
            trade_amount: 1.0,
            min_confidence: 0.5,
            confidence_decay: ConfidenceDecay::Linear,
            max_search_states: 100_000,
            reverse_edges: false,
        }
    }
}

impl DetectorConfig {
    #[inline]
    fn staleness_window_ns(&self) -> u64 {
        self.staleness_window_ms.saturating_mul(1_000_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectorStats {
    pub cycles: u64,
    pub opportunities: u64,
    pub invalid_routes: u64,
    pub stale_routes: u64,
    pub truncated_cycles: u64,
    pub tokens: u32,
    pub edges: usize,
    pub pending_pairs: usize,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    opportunities: AtomicU64,
    invalid_routes: AtomicU64,
    stale_routes: AtomicU64,
    truncated_cycles: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct LegQuote {
    edge: Edge,
    amount_in: f64,
    amount_out: f64,
    fee: f64,
    version: u64,
    observed_at_ns: u64,
}

#[derive(Debug, Clone)]
struct Candidate {
    legs: Vec<LegQuote>,
    amount_in: f64,
    amount_out: f64,
    profit_ratio: f64,
    confidence: f64,
}

/// Every cell is read at most once per cycle, so all legs of an opportunity
/// agree on what they saw.
struct CycleReads<'a> {
    reader: &'a dyn CellReader,
    cells: HashMap<(PairIndex, VenueIndex), Option<CellSnapshot>>,
}

impl<'a> CycleReads<'a> {
    fn new(reader: &'a dyn CellReader) -> Self {
        Self {
            reader,
            cells: HashMap::new(),
        }
    }

    #[inline]
    fn read(&mut self, pair: PairIndex, venue: VenueIndex) -> Option<CellSnapshot> {
        let reader = self.reader;
        *self
            .cells
            .entry((pair, venue))
            .or_insert_with(|| reader.read_cell(pair, venue).value())
    }
}

struct CycleState<'a> {
    reads: CycleReads<'a>,
    best: HashMap<Vec<(u32, u32, u8)>, Candidate>,
    report: DetectionReport,
    now_ns: u64,
}

/// Searches the cells touched since the last cycle for profitable loops.
///
/// Ingestion calls [`touch`] after each write; a detection thread calls
/// [`run_cycle`]. Nothing here takes a lock shared with writers: cells are
/// read through the seqlock and the token graph is swapped per node.
///
/// [`touch`]: OpportunityDetector::touch
/// [`run_cycle`]: OpportunityDetector::run_cycle
pub struct OpportunityDetector {
    config: DetectorConfig,
    reader: Arc<dyn CellReader>,
    mapper: Arc<IndexMapper>,
    graph: TokenGraph,
    touched: TouchedQueue,
    fees: Box<[OnceLock<f64>]>,
    counters: Counters,
}

impl OpportunityDetector {
    pub fn new(reader: Arc<dyn CellReader>, mapper: Arc<IndexMapper>, config: DetectorConfig) -> Self {
        let max_pairs = mapper.max_pairs();
        let max_venues = mapper.max_venues();
        Self {
            graph: TokenGraph::new(max_pairs, max_venues, config.reverse_edges),
            touched: TouchedQueue::new(max_pairs),
            fees: (0..max_venues).map(|_| OnceLock::new()).collect(),
            counters: Counters::default(),
            config,
            reader,
            mapper,
        }
    }

    #[inline]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    #[inline]
    pub fn graph(&self) -> &TokenGraph {
        &self.graph
    }

    /// Adds a (pair, venue) combination to the token graph. True if it was new.
    pub fn register(&self, pair: PairIndex, venue: VenueIndex) -> bool {
        if self.graph.is_registered(pair, venue) {
            return false;
        }
        let Some(pair_key) = self.mapper.pair_key(pair) else {
            return false;
        };
        match self.graph.register(pair, &pair_key, venue) {
            Ok(added) => added,
            Err(error) => {
                tracing::warn!(%pair, %venue, %error, "Could not add pair to the token graph");
                false
            }
        }
    }

    /// Queues a pair for the next cycle. Repeated touches coalesce.
    #[inline]
    pub fn touch(&self, pair: PairIndex) -> bool {
        self.touched.touch(pair)
    }

    #[inline]
    pub fn pending_pairs(&self) -> usize {
        self.touched.len()
    }

    /// Drains the touched queue and detects against it.
    pub fn run_cycle(&self) -> DetectionReport {
        let touched = self.touched.drain();
        if touched.is_empty() {
            return DetectionReport::default();
        }
        self.detect(&touched)
    }

    pub fn detect(&self, touched: &[PairIndex]) -> DetectionReport {
        self.detect_at(touched, now_ns())
    }

    /// Detects with an explicit clock, which fixes every quote's age.
    pub fn detect_at(&self, touched: &[PairIndex], now_ns: u64) -> DetectionReport {
        let started = Instant::now();
        let mut seen = HashSet::with_capacity(touched.len());
        let touched: Vec<PairIndex> = touched.iter().copied().filter(|pair| seen.insert(*pair)).collect();
        for &pair in &touched {
            for venue in self.mapper.venues_for(pair) {
                self.register(pair, venue);
            }
        }

        let mut state = CycleState {
            reads: CycleReads::new(self.reader.as_ref()),
            best: HashMap::new(),
            report: DetectionReport {
                pairs_scanned: touched.len(),
                ..DetectionReport::default()
            },
            now_ns,
        };

        for &pair in &touched {
            self.scan_spreads(pair, &mut state);
        }

        let mut budget = SearchBudget::new(
            Duration::from_millis(self.config.detection_cycle_budget_ms),
            self.config.max_search_states,
        );
        let max_legs = self.config.max_leg_depth.min(5);
        if max_legs >= 3 {
            let mut starts: Vec<TokenIndex> = Vec::new();
            for &pair in &touched {
                if let Some((base, quote)) = self.graph.pair_tokens(pair) {
                    for token in [base, quote] {
                        if !starts.contains(&token) {
                            starts.push(token);
                        }
                    }
                }
            }

            let mut search = CycleSearch::new();
            for start in starts {
                if budget.is_exhausted() {
                    break;
                }
                search.run(&self.graph, start, 3, max_legs, &mut budget, |path| {
                    if path.iter().any(|edge| seen.contains(&edge.pair)) {
                        self.consider(path, &mut state);
                    }
                });
            }
        }

        let CycleState { best, mut report, .. } = state;
        report.search_states = budget.states();
        report.truncated = budget.is_exhausted();
        if report.truncated {
            self.counters.truncated_cycles.fetch_add(1, Ordering::Relaxed);
            counter!("detector_budget_exceeded_total").increment(1);
            tracing::debug!(
                states = report.search_states,
                budget_ms = self.config.detection_cycle_budget_ms,
                "Detection cycle truncated; emitting partial results"
            );
        }

        let mut opportunities: Vec<Opportunity> = best
            .into_values()
            .map(|candidate| self.build(candidate, now_ns))
            .collect();
        opportunities.sort_by(|a, b| b.profit_ratio().total_cmp(&a.profit_ratio()));
        report.opportunities = opportunities;
        report.elapsed_ns = started.elapsed().as_nanos() as u64;

        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        self.counters
            .opportunities
            .fetch_add(report.opportunities.len() as u64, Ordering::Relaxed);
        self.counters
            .invalid_routes
            .fetch_add(report.invalid_routes as u64, Ordering::Relaxed);
        self.counters
            .stale_routes
            .fetch_add(report.stale_routes as u64, Ordering::Relaxed);
        counter!("detector_opportunities_total").increment(report.opportunities.len() as u64);
        histogram!("detector_cycle_latency_ns").record(report.elapsed_ns as f64);
        tracing::trace!(
            pairs = report.pairs_scanned,
            paths = report.paths_evaluated,
            found = report.opportunities.len(),
            elapsed_ns = report.elapsed_ns,
            "Detection cycle finished"
        );
        report
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            opportunities: self.counters.opportunities.load(Ordering::Relaxed),
            invalid_routes: self.counters.invalid_routes.load(Ordering::Relaxed),
            stale_routes: self.counters.stale_routes.load(Ordering::Relaxed),
            truncated_cycles: self.counters.truncated_cycles.load(Ordering::Relaxed),
            tokens: self.graph.token_count(),
            edges: self.graph.edge_count(),
            pending_pairs: self.touched.len(),
        }
    }

    /// Fee as a fraction for `venue`.
    pub fn fee_for(&self, venue: VenueIndex) -> f64 {
        let resolve = || {
            let bps = self
                .mapper
                .venue_key(venue)
                .and_then(|key| self.config.venue_fees_bps.get(&*key).copied())
                .unwrap_or(self.config.default_fee_bps);
            bps as f64 / 10_000.0
        };
        match self.fees.get(venue.index()) {
            Some(slot) => *slot.get_or_init(resolve),
            None => resolve(),
        }
    }

    /// Same pair on two venues: buy base where it is cheap, sell where it is dear.
    fn scan_spreads(&self, pair: PairIndex, state: &mut CycleState<'_>) {
        let Some((base, quote)) = self.graph.pair_tokens(pair) else {
            return;
        };
        let quotes: Vec<(VenueIndex, f64)> = self
            .mapper
            .venues_for(pair)
            .into_iter()
            .filter_map(|venue| {
                let snapshot = state.reads.read(pair, venue)?;
                (!snapshot.data.price.is_zero()).then(|| (venue, snapshot.data.price.to_f64()))
            })
            .collect();

        for &(low, low_price) in &quotes {
            for &(high, high_price) in &quotes {
                if low == high || high_price <= low_price {
                    continue;
                }
                let spread = high_price / low_price - 1.0;
                let hurdle = self.fee_for(low) + self.fee_for(high) + self.config.min_profit_threshold;
                if spread <= hurdle {
                    continue;
                }

                let path = [
                    Edge {
                        pair,
                        venue: low,
                        direction: Direction::QuoteToBase,
                        from: quote,
                        to: base,
                    },
                    Edge {
                        pair,
                        venue: high,
                        direction: Direction::BaseToQuote,
                        from: base,
                        to: quote,
                    },
                ];
                self.consider(&path, state);
            }
        }
    }

    fn consider(&self, path: &[Edge], state: &mut CycleState<'_>) {
        state.report.paths_evaluated += 1;
        let candidate = match self.evaluate(path, state) {
            Ok(candidate) => candidate,
            Err(error) => {
                if error.is_stale() {
                    state.report.stale_routes += 1;
                } else {
                    state.report.invalid_routes += 1;
                    counter!("detector_invalid_routes_total").increment(1);
                }
                tracing::trace!(%error, "Discarded route");
                return;
            }
        };

        if candidate.profit_ratio <= self.config.min_profit_threshold
            || candidate.confidence < self.config.min_confidence
        {
            return;
        }

        match state.best.entry(canonical_cycle(path)) {
            Entry::Occupied(mut existing) => {
                if candidate.profit_ratio > existing.get().profit_ratio {
                    existing.insert(candidate);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
        }
    }

    fn evaluate(&self, path: &[Edge], state: &mut CycleState<'_>) -> Result<Candidate, RouteError> {
        let window_ns = self.config.staleness_window_ns();
        let amount_in = self.config.trade_amount;
        let mut amount = amount_in;
        let mut confidence = 1.0f64;
        let mut legs = Vec::with_capacity(path.len());

        for edge in path {
            let snapshot = state.reads.read(edge.pair, edge.venue).ok_or(RouteError::Missing {
                pair: edge.pair,
                venue: edge.venue,
            })?;
            let age_ns = snapshot.data.age_ns(state.now_ns);
            if age_ns > window_ns {
                return Err(RouteError::Stale {
                    pair: edge.pair,
                    venue: edge.venue,
                    age_ms: age_ns / 1_000_000,
                });
            }
            confidence = confidence.min(self.config.confidence_decay.confidence(age_ns, window_ns));

            let fee = self.fee_for(edge.venue);
            let amount_out = quote_leg(edge, &snapshot.data, amount, fee)?;
            legs.push(LegQuote {
                edge: *edge,
                amount_in: amount,
                amount_out,
                fee,
                version: snapshot.version,
                observed_at_ns: snapshot.data.observed_at_ns,
            });
            amount = amount_out;
        }

        Ok(Candidate {
            legs,
            amount_in,
            amount_out: amount,
            profit_ratio: (amount - amount_in) / amount_in,
            confidence,
        })
    }

    fn build(&self, candidate: Candidate, now_ns: u64) -> Opportunity {
        let name = |key: Option<Arc<str>>| key.map(|key| key.to_string()).unwrap_or_default();
        let legs = candidate
            .legs
            .iter()
            .map(|leg| SwapLeg {
                pair: name(self.mapper.pair_key(leg.edge.pair)),
                venue: name(self.mapper.venue_key(leg.edge.venue)),
                token_in: name(self.graph.token_key(leg.edge.from)),
                token_out: name(self.graph.token_key(leg.edge.to)),
                direction: leg.edge.direction,
                amount_in: leg.amount_in,
                amount_out: leg.amount_out,
                fee: leg.fee,
                cell_version: leg.version,
                observed_at_ns: leg.observed_at_ns,
            })
            .collect();
        Opportunity::new(
            legs,
            candidate.amount_in,
            candidate.amount_out,
            candidate.confidence,
            now_ns,
        )
    }
}
