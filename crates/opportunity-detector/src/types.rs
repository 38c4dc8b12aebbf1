use chrono::{DateTime, Utc};
use price_store::{PairIndex, VenueIndex};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenIndex(pub u32);

impl TokenIndex {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TokenIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Which way a leg crosses its pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Sell base for quote at `price`.
    BaseToQuote = 0,
    /// Buy base with quote at `1 / price`.
    QuoteToBase = 1,
}

/// One tradable direction of one (pair, venue) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub pair: PairIndex,
    pub venue: VenueIndex,
    pub direction: Direction,
    pub from: TokenIndex,
    pub to: TokenIndex,
}

impl Edge {
    #[inline]
    pub fn same_cell(&self, other: &Edge) -> bool {
        self.pair == other.pair && self.venue == other.venue
    }

    #[inline]
    pub(crate) fn ordinal(&self) -> (u32, u32, u8) {
        (self.pair.0, self.venue.0, self.direction as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapLeg {
    pub pair: String,
    pub venue: String,
    pub token_in: String,
    pub token_out: String,
    pub direction: Direction,
    pub amount_in: f64,
    pub amount_out: f64,
    pub fee: f64,
    /// Version of the exact cell read this leg was priced from.
    pub cell_version: u64,
    pub observed_at_ns: u64,
}

/// A priced cycle. Built once per detection cycle and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    id: Uuid,
    legs: Vec<SwapLeg>,
    amount_in: f64,
    amount_out: f64,
    net_profit: f64,
    profit_ratio: f64,
    confidence: f64,
    detected_at_ns: u64,
}

impl Opportunity {
    pub(crate) fn new(legs: Vec<SwapLeg>, amount_in: f64, amount_out: f64, confidence: f64, detected_at_ns: u64) -> Self {
        let net_profit = amount_out - amount_in;
        Self {
            id: Uuid::new_v4(),
            legs,
            amount_in,
            amount_out,
            net_profit,
            profit_ratio: net_profit / amount_in,
            confidence,
            detected_at_ns,
        }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn legs(&self) -> &[SwapLeg] {
        &self.legs
    }

    #[inline]
    pub fn leg_count(&self) -> usize {
        self.legs.len()
    }

    /// Token the cycle starts and ends in.
    #[inline]
    pub fn start_token(&self) -> &str {
        self.legs.first().map(|leg| leg.token_in.as_str()).unwrap_or_default()
    }

    #[inline]
    pub fn amount_in(&self) -> f64 {
        self.amount_in
    }

    #[inline]
    pub fn amount_out(&self) -> f64 {
        self.amount_out
    }

    /// Post-fee, post-slippage profit in start-token units.
    #[inline]
    pub fn net_profit(&self) -> f64 {
        self.net_profit
    }

    #[inline]
    pub fn profit_ratio(&self) -> f64 {
        self.profit_ratio
    }

    #[inline]
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    #[inline]
    pub fn detected_at_ns(&self) -> u64 {
        self.detected_at_ns
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.detected_at_ns.min(i64::MAX as u64) as i64)
    }

    /// Pair keys this opportunity depends on, in leg order.
    pub fn pairs(&self) -> impl Iterator<Item = &str> {
        self.legs.iter().map(|leg| leg.pair.as_str())
    }
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start_token())?;
        for leg in &self.legs {
            write!(f, " -[{}]-> {}", leg.venue, leg.token_out)?;
        }
        write!(
            f,
            " ratio={:.6} confidence={:.3}",
            self.profit_ratio, self.confidence
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionReport {
    pub opportunities: Vec<Opportunity>,
    pub pairs_scanned: usize,
    pub paths_evaluated: usize,
    pub invalid_routes: usize,
    pub stale_routes: usize,
    pub search_states: usize,
    /// The cycle ran out of time or states; results are partial.
    pub truncated: bool,
    pub elapsed_ns: u64,
}

impl DetectionReport {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.opportunities.is_empty()
    }
}
