use chrono::{DateTime, Utc};
use opportunity_detector::Opportunity;
use price_store::{Liquidity, Price, PriceData};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventError {
    #[error("Invalid quote for {pair}@{venue}: {reason}")]
    InvalidQuote {
        pair: String,
        venue: String,
        reason: &'static str,
    },
}

/// One normalised price/liquidity observation from a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdateEvent {
    pub pair_key: String,
    pub venue_key: String,
    pub price: f64,
    pub reserve_base: f64,
    pub reserve_quote: f64,
    pub observed_at_ns: u64,
    /// Venue-assigned ordering; 0 means unsequenced.
    pub venue_sequence: u64,
}

impl PriceUpdateEvent {
    pub fn new(
        pair_key: impl Into<String>,
        venue_key: impl Into<String>,
        price: f64,
        reserve_base: f64,
        reserve_quote: f64,
        observed_at_ns: u64,
    ) -> Self {
        Self {
            pair_key: pair_key.into(),
            venue_key: venue_key.into(),
            price,
            reserve_base,
            reserve_quote,
            observed_at_ns,
            venue_sequence: 0,
        }
    }

    #[inline]
    pub fn with_sequence(mut self, venue_sequence: u64) -> Self {
        self.venue_sequence = venue_sequence;
        self
    }

    #[inline]
    pub fn observed_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.observed_at_ns.min(i64::MAX as u64) as i64)
    }

    /// Converts to the fixed-point cell payload. Negative or non-finite
    /// amounts are rejected here rather than stored as zero.
    pub fn to_price_data(&self) -> Result<PriceData, EventError> {
        let invalid = |reason| EventError::InvalidQuote {
            pair: self.pair_key.clone(),
            venue: self.venue_key.clone(),
            reason,
        };
        let price = Price::from_f64(self.price).ok_or_else(|| invalid("price is not a finite non-negative number"))?;
        let reserve_base =
            Liquidity::from_f64(self.reserve_base).ok_or_else(|| invalid("base reserve is not a finite non-negative number"))?;
        let reserve_quote = Liquidity::from_f64(self.reserve_quote)
            .ok_or_else(|| invalid("quote reserve is not a finite non-negative number"))?;
        Ok(PriceData::new(price, reserve_base, reserve_quote, self.observed_at_ns).with_sequence(self.venue_sequence))
    }
}

/// Outbound notification of a detected opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityEvent {
    pub event_id: Uuid,
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub opportunity: Opportunity,
}

impl OpportunityEvent {
    pub fn new(sequence: u64, opportunity: Opportunity) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence,
            published_at: Utc::now(),
            opportunity,
        }
    }

    /// Time from the oldest leg observation to publication.
    pub fn observation_latency_ns(&self) -> u64 {
        let published = self.published_at.timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        self.opportunity
            .legs()
            .iter()
            .map(|leg| leg.observed_at_ns)
            .min()
            .map_or(0, |oldest| published.saturating_sub(oldest))
    }
}
