use crate::types::{Direction, Edge};
use price_store::{PairIndex, PriceData, VenueIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a candidate path was dropped. Never fatal to the cycle.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum RouteError {
    #[error("No readable quote for {pair}@{venue}")]
    Missing { pair: PairIndex, venue: VenueIndex },
    #[error("Quote for {pair}@{venue} is {age_ms}ms old")]
    Stale { pair: PairIndex, venue: VenueIndex, age_ms: u64 },
    #[error("Zero price on {pair}@{venue}")]
    ZeroPrice { pair: PairIndex, venue: VenueIndex },
    #[error("Zero reserve on {pair}@{venue}")]
    ZeroReserve { pair: PairIndex, venue: VenueIndex },
    #[error("Output {amount_out} exceeds reserve {reserve_out} on {pair}@{venue}")]
    InsufficientLiquidity {
        pair: PairIndex,
        venue: VenueIndex,
        amount_out: f64,
        reserve_out: f64,
    },
    #[error("Non-finite output on {pair}@{venue}")]
    NonFinite { pair: PairIndex, venue: VenueIndex },
}

impl RouteError {
    #[inline]
    pub fn is_stale(&self) -> bool {
        matches!(self, RouteError::Stale { .. } | RouteError::Missing { .. })
    }
}

/// How confidence falls off with the age of a leg's quote.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfidenceDecay {
    /// `1 - age / staleness_window`.
    #[default]
    Linear,
    /// Halves every `half_life_ms`.
    Exponential { half_life_ms: u64 },
}

impl ConfidenceDecay {
    pub fn confidence(&self, age_ns: u64, staleness_window_ns: u64) -> f64 {
        let score = match *self {
            ConfidenceDecay::Linear => {
                if staleness_window_ns == 0 {
                    return if age_ns == 0 { 1.0 } else { 0.0 };
                }
                1.0 - age_ns as f64 / staleness_window_ns as f64
            }
            ConfidenceDecay::Exponential { half_life_ms } => {
                let half_life_ns = half_life_ms.max(1) as f64 * 1_000_000.0;
                0.5f64.powf(age_ns as f64 / half_life_ns)
            }
        };
        score.clamp(0.0, 1.0)
    }
}

/// Constant-product style output for one leg.
///
/// The fee comes off the input, then the marginal `rate` is discounted by the
/// depth of the input reserve: `out = a * rate * R_in / (R_in + a)`.
pub fn quote_leg(edge: &Edge, data: &PriceData, amount_in: f64, fee: f64) -> Result<f64, RouteError> {
    let (pair, venue) = (edge.pair, edge.venue);
    if data.price.is_zero() {
        return Err(RouteError::ZeroPrice { pair, venue });
    }
    let price = data.price.to_f64();
    let (rate, reserve_in, reserve_out) = match edge.direction {
        Direction::BaseToQuote => (price, data.reserve_base, data.reserve_quote),
        Direction::QuoteToBase => (1.0 / price, data.reserve_quote, data.reserve_base),
    };
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(RouteError::ZeroReserve { pair, venue });
    }

    let (reserve_in, reserve_out) = (reserve_in.to_f64(), reserve_out.to_f64());
    let effective = amount_in * (1.0 - fee);
    let amount_out = effective * rate * reserve_in / (reserve_in + effective);
    if !amount_out.is_finite() || amount_out <= 0.0 {
        return Err(RouteError::NonFinite { pair, venue });
    }
    if amount_out > reserve_out {
        return Err(RouteError::InsufficientLiquidity {
            pair,
            venue,
            amount_out,
            reserve_out,
        });
    }
    Ok(amount_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenIndex;
    use price_store::{Liquidity, Price};

    fn edge(direction: Direction) -> Edge {
        Edge {
            pair: PairIndex(0),
            venue: VenueIndex(0),
            direction,
            from: TokenIndex(0),
            to: TokenIndex(1),
        }
    }

    fn data(price: f64, base: f64, quote: f64) -> PriceData {
        PriceData::new(Price::new(price), Liquidity::new(base), Liquidity::new(quote), 0)
    }

    #[test]
    fn test_deep_pool_quotes_near_rate() {
        let out = quote_leg(&edge(Direction::BaseToQuote), &data(2000.0, 1e9, 2e12), 1.0, 0.0).unwrap();
        assert!((out - 2000.0).abs() < 1e-3);
    }

    #[test]
    fn test_fee_and_slippage_reduce_output() {
        let shallow = data(2.0, 100.0, 200.0);
        let no_fee = quote_leg(&edge(Direction::BaseToQuote), &shallow, 10.0, 0.0).unwrap();
        // 10 * 2 * 100 / 110
        assert!((no_fee - 200.0 / 11.0).abs() < 1e-9);

        let with_fee = quote_leg(&edge(Direction::BaseToQuote), &shallow, 10.0, 0.003).unwrap();
        assert!(with_fee < no_fee);
    }

    #[test]
    fn test_inverse_direction_uses_reciprocal() {
        let out = quote_leg(&edge(Direction::QuoteToBase), &data(4.0, 1e12, 4e12), 8.0, 0.0).unwrap();
        assert!((out - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_cells_are_route_errors() {
        let e = edge(Direction::BaseToQuote);
        assert!(matches!(quote_leg(&e, &data(0.0, 1.0, 1.0), 1.0, 0.0), Err(RouteError::ZeroPrice { .. })));
        assert!(matches!(quote_leg(&e, &data(1.0, 0.0, 1.0), 1.0, 0.0), Err(RouteError::ZeroReserve { .. })));
        assert!(matches!(quote_leg(&e, &data(1.0, 1.0, 0.0), 1.0, 0.0), Err(RouteError::ZeroReserve { .. })));
        assert!(matches!(
            quote_leg(&e, &data(1000.0, 10.0, 1.0), 5.0, 0.0),
            Err(RouteError::InsufficientLiquidity { .. })
        ));
    }

    #[test]
    fn test_confidence_curves() {
        let window = 1_000_000_000;
        assert_eq!(ConfidenceDecay::Linear.confidence(0, window), 1.0);
        assert!((ConfidenceDecay::Linear.confidence(window / 4, window) - 0.75).abs() < 1e-12);
        assert_eq!(ConfidenceDecay::Linear.confidence(2 * window, window), 0.0);

        let exponential = ConfidenceDecay::Exponential { half_life_ms: 100 };
        assert!((exponential.confidence(100_000_000, window) - 0.5).abs() < 1e-12);
        assert!((exponential.confidence(200_000_000, window) - 0.25).abs() < 1e-12);
    }
}
