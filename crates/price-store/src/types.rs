use fixed::FixedU128;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 64 fractional bits: exact enough for sub-wei ratios, wide enough for any quote.
pub type AmountFixed = FixedU128<typenum::U64>;

macro_rules! fixed_amount {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        #[repr(transparent)]
        pub struct $name(AmountFixed);

        impl $name {
            pub const ZERO: Self = Self(AmountFixed::ZERO);
            pub const MAX: Self = Self(AmountFixed::MAX);

            /// Saturating conversion; NaN and negative inputs collapse to zero.
            #[inline]
            pub fn new(value: f64) -> Self {
                if !value.is_finite() {
                    return if value == f64::INFINITY { Self::MAX } else { Self::ZERO };
                }
                if value <= 0.0 {
                    return Self::ZERO;
                }
                Self(AmountFixed::saturating_from_num(value))
            }

            /// Exact conversion, `None` for negative, non-finite or overflowing input.
            #[inline]
            pub fn from_f64(value: f64) -> Option<Self> {
                if !value.is_finite() || value < 0.0 {
                    return None;
                }
                AmountFixed::checked_from_num(value).map(Self)
            }

            #[inline]
            pub fn from_bits(bits: u128) -> Self {
                Self(AmountFixed::from_bits(bits))
            }

            #[inline]
            pub fn to_bits(self) -> u128 {
                self.0.to_bits()
            }

            #[inline]
            pub fn to_f64(self) -> f64 {
                self.0.to_num()
            }

            #[inline]
            pub fn is_zero(self) -> bool {
                self.0 == AmountFixed::ZERO
            }

            /// Splits the raw bits into the two words stored by a cell.
            #[inline]
            pub(crate) fn to_words(self) -> (u64, u64) {
                let bits = self.to_bits();
                ((bits >> 64) as u64, bits as u64)
            }

            #[inline]
            pub(crate) fn from_words(hi: u64, lo: u64) -> Self {
                Self::from_bits(((hi as u128) << 64) | lo as u128)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        // Raw bits on the wire so non-self-describing codecs round-trip exactly.
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u128(self.to_bits())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                u128::deserialize(deserializer).map(Self::from_bits)
            }
        }
    };
}

fixed_amount!(
    /// Quote-per-base price of a pair on one venue.
    Price
);

fixed_amount!(
    /// Reserve / depth of one side of a pool, in that token's units.
    Liquidity
);

/// Dense pair coordinate handed out by the index mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PairIndex(pub u32);

/// Dense venue coordinate handed out by the index mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VenueIndex(pub u32);

impl PairIndex {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl VenueIndex {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PairIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl fmt::Display for VenueIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Payload of one price cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceData {
    pub price: Price,
    pub reserve_base: Liquidity,
    pub reserve_quote: Liquidity,
    /// Observation time at the venue, nanoseconds since the Unix epoch.
    pub observed_at_ns: u64,
    /// Venue-assigned sequence number; zero means unsequenced.
    pub venue_sequence: u64,
}

impl PriceData {
    pub fn new(price: Price, reserve_base: Liquidity, reserve_quote: Liquidity, observed_at_ns: u64) -> Self {
        Self {
            price,
            reserve_base,
            reserve_quote,
            observed_at_ns,
            venue_sequence: 0,
        }
    }

    pub fn with_sequence(mut self, venue_sequence: u64) -> Self {
        self.venue_sequence = venue_sequence;
        self
    }

    #[inline]
    pub fn age_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.observed_at_ns)
    }
}

/// A consistent copy of one cell, tagged with the version it was read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSnapshot {
    pub pair: PairIndex,
    pub venue: VenueIndex,
    pub data: PriceData,
    pub version: u64,
}

/// Result of reading one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRead {
    Value(CellSnapshot),
    NotFound,
    /// A writer kept the cell busy through the retry; treat as a miss.
    Stale,
}

impl CellRead {
    #[inline]
    pub fn value(self) -> Option<CellSnapshot> {
        match self {
            CellRead::Value(snapshot) => Some(snapshot),
            CellRead::NotFound | CellRead::Stale => None,
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, CellRead::NotFound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: u64 },
    /// The cell already holds a newer venue sequence; nothing changed.
    Superseded { stored_sequence: u64 },
}

impl WriteOutcome {
    #[inline]
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}
