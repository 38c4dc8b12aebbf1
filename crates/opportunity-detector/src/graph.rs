use crate::types::{Direction, Edge, TokenIndex};
use arc_swap::ArcSwap;
use price_store::{IndexError, KeyInterner, KeyKind, PairIndex, VenueIndex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Splits `BASE/QUOTE`. Anything else is not a tradable pair.
pub fn parse_pair_key(pair_key: &str) -> Option<(&str, &str)> {
    let (base, quote) = pair_key.split_once('/')?;
    let (base, quote) = (base.trim(), quote.trim());
    if base.is_empty() || quote.is_empty() || quote.contains('/') || base == quote {
        return None;
    }
    Some((base, quote))
}

/// Directed token graph grown one (pair, venue) cell at a time.
///
/// Each token node owns its outgoing edge list behind an `ArcSwap`, so adding a
/// venue copies one small list and readers never wait on a writer.
pub struct TokenGraph {
    tokens: KeyInterner,
    adjacency: Box<[ArcSwap<Vec<Edge>>]>,
    pair_tokens: Box<[OnceLock<(TokenIndex, TokenIndex)>]>,
    registered: Box<[AtomicBool]>,
    max_venues: u32,
    reverse_edges: bool,
    edges: AtomicUsize,
}

impl TokenGraph {
    pub fn new(max_pairs: u32, max_venues: u32, reverse_edges: bool) -> Self {
        let max_tokens = max_pairs.saturating_mul(2);
        let combinations = max_pairs as usize * max_venues as usize;
        Self {
            tokens: KeyInterner::new(KeyKind::Token, max_tokens),
            adjacency: (0..max_tokens).map(|_| ArcSwap::from_pointee(Vec::new())).collect(),
            pair_tokens: (0..max_pairs).map(|_| OnceLock::new()).collect(),
            registered: (0..combinations).map(|_| AtomicBool::new(false)).collect(),
            max_venues,
            reverse_edges,
            edges: AtomicUsize::new(0),
        }
    }

    /// Adds the edges quoted by one (pair, venue) cell. Returns true the first
    /// time a combination is added; malformed pair keys add nothing.
    pub fn register(&self, pair: PairIndex, pair_key: &str, venue: VenueIndex) -> Result<bool, IndexError> {
        let Some(flag) = self.registered.get(self.offset(pair, venue)) else {
            return Ok(false);
        };
        if flag.load(Ordering::Acquire) {
            return Ok(false);
        }

        let (base, quote) = match self.resolve_tokens(pair, pair_key) {
            Ok(Some(tokens)) => tokens,
            Ok(None) => {
                tracing::debug!(pair = pair_key, "Ignoring malformed pair key");
                flag.store(true, Ordering::Release);
                return Ok(false);
            }
            Err(error) => return Err(error),
        };

        if flag.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        self.push_edge(Edge {
            pair,
            venue,
            direction: Direction::BaseToQuote,
            from: base,
            to: quote,
        });
        if self.reverse_edges {
            self.push_edge(Edge {
                pair,
                venue,
                direction: Direction::QuoteToBase,
                from: quote,
                to: base,
            });
        }
        Ok(true)
    }

    #[inline]
    pub fn is_registered(&self, pair: PairIndex, venue: VenueIndex) -> bool {
        self.registered
            .get(self.offset(pair, venue))
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Current outgoing edges of `token`.
    #[inline]
    pub fn edges_from(&self, token: TokenIndex) -> Arc<Vec<Edge>> {
        match self.adjacency.get(token.index()) {
            Some(edges) => edges.load_full(),
            None => Arc::new(Vec::new()),
        }
    }

    #[inline]
    pub fn pair_tokens(&self, pair: PairIndex) -> Option<(TokenIndex, TokenIndex)> {
        self.pair_tokens.get(pair.index()).and_then(|slot| slot.get().copied())
    }

    #[inline]
    pub fn token_index(&self, token: &str) -> Option<TokenIndex> {
        self.tokens.lookup(token).map(TokenIndex)
    }

    #[inline]
    pub fn token_key(&self, token: TokenIndex) -> Option<Arc<str>> {
        self.tokens.key(token.0)
    }

    #[inline]
    pub fn token_count(&self) -> u32 {
        self.tokens.len()
    }

    #[inline]
    pub fn edge_count(&self) -> usize {
        self.edges.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reverse_edges(&self) -> bool {
        self.reverse_edges
    }

    fn resolve_tokens(
        &self,
        pair: PairIndex,
        pair_key: &str,
    ) -> Result<Option<(TokenIndex, TokenIndex)>, IndexError> {
        let Some(slot) = self.pair_tokens.get(pair.index()) else {
            return Ok(None);
        };
        if let Some(tokens) = slot.get() {
            return Ok(Some(*tokens));
        }

        let Some((base, quote)) = parse_pair_key(pair_key) else {
            return Ok(None);
        };
        let base = TokenIndex(self.tokens.get_or_intern(base)?);
        let quote = TokenIndex(self.tokens.get_or_intern(quote)?);
        // Interning is idempotent, so a racing initialiser stores the same value.
        Ok(Some(*slot.get_or_init(|| (base, quote))))
    }

    fn push_edge(&self, edge: Edge) {
        if let Some(node) = self.adjacency.get(edge.from.index()) {
            node.rcu(|current| {
                let mut next = Vec::with_capacity(current.len() + 1);
                next.extend(current.iter().copied());
                next.push(edge);
                next
            });
            self.edges.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    fn offset(&self, pair: PairIndex, venue: VenueIndex) -> usize {
        if venue.0 >= self.max_venues {
            return usize::MAX;
        }
        pair.index() * self.max_venues as usize + venue.index()
    }
}
