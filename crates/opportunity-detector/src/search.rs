use crate::graph::TokenGraph;
use crate::types::{Edge, TokenIndex};
use std::time::{Duration, Instant};

const ROOT: usize = usize::MAX;

/// How often the wall clock is consulted while expanding states.
const DEADLINE_CHECK_INTERVAL: usize = 64;

/// Time and state allowance for one detection cycle, shared by every search in it.
#[derive(Debug)]
pub struct SearchBudget {
    deadline: Instant,
    max_states: usize,
    states: usize,
    exhausted: bool,
}

impl SearchBudget {
    pub fn new(time: Duration, max_states: usize) -> Self {
        Self {
            deadline: Instant::now() + time,
            max_states,
            states: 0,
            exhausted: false,
        }
    }

    /// Charges one state. False once the budget is gone; it stays gone.
    #[inline]
    pub fn spend(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        self.states += 1;
        if self.states > self.max_states
            || (self.states % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= self.deadline)
        {
            self.exhausted = true;
            return false;
        }
        true
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    #[inline]
    pub fn states(&self) -> usize {
        self.states
    }
}

#[derive(Debug, Clone, Copy)]
struct SearchState {
    token: TokenIndex,
    edge: Option<Edge>,
    parent: usize,
    depth: usize,
}

/// Bounded breadth-first enumeration of simple cycles through one token.
///
/// States live in a flat `Vec` with parent indices and a moving head, so the
/// frontier is never shifted and paths are rebuilt only when a cycle closes.
/// Buffers are reused across runs.
#[derive(Debug, Default)]
pub struct CycleSearch {
    states: Vec<SearchState>,
    path: Vec<Edge>,
}

impl CycleSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `on_cycle` for every cycle `start -> .. -> start` of `min_legs..=max_legs`
    /// legs that reuses no cell and revisits no intermediate token.
    pub fn run<F>(
        &mut self,
        graph: &TokenGraph,
        start: TokenIndex,
        min_legs: usize,
        max_legs: usize,
        budget: &mut SearchBudget,
        mut on_cycle: F,
    ) where
        F: FnMut(&[Edge]),
    {
        self.states.clear();
        self.states.push(SearchState {
            token: start,
            edge: None,
            parent: ROOT,
            depth: 0,
        });

        let mut head = 0;
        while head < self.states.len() {
            let current = head;
            head += 1;
            let SearchState { token, depth, .. } = self.states[current];

            for edge in graph.edges_from(token).iter() {
                if !budget.spend() {
                    return;
                }
                if self.uses_cell(current, edge) {
                    continue;
                }

                if edge.to == start {
                    if depth + 1 >= min_legs {
                        self.rebuild_path(current, *edge);
                        on_cycle(&self.path);
                    }
                    continue;
                }

                if depth + 1 >= max_legs || self.visits(current, edge.to) {
                    continue;
                }
                self.states.push(SearchState {
                    token: edge.to,
                    edge: Some(*edge),
                    parent: current,
                    depth: depth + 1,
                });
            }
        }
    }

    fn ancestry(&self, from: usize) -> impl Iterator<Item = &SearchState> {
        let mut next = from;
        std::iter::from_fn(move || {
            if next == ROOT {
                return None;
            }
            let state = &self.states[next];
            next = state.parent;
            Some(state)
        })
    }

    #[inline]
    fn visits(&self, from: usize, token: TokenIndex) -> bool {
        self.ancestry(from).any(|state| state.token == token)
    }

    #[inline]
    fn uses_cell(&self, from: usize, edge: &Edge) -> bool {
        self.ancestry(from)
            .filter_map(|state| state.edge.as_ref())
            .any(|used| used.same_cell(edge))
    }

    fn rebuild_path(&mut self, from: usize, closing: Edge) {
        let mut path: Vec<Edge> = self.ancestry(from).filter_map(|state| state.edge).collect();
        path.reverse();
        path.push(closing);
        self.path = path;
    }
}

/// Rotation-independent identity of a cycle, used to merge the same loop found
/// from different start tokens.
pub fn canonical_cycle(path: &[Edge]) -> Vec<(u32, u32, u8)> {
    let ordinals: Vec<(u32, u32, u8)> = path.iter().map(Edge::ordinal).collect();
    (0..ordinals.len())
        .map(|shift| {
            ordinals[shift..]
                .iter()
                .chain(ordinals[..shift].iter())
                .copied()
                .collect::<Vec<_>>()
        })
        .min()
        .unwrap_or_default()
}
