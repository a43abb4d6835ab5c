//! Peer ranking by query success.
//!
//! The work manager prefers peers that have recently answered queries and
//! demotes peers whose responses keep getting rejected or timing out, so a
//! slow or unhelpful peer naturally stops receiving work while it keeps
//! failing.

use std::collections::HashMap;

const INITIAL_SCORE: i32 = 0;
const MAX_SCORE: i32 = 32;
const MIN_SCORE: i32 = -32;

/// Success-rate ranking over the known peers.
///
/// Owned by the work-manager task; no interior locking.
#[derive(Debug, Default)]
pub struct PeerRanking {
    scores: HashMap<String, i32>,
}

impl PeerRanking {
    /// An empty ranking.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer at the neutral score. Known peers keep their score.
    pub fn add_peer(&mut self, addr: &str) {
        self.scores.entry(addr.to_string()).or_insert(INITIAL_SCORE);
    }

    /// Forget a peer entirely.
    pub fn remove_peer(&mut self, addr: &str) {
        self.scores.remove(addr);
    }

    /// Credit a successfully answered query.
    pub fn reward(&mut self, addr: &str) {
        let score = self.scores.entry(addr.to_string()).or_insert(INITIAL_SCORE);
        *score = (*score + 1).min(MAX_SCORE);
    }

    /// Debit a failed or rejected query.
    pub fn punish(&mut self, addr: &str) {
        let score = self.scores.entry(addr.to_string()).or_insert(INITIAL_SCORE);
        *score = (*score - 1).max(MIN_SCORE);
    }

    /// Order addresses best-first. Unknown addresses rank last.
    pub fn order(&self, addrs: &mut [String]) {
        addrs.sort_by_key(|addr| {
            std::cmp::Reverse(self.scores.get(addr).copied().unwrap_or(MIN_SCORE))
        });
    }

    /// Current score, for diagnostics.
    pub fn score(&self, addr: &str) -> Option<i32> {
        self.scores.get(addr).copied()
    }
}
