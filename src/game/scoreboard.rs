//! Per-actor scores and the win threshold

use std::collections::BTreeMap;

use super::ActorId;

/// Scoreboard collaborator invoked when a flag is submitted
pub trait Scoreboard {
    /// Add `amount` to `actor`'s score and return the new total
    fn add_score(&mut self, actor: ActorId, amount: u32) -> u32;
}

/// Authority-side scoreboard for one match
#[derive(Debug, Clone)]
pub struct MatchScoreboard {
    scores: BTreeMap<ActorId, u32>,
    win_score: u32,
    winner: Option<ActorId>,
    dirty: bool,
}

impl MatchScoreboard {
    pub fn new(win_score: u32) -> Self {
        Self {
            scores: BTreeMap::new(),
            win_score: win_score.max(1),
            winner: None,
            dirty: false,
        }
    }

    pub fn register(&mut self, actor: ActorId) {
        self.scores.entry(actor).or_insert(0);
        self.dirty = true;
    }

    pub fn remove(&mut self, actor: ActorId) {
        if self.scores.remove(&actor).is_some() {
            self.dirty = true;
        }
    }

    pub fn score(&self, actor: ActorId) -> u32 {
        self.scores.get(&actor).copied().unwrap_or(0)
    }

    pub fn scores(&self) -> &BTreeMap<ActorId, u32> {
        &self.scores
    }

    /// First actor to reach the win score, once decided it never changes
    pub fn winner(&self) -> Option<ActorId> {
        self.winner
    }

    pub fn reset(&mut self) {
        for score in self.scores.values_mut() {
            *score = 0;
        }
        self.winner = None;
        self.dirty = true;
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl Scoreboard for MatchScoreboard {
    fn add_score(&mut self, actor: ActorId, amount: u32) -> u32 {
        let score = self.scores.entry(actor).or_insert(0);
        *score = score.saturating_add(amount);
        let total = *score;
        self.dirty = true;

        if self.winner.is_none() && total >= self.win_score {
            self.winner = Some(actor);
        }
        total
    }
}
