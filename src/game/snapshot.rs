//! Snapshot building

use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::ws::protocol::{ActorSnapshot, GameEvent, ScoreEntry, ServerMsg};

use super::actor::Actor;
use super::flag::FlagSnapshot;

/// Builds snapshots for network transmission
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used for discrete state changes)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// Build a snapshot message
    pub fn build(
        &self,
        tick: u64,
        actors: &HashMap<Uuid, Actor>,
        flag: FlagSnapshot,
        scores: &BTreeMap<Uuid, u32>,
        events: Vec<GameEvent>,
    ) -> ServerMsg {
        let mut actor_snapshots: Vec<ActorSnapshot> =
            actors.values().map(Actor::snapshot).collect();
        actor_snapshots.sort_by_key(|a| a.actor_id);

        let scores = scores
            .iter()
            .map(|(actor_id, score)| ScoreEntry {
                actor_id: *actor_id,
                score: *score,
            })
            .collect();

        ServerMsg::Snapshot {
            tick,
            actors: actor_snapshots,
            flag,
            scores,
            events,
        }
    }
}
