//! Match state and authoritative tick loop

use dashmap::DashMap;
use nalgebra::Point3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MatchSettings;
use crate::util::time::{tick_step, unix_millis, SIMULATION_TPS, SNAPSHOT_TPS};
use crate::ws::protocol::{
    ClientMsg, Color, GameEvent, MatchStats, PlayerInfo, PlayerMatchStats, ServerMsg,
    MATCH_FULL,
};

use super::actor::Actor;
use super::arbitration::{Arbiter, Decision, Request};
use super::authority::{OwnershipGate, PeerId, Role};
use super::collab::{PhysicsCommand, PresentationCommand};
use super::flag::{FlagToken, Pose};
use super::scoreboard::MatchScoreboard;
use super::snapshot::SnapshotBuilder;
use super::timer::TimerService;
use super::{ActorId, PlayerInput, TickContext, Tuning};

/// Longest display name kept from a join request
const MAX_DISPLAY_NAME: usize = 24;

/// Inputs queued longer than this before a tick picks them up are logged
const SLOW_INPUT_MS: u64 = 100;

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Waiting for players
    Waiting,
    /// Countdown before start
    Countdown,
    /// Match in progress
    InProgress,
    /// Match ended
    Ended,
}

/// Fixed map layout: where the flag rests and where actors spawn
#[derive(Debug, Clone)]
pub struct Arena {
    pub flag_rest: Pose,
    pub spawn_points: Vec<Point3<f32>>,
}

impl Default for Arena {
    fn default() -> Self {
        // Eight spawn points on a ring around the flag
        let spawn_points = (0..8)
            .map(|i| {
                let angle = i as f32 * std::f32::consts::TAU / 8.0;
                Point3::new(12.0 * angle.cos(), 1.0, 12.0 * angle.sin())
            })
            .collect();

        Self {
            flag_rest: Pose::at(Point3::new(0.0, 1.0, 0.0)),
            spawn_points,
        }
    }
}

/// Commands produced for one actor's owner during a tick
#[derive(Debug, Default)]
struct Outbox {
    physics: Vec<PhysicsCommand>,
    presentation: Vec<PresentationCommand>,
}

/// Match state (owned by match task)
pub struct MatchState {
    pub id: Uuid,
    pub seed: u64,
    pub phase: MatchPhase,
    pub tick: u64,
    pub settings: MatchSettings,
    pub tuning: Tuning,
    pub arena: Arena,
    pub actors: HashMap<ActorId, Actor>,
    /// Connection to actor binding
    pub peers: HashMap<PeerId, ActorId>,
    pub flag: FlagToken,
    pub scoreboard: MatchScoreboard,
    arbiter: Arbiter,
    timers: TimerService,
    outboxes: HashMap<ActorId, Outbox>,
    pub rng: ChaCha8Rng,
    next_spawn: usize,
    pub start_time: Option<u64>,
    pub countdown_remaining: Duration,
}

impl MatchState {
    pub fn new(id: Uuid, seed: u64, settings: MatchSettings) -> Self {
        let arena = Arena::default();
        Self {
            id,
            seed,
            phase: MatchPhase::Waiting,
            tick: 0,
            settings,
            tuning: Tuning::default(),
            flag: FlagToken::new(arena.flag_rest, Role::Authority),
            arena,
            actors: HashMap::new(),
            peers: HashMap::new(),
            scoreboard: MatchScoreboard::new(settings.win_score),
            arbiter: Arbiter::new(),
            timers: TimerService::new(),
            outboxes: HashMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_spawn: 0,
            start_time: None,
            countdown_remaining: settings.countdown,
        }
    }

    /// Spawn points are handed out round-robin
    pub fn next_spawn_point(&mut self) -> Point3<f32> {
        let count = self.arena.spawn_points.len();
        if count == 0 {
            return Point3::origin();
        }
        let point = self.arena.spawn_points[self.next_spawn % count];
        self.next_spawn = (self.next_spawn + 1) % count;
        point
    }

    pub fn random_color(&mut self) -> Color {
        Color {
            r: self.rng.gen_range(0.0..1.0),
            g: self.rng.gen_range(0.0..1.0),
            b: self.rng.gen_range(0.0..1.0),
        }
    }

    pub fn actor_for(&self, peer: PeerId) -> Option<ActorId> {
        self.peers.get(&peer).copied()
    }

    fn actor_ids(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self.actors.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Run `f` against one actor with this match's collaborators
    fn with_actor<R>(
        &mut self,
        actor_id: ActorId,
        f: impl FnOnce(&mut Actor, &mut TickContext<'_>) -> R,
    ) -> Option<R> {
        let actor = self.actors.get_mut(&actor_id)?;
        let outbox = self.outboxes.entry(actor_id).or_default();
        let mut ctx = TickContext {
            timers: &mut self.timers,
            authority: &mut self.arbiter,
            physics: &mut outbox.physics,
            presentation: &mut outbox.presentation,
            tuning: &self.tuning,
        };
        Some(f(actor, &mut ctx))
    }

    /// True if any replicated state changed since the last call
    fn take_dirty(&mut self) -> bool {
        let mut dirty = self.flag.take_dirty();
        dirty |= self.scoreboard.take_dirty();
        for actor in self.actors.values_mut() {
            dirty |= actor.take_dirty();
        }
        dirty
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<PlayerInput>,
    pub snapshot_tx: broadcast::Sender<ServerMsg>,
    pub player_count: Arc<AtomicUsize>,
}

impl MatchHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }
}

/// Why a join could not be routed to a match
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("match {0} not found")]
    NotFound(Uuid),

    #[error("match {0} is full")]
    Full(Uuid),
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().player_count())
            .sum()
    }

    /// Id and player count of every match
    pub fn summaries(&self) -> Vec<(Uuid, usize)> {
        self.matches
            .iter()
            .map(|m| (*m.key(), m.value().player_count()))
            .collect()
    }

    /// Find a match with available slots
    pub fn find_available_match(&self, max_players: usize) -> Option<MatchHandle> {
        for entry in self.matches.iter() {
            if entry.value().player_count() < max_players {
                return Some(entry.value().clone());
            }
        }
        None
    }

    /// Route a join: the requested match, else the first with room, else a new one.
    /// New matches run on their own task and leave the registry when they finish.
    pub fn join_or_create(
        self: &Arc<Self>,
        match_id: Option<Uuid>,
        settings: MatchSettings,
    ) -> Result<MatchHandle, JoinError> {
        if let Some(id) = match_id {
            let handle = self.get(&id).ok_or(JoinError::NotFound(id))?;
            if handle.player_count() >= settings.max_players {
                return Err(JoinError::Full(id));
            }
            return Ok(handle);
        }

        if let Some(handle) = self.find_available_match(settings.max_players) {
            return Ok(handle);
        }

        let id = Uuid::new_v4();
        let seed: u64 = rand::thread_rng().gen();
        let (game_match, handle) = GameMatch::new(id, seed, settings);
        self.insert(handle.clone());

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            game_match.run().await;
            registry.remove(&id);
            info!(match_id = %id, "Match removed from registry");
        });

        Ok(handle)
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative game match
pub struct GameMatch {
    state: MatchState,
    input_rx: mpsc::Receiver<PlayerInput>,
    snapshot_tx: broadcast::Sender<ServerMsg>,
    snapshot_builder: SnapshotBuilder,
    player_count: Arc<AtomicUsize>,
    /// Events accumulated until the next snapshot
    pending_events: Vec<GameEvent>,
}

impl GameMatch {
    /// Create a new match
    pub fn new(id: Uuid, seed: u64, settings: MatchSettings) -> (Self, MatchHandle) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (snapshot_tx, _) = broadcast::channel(256);
        let player_count = Arc::new(AtomicUsize::new(0));

        let handle = MatchHandle {
            id,
            input_tx,
            snapshot_tx: snapshot_tx.clone(),
            player_count: player_count.clone(),
        };

        let snapshot_interval = SIMULATION_TPS / SNAPSHOT_TPS;
        let game_match = Self {
            state: MatchState::new(id, seed, settings),
            input_rx,
            snapshot_tx,
            snapshot_builder: SnapshotBuilder::new(snapshot_interval),
            player_count,
            pending_events: Vec::new(),
        };

        (game_match, handle)
    }

    /// Run the authoritative tick loop
    pub async fn run(mut self) {
        info!(match_id = %self.state.id, "Match created");

        let mut tick_interval = interval(tick_step());
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;

            // Drain input queue
            self.process_inputs();

            // Run simulation tick
            self.run_tick();

            // Commands go out every tick they are produced
            self.flush_outboxes();

            if self.state.take_dirty() {
                self.snapshot_builder.force_next();
            }

            if self.snapshot_builder.should_send() {
                let snapshot = self.build_snapshot();
                let _ = self.snapshot_tx.send(snapshot);
            }

            if self.state.phase == MatchPhase::Ended {
                info!(match_id = %self.state.id, "Match ended");
                break;
            }

            if self.state.actors.is_empty() && self.state.phase != MatchPhase::Waiting {
                info!(match_id = %self.state.id, "All players left, ending match");
                break;
            }
        }

        let stats = self.build_match_stats();
        let _ = self.snapshot_tx.send(ServerMsg::MatchEnd {
            winner_actor_id: self.state.scoreboard.winner(),
            stats,
        });
    }

    /// Process all pending inputs from players
    fn process_inputs(&mut self) {
        while let Ok(input) = self.input_rx.try_recv() {
            self.handle_input(input);
        }
    }

    fn handle_input(&mut self, input: PlayerInput) {
        let PlayerInput {
            user_id,
            msg,
            received_at,
        } = input;

        let queued_ms = unix_millis().saturating_sub(received_at);
        if queued_ms > SLOW_INPUT_MS {
            debug!(match_id = %self.state.id, user_id = %user_id, queued_ms, "Input queued longer than expected");
        }

        if self.state.phase == MatchPhase::Ended && msg.is_gameplay() {
            debug!(match_id = %self.state.id, user_id = %user_id, "Dropping input after match end");
            return;
        }

        match msg {
            ClientMsg::JoinMatch { display_name, .. } => {
                self.handle_join(user_id, display_name);
            }
            ClientMsg::Ping { t } => {
                let _ = self.snapshot_tx.send(ServerMsg::Pong {
                    t,
                    recipient: Some(user_id),
                });
            }
            ClientMsg::LeaveMatch => {
                self.handle_leave(user_id);
            }
            gameplay => self.handle_gameplay(user_id, gameplay),
        }
    }

    /// Handle player join request
    fn handle_join(&mut self, user_id: Uuid, display_name: Option<String>) {
        if self.state.peers.contains_key(&user_id) {
            warn!(user_id = %user_id, "Player already in match");
            return;
        }

        if self.state.actors.len() >= self.state.settings.max_players {
            let _ = self.snapshot_tx.send(ServerMsg::Error {
                code: MATCH_FULL.to_string(),
                message: "Match is full".to_string(),
                recipient: Some(user_id),
            });
            return;
        }

        let display_name = display_name
            .map(|name| name.trim().chars().take(MAX_DISPLAY_NAME).collect::<String>())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("Player_{}", &user_id.to_string()[..8]));

        let actor_id = Uuid::new_v4();
        let spawn = self.state.next_spawn_point();
        let color = self.state.random_color();
        let actor = Actor::new(
            actor_id,
            OwnershipGate::hosted(user_id),
            display_name,
            color,
            spawn,
        );
        let player_info = actor.info();

        self.state.actors.insert(actor_id, actor);
        self.state.peers.insert(user_id, actor_id);
        self.state.scoreboard.register(actor_id);
        self.state.with_actor(actor_id, |actor, ctx| actor.respawn(ctx));
        self.player_count
            .store(self.state.actors.len(), Ordering::Relaxed);

        // Notify all players of the new player
        let _ = self.snapshot_tx.send(ServerMsg::PlayerJoined {
            player: player_info,
        });

        let mut players: Vec<PlayerInfo> = self.state.actors.values().map(Actor::info).collect();
        players.sort_by_key(|p| p.actor_id);

        let _ = self.snapshot_tx.send(ServerMsg::MatchJoined {
            match_id: self.state.id,
            seed: self.state.seed,
            user_id,
            actor_id,
            players,
            aim: self.state.tuning.arm.aim_settings(),
        });

        info!(
            match_id = %self.state.id,
            user_id = %user_id,
            actor_id = %actor_id,
            player_count = self.state.actors.len(),
            "Player joined match"
        );

        // Check if we should start countdown
        if self.state.phase == MatchPhase::Waiting
            && self.state.actors.len() >= self.state.settings.min_players
        {
            self.state.phase = MatchPhase::Countdown;
            self.state.countdown_remaining = self.state.settings.countdown;
            let _ = self.snapshot_tx.send(ServerMsg::MatchCountdown {
                seconds_remaining: self.state.settings.countdown.as_secs() as u32,
            });
        }
        self.snapshot_builder.force_next();
    }

    /// Handle player leave: the actor goes away with everything pending against it
    fn handle_leave(&mut self, user_id: Uuid) {
        let Some(actor_id) = self.state.peers.remove(&user_id) else {
            return;
        };

        self.state.actors.remove(&actor_id);
        self.state.outboxes.remove(&actor_id);
        let cancelled = self.state.timers.cancel_actor(actor_id);
        self.state.arbiter.forget_actor(actor_id);
        self.state.scoreboard.remove(actor_id);

        if self.state.flag.release_holder(actor_id) {
            info!(match_id = %self.state.id, actor_id = %actor_id, "Flag holder left, flag reset");
            self.pending_events.push(GameEvent::FlagReset);
        }

        self.player_count
            .store(self.state.actors.len(), Ordering::Relaxed);

        let _ = self.snapshot_tx.send(ServerMsg::PlayerLeft {
            actor_id,
            reason: "disconnected".to_string(),
        });

        info!(
            match_id = %self.state.id,
            user_id = %user_id,
            actor_id = %actor_id,
            cancelled_timers = cancelled,
            "Player left match"
        );

        if self.state.phase == MatchPhase::Countdown
            && self.state.actors.len() < self.state.settings.min_players
        {
            self.state.phase = MatchPhase::Waiting;
            info!(match_id = %self.state.id, "Not enough players, countdown cancelled");
        }
        self.snapshot_builder.force_next();
    }

    /// Gameplay messages only ever drive the sender's own actor
    fn handle_gameplay(&mut self, peer: PeerId, msg: ClientMsg) {
        let Some(actor_id) = self.state.actor_for(peer) else {
            debug!(match_id = %self.state.id, user_id = %peer, "Input from peer without an actor");
            return;
        };
        let admitted = self
            .state
            .actors
            .get(&actor_id)
            .is_some_and(|actor| actor.gate().admits(peer));
        if !admitted {
            warn!(match_id = %self.state.id, user_id = %peer, actor_id = %actor_id, "Input rejected by ownership gate");
            return;
        }

        // Reports are kept in every phase so positions stay live
        if let ClientMsg::PhysicsReport { report } = msg {
            if let Some(actor) = self.state.actors.get_mut(&actor_id) {
                actor.apply_report(report);
            }
            return;
        }

        if self.state.phase != MatchPhase::InProgress {
            return;
        }

        self.state.with_actor(actor_id, |actor, ctx| match msg {
            ClientMsg::GrabStarted { slot } => {
                let outcome = actor.grab_started(slot, ctx);
                debug!(actor_id = %actor.id(), slot, ?outcome, "Grab");
            }
            ClientMsg::GrabEnded { slot } => {
                let outcome = actor.grab_ended(slot);
                debug!(actor_id = %actor.id(), slot, ?outcome, "Release");
            }
            ClientMsg::AnyAction => actor.any_action(ctx),
            ClientMsg::ContactBegin { contact } => actor.contact_begin(contact, ctx),
            ClientMsg::ContactUpdate { contact } => actor.contact_update(contact, ctx),
            ClientMsg::ContactEnd { surface } => actor.contact_end(surface),
            ClientMsg::Impulse { impulse } => actor.add_impulse(impulse, ctx),
            ClientMsg::EnterFlag => {
                ctx.authority.request(peer, Request::ClaimFlag { actor: actor.id() });
            }
            ClientMsg::EnterCapturePoint => {
                ctx.authority.request(peer, Request::SubmitFlag { actor: actor.id() });
            }
            ClientMsg::JoinMatch { .. }
            | ClientMsg::PhysicsReport { .. }
            | ClientMsg::Ping { .. }
            | ClientMsg::LeaveMatch => {}
        });
    }

    /// Run a single simulation tick
    fn run_tick(&mut self) {
        self.state.tick += 1;

        match self.state.phase {
            MatchPhase::Waiting => {
                // Do nothing, wait for players
            }
            MatchPhase::Countdown => {
                self.state.countdown_remaining =
                    self.state.countdown_remaining.saturating_sub(tick_step());
                if self.state.countdown_remaining.is_zero() {
                    self.start_match();
                }
            }
            MatchPhase::InProgress => self.simulate(),
            MatchPhase::Ended => {
                // Match is over
            }
        }
    }

    fn start_match(&mut self) {
        self.state.phase = MatchPhase::InProgress;
        self.state.start_time = Some(unix_millis());
        self.reset_match();

        let _ = self.snapshot_tx.send(ServerMsg::MatchStarted {
            tick: self.state.tick,
        });
        info!(match_id = %self.state.id, players = self.state.actors.len(), "Match started!");
    }

    /// Every actor back to spawn, flag at rest, scores zeroed
    fn reset_match(&mut self) {
        for actor_id in self.state.actor_ids() {
            self.state.with_actor(actor_id, |actor, ctx| actor.respawn(ctx));
        }
        self.state.flag.reset();
        self.state.scoreboard.reset();
        self.snapshot_builder.force_next();
    }

    /// Advance timers, step every actor, fire due timers, arbitrate,
    /// then move the flag and check for a winner
    fn simulate(&mut self) {
        self.state.timers.advance(tick_step());

        for actor_id in self.state.actor_ids() {
            self.state.with_actor(actor_id, |actor, ctx| actor.step(ctx));
        }

        // One at a time, so a cancel during dispatch wins over a same-tick completion
        while let Some(key) = self.state.timers.pop_due() {
            let fired = self
                .state
                .with_actor(key.actor, |actor, ctx| actor.on_timer(key.kind, ctx));
            if fired.is_none() {
                debug!(match_id = %self.state.id, actor_id = %key.actor, "Timer for departed actor");
            }
        }

        self.arbitrate();
        self.track_flag();

        for actor in self.state.actors.values_mut() {
            self.pending_events.extend(actor.drain_events());
        }

        self.check_win_condition();
    }

    /// Apply queued requests in arrival order
    fn arbitrate(&mut self) {
        let state = &mut self.state;
        let actors = &state.actors;
        let decisions = state.arbiter.process(&mut state.flag, &mut state.scoreboard, |id| {
            actors.get(&id).map(|actor| actor.gate().owner())
        });

        self.pending_events
            .extend(decisions.into_iter().map(|decision| match decision {
                Decision::FlagClaimed { actor } => GameEvent::FlagClaimed { actor_id: actor },
                Decision::FlagSubmitted { actor, score } => GameEvent::FlagSubmitted {
                    actor_id: actor,
                    score,
                },
                Decision::ArmSpawned { arm } => GameEvent::ArmSpawned { arm },
            }));
    }

    /// The held flag follows its holder's carry point
    fn track_flag(&mut self) {
        let Some(holder) = self.state.flag.holder() else {
            return;
        };
        match self.state.actors.get(&holder) {
            Some(actor) => {
                let (position, rotation) = actor.carry_pose(self.state.tuning.carry_offset);
                self.state.flag.track(position, rotation);
            }
            None => {
                warn!(match_id = %self.state.id, actor_id = %holder, "Flag holder missing, returning flag to rest");
                self.state.flag.reset();
                self.pending_events.push(GameEvent::FlagReset);
            }
        }
    }

    /// Check win condition
    fn check_win_condition(&mut self) {
        if self.state.phase != MatchPhase::InProgress {
            return;
        }

        if let Some(winner) = self.state.scoreboard.winner() {
            info!(match_id = %self.state.id, actor_id = %winner, "Win score reached");
            self.state.phase = MatchPhase::Ended;
            self.snapshot_builder.force_next();
        }
    }

    fn flush_outboxes(&mut self) {
        for (actor_id, outbox) in self.state.outboxes.iter_mut() {
            if !outbox.physics.is_empty() {
                let _ = self.snapshot_tx.send(ServerMsg::Physics {
                    actor_id: *actor_id,
                    commands: std::mem::take(&mut outbox.physics),
                });
            }
            if !outbox.presentation.is_empty() {
                let _ = self.snapshot_tx.send(ServerMsg::Presentation {
                    actor_id: *actor_id,
                    commands: std::mem::take(&mut outbox.presentation),
                });
            }
        }
    }

    fn build_snapshot(&mut self) -> ServerMsg {
        self.snapshot_builder.build(
            self.state.tick,
            &self.state.actors,
            self.state.flag.snapshot(),
            self.state.scoreboard.scores(),
            std::mem::take(&mut self.pending_events),
        )
    }

    /// Build match stats
    fn build_match_stats(&self) -> MatchStats {
        let duration = self
            .state
            .start_time
            .map(|start| (unix_millis().saturating_sub(start) / 1000) as u32)
            .unwrap_or(0);

        let mut player_stats: Vec<PlayerMatchStats> = self
            .state
            .actors
            .values()
            .map(|actor| PlayerMatchStats {
                actor_id: actor.id(),
                display_name: actor.display_name().to_string(),
                score: self.state.scoreboard.score(actor.id()),
                placement: 0, // Will be calculated below
            })
            .collect();

        // Placements by score, highest first
        player_stats.sort_by(|a, b| b.score.cmp(&a.score));
        for (i, stat) in player_stats.iter_mut().enumerate() {
            stat.placement = (i + 1) as u32;
        }

        MatchStats {
            duration_secs: duration,
            total_players: self.state.actors.len() as u32,
            player_stats,
        }
    }
}
