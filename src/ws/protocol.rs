//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::arbitration::DetachedArm;
use crate::game::collab::{BodyReport, ColliderId, Contact, PhysicsCommand, PresentationCommand};
use crate::game::flag::FlagSnapshot;
use crate::game::grab::{AimSettings, SlotSnapshot, SLOT_COUNT};
use crate::game::incapacitation::{IncapacitationEvent, IncapacitationState};

/// Error code sent to a peer whose join reached a match with no free slot
pub const MATCH_FULL: &str = "match_full";

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Request to join a match
    JoinMatch {
        /// Optional specific match ID, otherwise the first match with room is used
        match_id: Option<Uuid>,
        #[serde(default)]
        display_name: Option<String>,
    },

    /// The owner's physics state for the current step
    PhysicsReport { report: BodyReport },

    /// Grab input pressed for a slot (0 = left, 1 = right)
    GrabStarted { slot: usize },

    /// Grab input released for a slot
    GrabEnded { slot: usize },

    /// Any input activity (struggles out of ragdoll/squish)
    AnyAction,

    /// Collision contact began
    ContactBegin { contact: Contact },

    /// Collision contact persisted with new values
    ContactUpdate { contact: Contact },

    /// Collision contact ended
    ContactEnd { surface: ColliderId },

    /// Impulse computed by collision resolution
    Impulse { impulse: Vector3<f32> },

    /// The actor touched the flag trigger
    EnterFlag,

    /// The actor entered the capture point trigger
    EnterCapturePoint,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Leave current match
    LeaveMatch,
}

impl ClientMsg {
    /// Messages that drive the simulation (dropped once a match has ended)
    pub fn is_gameplay(&self) -> bool {
        !matches!(
            self,
            ClientMsg::JoinMatch { .. } | ClientMsg::Ping { .. } | ClientMsg::LeaveMatch
        )
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        user_id: Uuid,
        server_time: u64,
    },

    /// Confirmation of match join
    MatchJoined {
        match_id: Uuid,
        /// Seed for deterministic random generation
        seed: u64,
        /// Joining user and the actor bound to their connection
        user_id: Uuid,
        actor_id: Uuid,
        /// All players in the match at join time
        players: Vec<PlayerInfo>,
        /// Aim geometry the owning client casts with
        aim: AimSettings,
    },

    /// Player joined the match
    PlayerJoined {
        player: PlayerInfo,
    },

    /// Player left the match
    PlayerLeft {
        actor_id: Uuid,
        reason: String,
    },

    /// Game state snapshot (sent at regular intervals)
    Snapshot {
        /// Server tick number
        tick: u64,
        actors: Vec<ActorSnapshot>,
        flag: FlagSnapshot,
        scores: Vec<ScoreEntry>,
        /// Events that occurred since last snapshot
        events: Vec<GameEvent>,
    },

    /// Physics commands for the owning client to apply this step
    Physics {
        actor_id: Uuid,
        commands: Vec<PhysicsCommand>,
    },

    /// Camera instructions for the owning client
    Presentation {
        actor_id: Uuid,
        commands: Vec<PresentationCommand>,
    },

    /// Match countdown starting
    MatchCountdown {
        seconds_remaining: u32,
    },

    /// Match has started
    MatchStarted {
        tick: u64,
    },

    /// Match has ended
    MatchEnd {
        winner_actor_id: Option<Uuid>,
        /// Match statistics
        stats: MatchStats,
    },

    /// Per-client end of match result
    GameOver {
        won: bool,
    },

    /// Error message
    Error {
        code: String,
        message: String,
        /// Only this user should see the error
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<Uuid>,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<Uuid>,
    },
}

/// RGB color in 0..1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

/// Player info for lobby/join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub actor_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub color: Color,
}

/// Actor state in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorSnapshot {
    pub actor_id: Uuid,
    pub position: Point3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub velocity: Vector3<f32>,
    pub incapacitation: IncapacitationState,
    pub slots: [SlotSnapshot; SLOT_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub actor_id: Uuid,
    pub score: u32,
}

/// Discrete game events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GameEvent {
    /// Ragdoll or squish began or ended
    Incapacitation {
        actor_id: Uuid,
        transition: IncapacitationEvent,
    },

    FlagClaimed {
        actor_id: Uuid,
    },

    FlagSubmitted {
        actor_id: Uuid,
        score: u32,
    },

    /// Flag returned to rest without a capture (holder left)
    FlagReset,

    /// Detached arm left behind by a break
    ArmSpawned {
        arm: DetachedArm,
    },
}

/// Match statistics at end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchStats {
    pub duration_secs: u32,
    pub total_players: u32,
    pub player_stats: Vec<PlayerMatchStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerMatchStats {
    pub actor_id: Uuid,
    pub display_name: String,
    pub score: u32,
    pub placement: u32,
}
