//! Game simulation modules

pub mod actor;
pub mod arbitration;
pub mod authority;
pub mod collab;
pub mod flag;
pub mod grab;
pub mod incapacitation;
pub mod r#match;
pub mod scoreboard;
pub mod snapshot;
pub mod timer;

pub use r#match::{MatchHandle, MatchRegistry};

use nalgebra::Vector3;
use uuid::Uuid;

use crate::ws::protocol::ClientMsg;

use self::arbitration::AuthorityLink;
use self::collab::{PhysicsSink, Presentation};
use self::grab::ArmTuning;
use self::incapacitation::{RagdollTuning, SquishTuning};
use self::timer::TimerService;

/// Networked player identity inside a match
pub type ActorId = Uuid;

/// Player input received from WebSocket
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub user_id: Uuid,
    pub msg: ClientMsg,
    pub received_at: u64,
}

/// Gameplay tuning for one match
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub arm: ArmTuning,
    pub ragdoll: RagdollTuning,
    pub squish: SquishTuning,
    /// Carry point relative to the holder, in the holder's frame
    pub carry_offset: Vector3<f32>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            arm: ArmTuning::default(),
            ragdoll: RagdollTuning::default(),
            squish: SquishTuning::default(),
            carry_offset: Vector3::new(0.0, 1.0, -0.5),
        }
    }
}

/// Collaborators handed to every state-machine operation for one step
pub struct TickContext<'a> {
    pub timers: &'a mut TimerService,
    pub authority: &'a mut dyn AuthorityLink,
    pub physics: &'a mut dyn PhysicsSink,
    pub presentation: &'a mut dyn Presentation,
    pub tuning: &'a Tuning,
}
