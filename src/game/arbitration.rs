//! Request/validate/apply/broadcast for contested state
//!
//! Owners never write contested state directly. They send a [`Request`]
//! through an [`AuthorityLink`]; at the authority, the [`Arbiter`] replays
//! requests in arrival order and re-checks each precondition before
//! mutating, so the first of two racing claims wins and the second finds the
//! precondition already failed.

use std::collections::VecDeque;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::authority::PeerId;
use super::flag::FlagToken;
use super::grab::SLOT_COUNT;
use super::scoreboard::Scoreboard;
use super::ActorId;

/// State change requested by an owner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    ClaimFlag {
        actor: ActorId,
    },
    SubmitFlag {
        actor: ActorId,
    },
    /// Spawn the detached arm left behind by a break
    SpawnArm {
        actor: ActorId,
        slot: usize,
        origin: Point3<f32>,
        impulse: Vector3<f32>,
    },
}

impl Request {
    pub fn actor(&self) -> ActorId {
        match self {
            Request::ClaimFlag { actor }
            | Request::SubmitFlag { actor }
            | Request::SpawnArm { actor, .. } => *actor,
        }
    }
}

/// Why the authority refused a request. The requester is never notified;
/// it converges on the next broadcast.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArbitrationError {
    #[error("flag is already held by {0}")]
    FlagAlreadyHeld(ActorId),

    #[error("actor {0} does not hold the flag")]
    NotHolder(ActorId),

    #[error("peer {peer} does not own actor {actor}")]
    NotOwner { peer: PeerId, actor: ActorId },

    #[error("unknown actor {0}")]
    UnknownActor(ActorId),

    #[error("slot index {0} out of range")]
    InvalidSlot(usize),

    #[error("only the authority may apply this change")]
    NotAuthority,
}

/// Route from an owner to the authority
pub trait AuthorityLink {
    fn request(&mut self, from: PeerId, request: Request);
}

/// Requests queued by a non-authoritative node for sending
impl AuthorityLink for Vec<(PeerId, Request)> {
    fn request(&mut self, from: PeerId, request: Request) {
        self.push((from, request));
    }
}

/// Detached arm object spawned at the authority after a break
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetachedArm {
    pub id: Uuid,
    pub owner: ActorId,
    pub slot: usize,
    pub origin: Point3<f32>,
    pub impulse: Vector3<f32>,
}

/// Applied outcome of an accepted request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    FlagClaimed { actor: ActorId },
    FlagSubmitted { actor: ActorId, score: u32 },
    ArmSpawned { arm: DetachedArm },
}

/// Authority-side request queue
#[derive(Debug, Default)]
pub struct Arbiter {
    pending: VecDeque<(PeerId, Request)>,
}

impl AuthorityLink for Arbiter {
    fn request(&mut self, from: PeerId, request: Request) {
        self.pending.push_back((from, request));
    }
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop queued requests for an actor that has left
    pub fn forget_actor(&mut self, actor: ActorId) {
        self.pending.retain(|(_, request)| request.actor() != actor);
    }

    /// Apply every queued request in arrival order
    pub fn process(
        &mut self,
        flag: &mut FlagToken,
        scoreboard: &mut dyn Scoreboard,
        owner_of: impl Fn(ActorId) -> Option<PeerId>,
    ) -> Vec<Decision> {
        let mut decisions = Vec::new();

        while let Some((from, request)) = self.pending.pop_front() {
            match Self::resolve(from, request, flag, scoreboard, &owner_of) {
                Ok(decision) => decisions.push(decision),
                Err(e) => {
                    debug!(peer = %from, actor = %request.actor(), reason = %e, "Arbitration rejected");
                }
            }
        }

        decisions
    }

    fn resolve(
        from: PeerId,
        request: Request,
        flag: &mut FlagToken,
        scoreboard: &mut dyn Scoreboard,
        owner_of: &impl Fn(ActorId) -> Option<PeerId>,
    ) -> Result<Decision, ArbitrationError> {
        let actor = request.actor();
        let owner = owner_of(actor).ok_or(ArbitrationError::UnknownActor(actor))?;
        if owner != from {
            return Err(ArbitrationError::NotOwner { peer: from, actor });
        }

        match request {
            Request::ClaimFlag { actor } => {
                flag.claim(actor)?;
                info!(actor_id = %actor, "Flag claimed");
                Ok(Decision::FlagClaimed { actor })
            }
            Request::SubmitFlag { actor } => {
                flag.submit(actor)?;
                let score = scoreboard.add_score(actor, 1);
                info!(actor_id = %actor, score, "Flag submitted");
                Ok(Decision::FlagSubmitted { actor, score })
            }
            Request::SpawnArm {
                actor,
                slot,
                origin,
                impulse,
            } => {
                if slot >= SLOT_COUNT {
                    return Err(ArbitrationError::InvalidSlot(slot));
                }
                Ok(Decision::ArmSpawned {
                    arm: DetachedArm {
                        id: Uuid::new_v4(),
                        owner: actor,
                        slot,
                        origin,
                        impulse: -impulse,
                    },
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::authority::Role;
    use crate::game::flag::Pose;
    use crate::game::scoreboard::MatchScoreboard;

    fn setup() -> (Arbiter, FlagToken, MatchScoreboard) {
        (
            Arbiter::new(),
            FlagToken::new(Pose::at(Point3::origin()), Role::Authority),
            MatchScoreboard::new(3),
        )
    }

    #[test]
    fn racing_claims_resolve_to_first_arrival() {
        let (mut arbiter, mut flag, mut scores) = setup();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        arbiter.request(a, Request::ClaimFlag { actor: a });
        arbiter.request(b, Request::ClaimFlag { actor: b });
        let decisions = arbiter.process(&mut flag, &mut scores, Some);

        assert_eq!(decisions, vec![Decision::FlagClaimed { actor: a }]);
        assert_eq!(flag.holder(), Some(a));
        assert_eq!(arbiter.pending(), 0);
    }

    #[test]
    fn request_for_foreign_actor_is_rejected() {
        let (mut arbiter, mut flag, mut scores) = setup();
        let a = Uuid::new_v4();
        let intruder = Uuid::new_v4();

        arbiter.request(intruder, Request::ClaimFlag { actor: a });
        let decisions = arbiter.process(&mut flag, &mut scores, Some);

        assert!(decisions.is_empty());
        assert_eq!(flag.holder(), None);
    }

    #[test]
    fn submit_awards_one_point_to_holder() {
        let (mut arbiter, mut flag, mut scores) = setup();
        let a = Uuid::new_v4();

        arbiter.request(a, Request::ClaimFlag { actor: a });
        arbiter.request(a, Request::SubmitFlag { actor: a });
        let decisions = arbiter.process(&mut flag, &mut scores, Some);

        assert_eq!(decisions[1], Decision::FlagSubmitted { actor: a, score: 1 });
        assert_eq!(scores.score(a), 1);
        assert!(flag.is_at_rest());
    }

    #[test]
    fn spawn_arm_validates_slot_and_inverts_impulse() {
        let (mut arbiter, mut flag, mut scores) = setup();
        let a = Uuid::new_v4();
        let impulse = Vector3::new(1.0, 2.0, 3.0);

        arbiter.request(
            a,
            Request::SpawnArm {
                actor: a,
                slot: 5,
                origin: Point3::origin(),
                impulse,
            },
        );
        arbiter.request(
            a,
            Request::SpawnArm {
                actor: a,
                slot: 1,
                origin: Point3::origin(),
                impulse,
            },
        );
        let decisions = arbiter.process(&mut flag, &mut scores, Some);

        assert_eq!(decisions.len(), 1);
        match decisions[0] {
            Decision::ArmSpawned { arm } => {
                assert_eq!(arm.slot, 1);
                assert_eq!(arm.impulse, -impulse);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn forgotten_actor_requests_are_dropped() {
        let (mut arbiter, mut flag, mut scores) = setup();
        let a = Uuid::new_v4();
        arbiter.request(a, Request::ClaimFlag { actor: a });
        arbiter.forget_actor(a);

        assert!(arbiter.process(&mut flag, &mut scores, Some).is_empty());
    }
}
