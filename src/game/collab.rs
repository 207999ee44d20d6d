//! Collaborator seams: what the physics engine reports in, and what the core
//! asks the physics engine and the presentation layer to do.

use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::ActorId;

/// Collider identity as assigned by the physics collaborator
pub type ColliderId = u64;

/// Rigid body identity as assigned by the physics collaborator
pub type BodyId = u64;

/// Gameplay tag carried by a collider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColliderTag {
    #[default]
    Untagged,
    /// The capture-the-flag token
    Flag,
    /// Surfaces that arms must never attach to
    NoConnection,
}

/// One ray or sphere-cast hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AimHit {
    pub collider: ColliderId,
    pub point: Point3<f32>,
    pub normal: Vector3<f32>,
    pub distance: f32,
    /// Rigid body attached to the collider, if any, at the time of the hit
    pub body: Option<BodyState>,
    #[serde(default)]
    pub tag: ColliderTag,
}

/// Result of one slot's aim query: primary ray, then sphere-cast fallback
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AimProbe {
    pub ray: Option<AimHit>,
    pub sphere: Option<AimHit>,
}

/// Pose of a rigid body an arm is anchored to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyState {
    pub id: BodyId,
    pub position: Point3<f32>,
    pub rotation: UnitQuaternion<f32>,
    /// Fixed bodies are never pulled; the actor is pulled toward them instead
    pub kinematic: bool,
}

/// The ragdoll's designated root (hips) segment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootSegment {
    pub position: Point3<f32>,
    pub speed: f32,
}

/// Everything the owner's physics engine reports about its actor for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyReport {
    pub position: Point3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub velocity: Vector3<f32>,
    pub root: Option<RootSegment>,
    /// Per-slot aim probes; `None` when the camera reference is unavailable
    pub aim: [Option<AimProbe>; 2],
    /// Bodies currently anchored by either slot. A body missing here has gone away.
    #[serde(default)]
    pub bodies: Vec<BodyState>,
}

impl BodyReport {
    pub fn at(position: Point3<f32>) -> Self {
        Self {
            position,
            rotation: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            root: Some(RootSegment {
                position,
                speed: 0.0,
            }),
            aim: [Some(AimProbe::default()); 2],
            bodies: Vec::new(),
        }
    }

    pub fn body(&self, id: BodyId) -> Option<&BodyState> {
        self.bodies.iter().find(|b| b.id == id)
    }
}

/// A collision contact between the actor and a surface
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub surface: ColliderId,
    pub point: Point3<f32>,
    pub normal: Vector3<f32>,
    /// Accumulated contact impulse
    pub impulse: Vector3<f32>,
    /// Whether the surface is itself a networked object (actors can be parented to it)
    #[serde(default)]
    pub networked: bool,
}

/// Body a force or impulse is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BodyTarget {
    Actor(ActorId),
    RagdollRoot(ActorId),
    Body(BodyId),
}

/// Instruction for the owner's physics engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PhysicsCommand {
    AddForce {
        target: BodyTarget,
        force: Vector3<f32>,
    },
    AddImpulse {
        target: BodyTarget,
        impulse: Vector3<f32>,
    },
    /// Disable locomotion and the primary collider, enable ragdoll segments,
    /// carry `root_velocity` into the root segment
    EnterRagdoll {
        actor: ActorId,
        root_velocity: Vector3<f32>,
    },
    /// Re-enable locomotion, zero velocities, move the root to `position`
    ExitRagdoll {
        actor: ActorId,
        position: Point3<f32>,
    },
    /// Flatten onto `surface`, optionally parented to it
    EnterSquish {
        actor: ActorId,
        surface: ColliderId,
        parent: Option<ColliderId>,
        position: Point3<f32>,
        up: Vector3<f32>,
    },
    ExitSquish {
        actor: ActorId,
    },
    /// Place the actor at a spawn pose with zero velocity
    Respawn {
        actor: ActorId,
        position: Point3<f32>,
    },
}

/// Receives physics commands produced during a tick
pub trait PhysicsSink {
    fn push(&mut self, command: PhysicsCommand);
}

impl PhysicsSink for Vec<PhysicsCommand> {
    fn push(&mut self, command: PhysicsCommand) {
        Vec::push(self, command);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perspective {
    FirstPerson,
    ThirdPerson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowTarget {
    /// The default camera target on the actor's head
    CameraTarget,
    /// The actor's root transform
    Root,
}

/// Camera/visual instruction for one actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PresentationCommand {
    SetPerspective {
        actor: ActorId,
        perspective: Perspective,
    },
    SetFollowTarget {
        actor: ActorId,
        target: FollowTarget,
    },
}

/// Camera/visual collaborator
pub trait Presentation {
    fn set_third_person(&mut self, actor: ActorId);
    fn set_first_person(&mut self, actor: ActorId);
    fn set_follow_target(&mut self, actor: ActorId, target: FollowTarget);
}

impl Presentation for Vec<PresentationCommand> {
    fn set_third_person(&mut self, actor: ActorId) {
        self.push(PresentationCommand::SetPerspective {
            actor,
            perspective: Perspective::ThirdPerson,
        });
    }

    fn set_first_person(&mut self, actor: ActorId) {
        self.push(PresentationCommand::SetPerspective {
            actor,
            perspective: Perspective::FirstPerson,
        });
    }

    fn set_follow_target(&mut self, actor: ActorId, target: FollowTarget) {
        self.push(PresentationCommand::SetFollowTarget { actor, target });
    }
}
