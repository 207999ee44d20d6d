//! Capture-the-flag token: at most one holder, changed only by the authority

use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::arbitration::ArbitrationError;
use super::authority::Role;
use super::ActorId;

/// Position, rotation and scale of the flag
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Point3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: Vector3<f32>,
}

impl Pose {
    pub fn at(position: Point3<f32>) -> Self {
        Self {
            position,
            rotation: UnitQuaternion::identity(),
            scale: Vector3::repeat(1.0),
        }
    }
}

/// Replicated view of the flag
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlagSnapshot {
    pub holder: Option<ActorId>,
    pub pose: Pose,
}

#[derive(Debug, Clone)]
pub struct FlagToken {
    role: Role,
    holder: Option<ActorId>,
    rest_pose: Pose,
    current_pose: Pose,
    /// Requester-side guess while a claim is in flight (mirrors only)
    predicted_holder: Option<ActorId>,
    dirty: bool,
}

impl FlagToken {
    pub fn new(rest_pose: Pose, role: Role) -> Self {
        Self {
            role,
            holder: None,
            rest_pose,
            current_pose: rest_pose,
            predicted_holder: None,
            dirty: false,
        }
    }

    /// Canonical holder
    pub fn holder(&self) -> Option<ActorId> {
        self.holder
    }

    /// Holder as displayed locally: the canonical one, else a pending prediction
    pub fn displayed_holder(&self) -> Option<ActorId> {
        self.holder.or(self.predicted_holder)
    }

    pub fn is_at_rest(&self) -> bool {
        self.holder.is_none()
    }

    pub fn rest_pose(&self) -> &Pose {
        &self.rest_pose
    }

    pub fn current_pose(&self) -> &Pose {
        &self.current_pose
    }

    /// Authority-side: first claim on an unheld flag wins
    pub fn claim(&mut self, actor: ActorId) -> Result<(), ArbitrationError> {
        if self.role != Role::Authority {
            return Err(ArbitrationError::NotAuthority);
        }
        if let Some(holder) = self.holder {
            return Err(ArbitrationError::FlagAlreadyHeld(holder));
        }
        self.holder = Some(actor);
        self.dirty = true;
        Ok(())
    }

    /// Authority-side: only the current holder can submit
    pub fn submit(&mut self, actor: ActorId) -> Result<(), ArbitrationError> {
        if self.role != Role::Authority {
            return Err(ArbitrationError::NotAuthority);
        }
        if self.holder != Some(actor) {
            return Err(ArbitrationError::NotHolder(actor));
        }
        self.reset();
        Ok(())
    }

    /// Back to rest, unheld
    pub fn reset(&mut self) {
        if self.holder.is_some() || self.current_pose != self.rest_pose {
            self.dirty = true;
        }
        self.holder = None;
        self.predicted_holder = None;
        self.current_pose = self.rest_pose;
    }

    /// Reset if `actor` holds the flag (holder left the match)
    pub fn release_holder(&mut self, actor: ActorId) -> bool {
        if self.holder != Some(actor) {
            return false;
        }
        self.reset();
        true
    }

    /// Follow the holder's carry point. Scale stays at rest scale.
    pub fn track(&mut self, position: Point3<f32>, rotation: UnitQuaternion<f32>) {
        if self.holder.is_none() {
            return;
        }
        self.current_pose.position = position;
        self.current_pose.rotation = rotation;
    }

    /// Requester-side guess while a claim travels to the authority
    pub fn predict_claim(&mut self, actor: ActorId) -> bool {
        if self.role == Role::Authority || self.displayed_holder().is_some() {
            return false;
        }
        self.predicted_holder = Some(actor);
        true
    }

    /// Overwrite local state with the authority's broadcast
    pub fn reconcile(&mut self, snapshot: &FlagSnapshot) {
        self.holder = snapshot.holder;
        self.current_pose = snapshot.pose;
        self.predicted_holder = None;
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot {
            holder: self.holder,
            pose: self.current_pose,
        }
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
