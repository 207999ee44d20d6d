//! Ownership gate and replicated fields
//!
//! Every actor carries an [`OwnershipGate`]. Mutators check it before acting:
//! only the node that simulates an actor may change its owner-written state,
//! and only the authority may change contested state (the flag holder, scores).
//! Everyone else holds read-only mirrors that are overwritten from the
//! authority's broadcast (last-authority-wins).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Network participant identifier (one per connected client)
pub type PeerId = Uuid;

/// Whether the local process is the authority for a piece of state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Canonical state lives here
    Authority,
    /// Read-only mirror of the authority
    Mirror,
}

/// Per-actor predicate: "is this instance the one that simulates the actor"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipGate {
    owner: PeerId,
    role: Role,
    simulates: bool,
}

impl OwnershipGate {
    /// Authority hosting the simulation on behalf of `owner` (host-authoritative peer)
    pub fn hosted(owner: PeerId) -> Self {
        Self {
            owner,
            role: Role::Authority,
            simulates: true,
        }
    }

    /// The owning client itself, predicting locally and deferring to the authority
    pub fn owning_client(owner: PeerId) -> Self {
        Self {
            owner,
            role: Role::Mirror,
            simulates: true,
        }
    }

    /// Somebody else's actor as seen by an observer
    pub fn observer(owner: PeerId) -> Self {
        Self {
            owner,
            role: Role::Mirror,
            simulates: false,
        }
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// True when this instance simulates the actor and may write its owner fields
    pub fn is_owner(&self) -> bool {
        self.simulates
    }

    pub fn is_authority(&self) -> bool {
        self.role == Role::Authority
    }

    /// True when a message from `sender` is allowed to drive this actor
    pub fn admits(&self, sender: PeerId) -> bool {
        self.simulates && sender == self.owner
    }
}

/// Who may write a replicated field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePermission {
    /// The simulating owner (or the authority hosting it)
    Owner,
    /// The authority only
    Authority,
}

/// Authoritative value plus a change flag that drives broadcasting
#[derive(Debug, Clone)]
pub struct Replicated<T> {
    value: T,
    permission: WritePermission,
    dirty: bool,
}

impl<T: Clone + PartialEq> Replicated<T> {
    pub fn new(value: T, permission: WritePermission) -> Self {
        Self {
            value,
            permission,
            dirty: false,
        }
    }

    pub fn owner_written(value: T) -> Self {
        Self::new(value, WritePermission::Owner)
    }

    pub fn authority_written(value: T) -> Self {
        Self::new(value, WritePermission::Authority)
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Whether `gate` may write this field
    pub fn writable_by(&self, gate: &OwnershipGate) -> bool {
        match self.permission {
            WritePermission::Owner => gate.is_owner(),
            WritePermission::Authority => gate.is_authority(),
        }
    }

    /// Writer-side update. Returns true if the value changed; a write from a
    /// node without permission is dropped.
    pub fn set(&mut self, gate: &OwnershipGate, value: T) -> bool {
        if !self.writable_by(gate) || self.value == value {
            return false;
        }
        self.value = value;
        self.dirty = true;
        true
    }

    /// Reader-side update from the authority's broadcast
    pub fn apply_remote(&mut self, value: T) {
        self.value = value;
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear and return the change flag
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
