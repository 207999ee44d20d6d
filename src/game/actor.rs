//! Actor aggregate: one networked player with two arms and an incapacitation controller

use nalgebra::{Point3, UnitQuaternion, Vector3};
use tracing::debug;

use crate::ws::protocol::{ActorSnapshot, Color, GameEvent, PlayerInfo};

use super::authority::OwnershipGate;
use super::collab::{BodyReport, ColliderId, Contact, PhysicsCommand};
use super::grab::{ArmController, GrabOutcome, ReleaseOutcome};
use super::incapacitation::IncapacitationController;
use super::timer::TimerKind;
use super::{ActorId, TickContext};

pub struct Actor {
    id: ActorId,
    gate: OwnershipGate,
    display_name: String,
    color: Color,
    spawn: Point3<f32>,
    /// Latest physics report from the owner
    report: BodyReport,
    arms: ArmController,
    incapacitation: IncapacitationController,
    events: Vec<GameEvent>,
}

impl Actor {
    pub fn new(
        id: ActorId,
        gate: OwnershipGate,
        display_name: String,
        color: Color,
        spawn: Point3<f32>,
    ) -> Self {
        Self {
            id,
            gate,
            display_name,
            color,
            spawn,
            report: BodyReport::at(spawn),
            arms: ArmController::new(id, gate),
            incapacitation: IncapacitationController::new(id, gate),
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn gate(&self) -> &OwnershipGate {
        &self.gate
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn report(&self) -> &BodyReport {
        &self.report
    }

    pub fn arms(&self) -> &ArmController {
        &self.arms
    }

    pub fn incapacitation(&self) -> &IncapacitationController {
        &self.incapacitation
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            actor_id: self.id,
            user_id: self.gate.owner(),
            display_name: self.display_name.clone(),
            color: self.color,
        }
    }

    /// World pose of the carry point a held flag is bound to
    pub fn carry_pose(&self, offset: Vector3<f32>) -> (Point3<f32>, UnitQuaternion<f32>) {
        (
            self.report.position + self.report.rotation * offset,
            self.report.rotation,
        )
    }

    pub fn apply_report(&mut self, report: BodyReport) {
        self.report = report;
    }

    pub fn grab_started(&mut self, slot: usize, ctx: &mut TickContext<'_>) -> GrabOutcome {
        self.arms.grab(slot, &self.report, ctx)
    }

    pub fn grab_ended(&mut self, slot: usize) -> ReleaseOutcome {
        self.arms.release(slot)
    }

    pub fn any_action(&mut self, ctx: &mut TickContext<'_>) {
        self.incapacitation.struggle(ctx);
    }

    pub fn add_impulse(&mut self, impulse: Vector3<f32>, ctx: &mut TickContext<'_>) {
        self.incapacitation.add_impulse(impulse, &self.report, ctx);
        self.sync();
    }

    pub fn contact_begin(&mut self, contact: Contact, ctx: &mut TickContext<'_>) {
        self.incapacitation.contact_begin(contact, &self.report, ctx);
        self.sync();
    }

    pub fn contact_update(&mut self, contact: Contact, ctx: &mut TickContext<'_>) {
        self.incapacitation.contact_update(contact, ctx);
        self.sync();
    }

    pub fn contact_end(&mut self, surface: ColliderId) {
        self.incapacitation.contact_end(surface);
    }

    /// One simulation step: aim, force, break, then the ragdoll settle check
    pub fn step(&mut self, ctx: &mut TickContext<'_>) {
        let range = ctx.tuning.arm.range;
        self.arms.aim(&self.report, range);
        self.arms.apply_forces(&self.report, ctx);

        for impulse in self.arms.try_break(&self.report, ctx) {
            self.incapacitation.add_impulse(impulse, &self.report, ctx);
        }
        self.incapacitation.settle(&self.report, ctx);
        self.sync();
    }

    /// A countdown owned by this actor completed
    pub fn on_timer(&mut self, kind: TimerKind, ctx: &mut TickContext<'_>) {
        match kind {
            TimerKind::Regenerate(slot) => self.arms.regenerate(slot),
            TimerKind::RagdollHold => self.incapacitation.on_ragdoll_timeout(&self.report, ctx),
            TimerKind::SquishHold => self.incapacitation.on_squish_timeout(ctx),
        }
        self.sync();
    }

    /// Back to defaults at the spawn point, with every pending countdown cancelled
    pub fn respawn(&mut self, ctx: &mut TickContext<'_>) {
        let cancelled = ctx.timers.cancel_actor(self.id);
        self.arms.reset();
        self.incapacitation.reset(ctx);
        self.report = BodyReport::at(self.spawn);
        self.events.clear();

        ctx.physics.push(PhysicsCommand::Respawn {
            actor: self.id,
            position: self.spawn,
        });
        debug!(actor_id = %self.id, cancelled, "Actor respawned");
    }

    /// Incapacitation disables the arms
    fn sync(&mut self) {
        self.arms.set_enabled(self.incapacitation.is_normal());
        let id = self.id;
        self.events.extend(
            self.incapacitation
                .drain_events()
                .into_iter()
                .map(|transition| GameEvent::Incapacitation {
                    actor_id: id,
                    transition,
                }),
        );
    }

    pub fn drain_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn snapshot(&self) -> ActorSnapshot {
        ActorSnapshot {
            actor_id: self.id,
            position: self.report.position,
            rotation: self.report.rotation,
            velocity: self.report.velocity,
            incapacitation: self.incapacitation.state(),
            slots: self.arms.snapshot(),
        }
    }

    /// Mirror-side update from the authority's broadcast
    pub fn apply_snapshot(&mut self, snapshot: &ActorSnapshot) {
        self.report.position = snapshot.position;
        self.report.rotation = snapshot.rotation;
        self.report.velocity = snapshot.velocity;
        self.arms.apply_snapshot(&snapshot.slots);
        self.incapacitation.apply_snapshot(snapshot.incapacitation);
    }

    /// True if any replicated field changed since the last call
    pub fn take_dirty(&mut self) -> bool {
        let arms = self.arms.take_dirty();
        let incapacitation = self.incapacitation.take_dirty();
        arms || incapacitation
    }
}
