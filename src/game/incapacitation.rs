//! Ragdoll and squish: mutually exclusive incapacitation modes over normal locomotion
//!
//! Transitions are `Normal -> Ragdolling -> Normal` and `Normal -> Squished -> Normal`.
//! A new incapacitation is only admitted from `Normal`.

use std::collections::BTreeMap;
use std::time::Duration;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::authority::{OwnershipGate, Replicated};
use super::collab::{BodyReport, BodyTarget, ColliderId, Contact, FollowTarget, PhysicsCommand};
use super::timer::{TimerKey, TimerKind};
use super::{ActorId, TickContext};

/// Distinct surfaces tracked per actor; contacts with new surfaces past this are ignored
pub const MAX_CONTACTS: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct RagdollTuning {
    pub min_time: Duration,
    pub max_time: Duration,
    /// Hold time removed per input while struggling
    pub time_per_input: Duration,
    /// Impulses above this magnitude knock the actor into ragdoll
    pub impulse_threshold: f32,
    /// Root segment speed below which the ragdoll counts as settled
    pub settle_speed: f32,
}

impl Default for RagdollTuning {
    fn default() -> Self {
        Self {
            min_time: Duration::from_secs(2),
            max_time: Duration::from_secs(20),
            time_per_input: Duration::from_millis(200),
            impulse_threshold: 10.0,
            settle_speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SquishTuning {
    pub hold_time: Duration,
    pub time_per_input: Duration,
    /// Two contacts squish when the dot product of their normals is at most `-|dot_threshold|`
    pub dot_threshold: f32,
    pub impulse_threshold: f32,
    /// Distance the flattened actor sits above the surface
    pub surface_offset: f32,
}

impl Default for SquishTuning {
    fn default() -> Self {
        Self {
            hold_time: Duration::from_secs(4),
            time_per_input: Duration::from_millis(200),
            dot_threshold: 0.9,
            impulse_threshold: 5.0,
            surface_offset: 0.01,
        }
    }
}

/// Replicated incapacitation mode
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IncapacitationState {
    #[default]
    Normal,
    Ragdolling,
    Squished {
        surface: ColliderId,
        point: Point3<f32>,
        normal: Vector3<f32>,
    },
}

/// Transitions, for logging and broadcast
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum IncapacitationEvent {
    RagdollStarted,
    RagdollEnded { held: Duration },
    SquishStarted { surface: ColliderId },
    SquishEnded,
}

#[derive(Debug, Clone)]
pub struct IncapacitationController {
    actor: ActorId,
    gate: OwnershipGate,
    state: Replicated<IncapacitationState>,
    contacts: BTreeMap<ColliderId, Contact>,
    events: Vec<IncapacitationEvent>,
}

impl IncapacitationController {
    pub fn new(actor: ActorId, gate: OwnershipGate) -> Self {
        Self {
            actor,
            gate,
            state: Replicated::owner_written(IncapacitationState::Normal),
            contacts: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> IncapacitationState {
        *self.state.get()
    }

    pub fn is_normal(&self) -> bool {
        self.state() == IncapacitationState::Normal
    }

    pub fn is_ragdolling(&self) -> bool {
        self.state() == IncapacitationState::Ragdolling
    }

    pub fn is_squished(&self) -> bool {
        matches!(self.state(), IncapacitationState::Squished { .. })
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    fn ragdoll_key(&self) -> TimerKey {
        TimerKey::new(self.actor, TimerKind::RagdollHold)
    }

    fn squish_key(&self) -> TimerKey {
        TimerKey::new(self.actor, TimerKind::SquishHold)
    }

    /// Time spent ragdolling so far (struggling counts)
    pub fn ragdoll_elapsed(&self, ctx: &TickContext<'_>) -> Option<Duration> {
        ctx.timers.elapsed(self.ragdoll_key())
    }

    /// Time left before the squish wears off
    pub fn squish_remaining(&self, ctx: &TickContext<'_>) -> Option<Duration> {
        ctx.timers.remaining(self.squish_key())
    }

    pub fn drain_events(&mut self) -> Vec<IncapacitationEvent> {
        std::mem::take(&mut self.events)
    }

    /// Externally computed impulse (collision or arm break). Strong impulses knock the actor over.
    pub fn add_impulse(&mut self, impulse: Vector3<f32>, report: &BodyReport, ctx: &mut TickContext<'_>) {
        if !self.gate.is_owner() || self.is_squished() {
            return;
        }
        if impulse.norm() > ctx.tuning.ragdoll.impulse_threshold {
            self.enable_ragdoll(report, ctx);
        }
        if self.is_ragdolling() {
            ctx.physics.push(PhysicsCommand::AddImpulse {
                target: BodyTarget::RagdollRoot(self.actor),
                impulse,
            });
        }
    }

    pub fn enable_ragdoll(&mut self, report: &BodyReport, ctx: &mut TickContext<'_>) -> bool {
        if !self.gate.is_owner() || !self.is_normal() {
            return false;
        }
        let gate = self.gate;
        self.state.set(&gate, IncapacitationState::Ragdolling);

        ctx.physics.push(PhysicsCommand::EnterRagdoll {
            actor: self.actor,
            root_velocity: report.velocity,
        });
        ctx.presentation.set_third_person(self.actor);
        ctx.timers.start(self.ragdoll_key(), ctx.tuning.ragdoll.max_time);

        info!(actor_id = %self.actor, "Ragdoll enabled");
        self.events.push(IncapacitationEvent::RagdollStarted);
        true
    }

    /// Leave ragdoll now, cancelling the hold timer
    pub fn disable_ragdoll(&mut self, report: &BodyReport, ctx: &mut TickContext<'_>) -> bool {
        if !self.gate.is_owner() || !self.is_ragdolling() {
            return false;
        }
        let held = ctx.timers.elapsed(self.ragdoll_key()).unwrap_or_default();
        ctx.timers.cancel(self.ragdoll_key());
        self.finish_ragdoll(held, report, ctx);
        true
    }

    /// Ragdoll hold timer fired: recover regardless of velocity
    pub fn on_ragdoll_timeout(&mut self, report: &BodyReport, ctx: &mut TickContext<'_>) {
        if !self.is_ragdolling() {
            return;
        }
        let held = ctx.tuning.ragdoll.max_time;
        self.finish_ragdoll(held, report, ctx);
    }

    fn finish_ragdoll(&mut self, held: Duration, report: &BodyReport, ctx: &mut TickContext<'_>) {
        let gate = self.gate;
        self.state.set(&gate, IncapacitationState::Normal);

        let position = match report.root {
            Some(root) => root.position,
            None => {
                warn!(actor_id = %self.actor, "Missing ragdoll root segment, resyncing to body position");
                report.position
            }
        };
        ctx.physics.push(PhysicsCommand::ExitRagdoll {
            actor: self.actor,
            position,
        });
        ctx.presentation.set_first_person(self.actor);

        info!(actor_id = %self.actor, held_ms = held.as_millis() as u64, "Ragdoll disabled");
        self.events.push(IncapacitationEvent::RagdollEnded { held });
    }

    /// Per-step settle check once the minimum hold has passed
    pub fn settle(&mut self, report: &BodyReport, ctx: &mut TickContext<'_>) {
        if !self.gate.is_owner() || !self.is_ragdolling() {
            return;
        }
        let elapsed = ctx.timers.elapsed(self.ragdoll_key()).unwrap_or_default();
        if elapsed < ctx.tuning.ragdoll.min_time {
            return;
        }
        let Some(root) = report.root else {
            debug!(actor_id = %self.actor, "No ragdoll root segment reported, skipping settle check");
            return;
        };
        if root.speed < ctx.tuning.ragdoll.settle_speed {
            self.disable_ragdoll(report, ctx);
        }
    }

    /// Input activity while incapacitated shortens the remaining hold
    pub fn struggle(&mut self, ctx: &mut TickContext<'_>) {
        if !self.gate.is_owner() {
            return;
        }
        match self.state() {
            IncapacitationState::Ragdolling => {
                ctx.timers
                    .shorten(self.ragdoll_key(), ctx.tuning.ragdoll.time_per_input);
            }
            IncapacitationState::Squished { .. } => {
                ctx.timers
                    .shorten(self.squish_key(), ctx.tuning.squish.time_per_input);
            }
            IncapacitationState::Normal => {}
        }
    }

    /// A new contact. If it does not squish the actor, its impulse is applied instead.
    pub fn contact_begin(&mut self, contact: Contact, report: &BodyReport, ctx: &mut TickContext<'_>) {
        if !self.gate.is_owner() {
            return;
        }
        if !(self.record_contact(contact) && self.try_squish(&contact, ctx)) {
            self.add_impulse(-contact.impulse, report, ctx);
        }
    }

    /// An existing contact changed
    pub fn contact_update(&mut self, contact: Contact, ctx: &mut TickContext<'_>) {
        if !self.gate.is_owner() {
            return;
        }
        if self.record_contact(contact) {
            self.try_squish(&contact, ctx);
        }
    }

    pub fn contact_end(&mut self, surface: ColliderId) {
        self.contacts.remove(&surface);
    }

    fn record_contact(&mut self, contact: Contact) -> bool {
        if self.contacts.len() >= MAX_CONTACTS && !self.contacts.contains_key(&contact.surface) {
            warn!(
                actor_id = %self.actor,
                surface = contact.surface,
                tracked = self.contacts.len(),
                "Contact map full, ignoring contact"
            );
            return false;
        }
        self.contacts.insert(contact.surface, contact);
        true
    }

    /// Look for a contact near-opposite the one that just changed, with enough impulse between them
    fn try_squish(&mut self, changed: &Contact, ctx: &mut TickContext<'_>) -> bool {
        if !self.is_normal() {
            return false;
        }
        let Some(surface) = self.find_squish_surface(changed, &ctx.tuning.squish) else {
            return false;
        };
        self.enable_squish(surface, ctx)
    }

    fn find_squish_surface(&self, changed: &Contact, tuning: &SquishTuning) -> Option<ColliderId> {
        let dot_limit = -tuning.dot_threshold.abs();
        self.contacts
            .values()
            .filter(|other| {
                other.surface != changed.surface && changed.normal.dot(&other.normal) <= dot_limit
            })
            .find_map(|other| pressed_surface(changed, other, tuning.impulse_threshold))
    }

    fn enable_squish(&mut self, surface: ColliderId, ctx: &mut TickContext<'_>) -> bool {
        if !self.gate.is_owner() || !self.is_normal() {
            return false;
        }
        let Some(contact) = self.contacts.get(&surface).copied() else {
            return false;
        };
        let gate = self.gate;
        self.state.set(
            &gate,
            IncapacitationState::Squished {
                surface,
                point: contact.point,
                normal: contact.normal,
            },
        );

        ctx.presentation.set_follow_target(self.actor, FollowTarget::Root);
        ctx.presentation.set_third_person(self.actor);
        ctx.physics.push(PhysicsCommand::EnterSquish {
            actor: self.actor,
            surface,
            parent: contact.networked.then_some(surface),
            position: contact.point + ctx.tuning.squish.surface_offset * contact.normal,
            up: contact.normal,
        });
        ctx.timers.start(self.squish_key(), ctx.tuning.squish.hold_time);

        info!(actor_id = %self.actor, surface, "Squished");
        self.events.push(IncapacitationEvent::SquishStarted { surface });
        true
    }

    /// Squish hold timer fired
    pub fn on_squish_timeout(&mut self, ctx: &mut TickContext<'_>) {
        if !self.is_squished() {
            return;
        }
        let gate = self.gate;
        self.state.set(&gate, IncapacitationState::Normal);

        ctx.physics.push(PhysicsCommand::ExitSquish { actor: self.actor });
        ctx.presentation.set_follow_target(self.actor, FollowTarget::CameraTarget);
        ctx.presentation.set_first_person(self.actor);

        info!(actor_id = %self.actor, "Squish ended");
        self.events.push(IncapacitationEvent::SquishEnded);
    }

    /// Back to defaults on respawn, cancelling pending holds
    pub fn reset(&mut self, ctx: &mut TickContext<'_>) {
        ctx.timers.cancel(self.ragdoll_key());
        ctx.timers.cancel(self.squish_key());
        let gate = self.gate;
        self.state.set(&gate, IncapacitationState::Normal);
        self.contacts.clear();
        self.events.clear();
    }

    pub fn apply_snapshot(&mut self, state: IncapacitationState) {
        self.state.apply_remote(state);
    }

    pub fn take_dirty(&mut self) -> bool {
        self.state.take_dirty()
    }
}

/// The weaker side of an opposing pair is the surface the actor is pressed onto
fn pressed_surface(a: &Contact, b: &Contact, threshold: f32) -> Option<ColliderId> {
    let a_impulse = a.impulse.norm();
    let b_impulse = b.impulse.norm();
    if a_impulse >= threshold {
        Some(if b_impulse > a_impulse { a.surface } else { b.surface })
    } else if b_impulse >= threshold {
        Some(a.surface)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::arbitration::Request;
    use crate::game::authority::PeerId;
    use crate::game::collab::{Perspective, PresentationCommand, RootSegment};
    use crate::game::timer::TimerService;
    use crate::game::Tuning;
    use uuid::Uuid;

    const STEP: Duration = Duration::from_millis(20);

    struct Harness {
        timers: TimerService,
        requests: Vec<(PeerId, Request)>,
        physics: Vec<PhysicsCommand>,
        presentation: Vec<PresentationCommand>,
        tuning: Tuning,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                timers: TimerService::new(),
                requests: Vec::new(),
                physics: Vec::new(),
                presentation: Vec::new(),
                tuning: Tuning::default(),
            }
        }

        fn ctx(&mut self) -> TickContext<'_> {
            TickContext {
                timers: &mut self.timers,
                authority: &mut self.requests,
                physics: &mut self.physics,
                presentation: &mut self.presentation,
                tuning: &self.tuning,
            }
        }

        /// One step as the match runs it: advance, settle, then fire due holds
        fn step(&mut self, incap: &mut IncapacitationController, report: &BodyReport) {
            self.timers.advance(STEP);
            incap.settle(report, &mut self.ctx());
            while let Some(key) = self.timers.pop_due() {
                match key.kind {
                    TimerKind::RagdollHold => incap.on_ragdoll_timeout(report, &mut self.ctx()),
                    TimerKind::SquishHold => incap.on_squish_timeout(&mut self.ctx()),
                    TimerKind::Regenerate(_) => {}
                }
            }
        }
    }

    fn controller() -> IncapacitationController {
        let actor = Uuid::new_v4();
        IncapacitationController::new(actor, OwnershipGate::hosted(actor))
    }

    fn report_with_speed(speed: f32) -> BodyReport {
        let mut report = BodyReport::at(Point3::origin());
        report.root = Some(RootSegment {
            position: Point3::new(0.0, 0.5, 0.0),
            speed,
        });
        report
    }

    fn contact(surface: ColliderId, normal: Vector3<f32>, impulse: f32) -> Contact {
        Contact {
            surface,
            point: Point3::new(0.0, 0.0, 0.0),
            normal,
            impulse: normal * impulse,
            networked: false,
        }
    }

    fn ended_at(incap: &mut IncapacitationController) -> Option<Duration> {
        incap.drain_events().into_iter().find_map(|e| match e {
            IncapacitationEvent::RagdollEnded { held } => Some(held),
            _ => None,
        })
    }

    #[test]
    fn weak_impulse_does_not_ragdoll() {
        let mut h = Harness::new();
        let mut incap = controller();
        incap.add_impulse(Vector3::new(0.0, 5.0, 0.0), &report_with_speed(0.0), &mut h.ctx());
        assert!(incap.is_normal());
        assert!(h.physics.is_empty());
    }

    #[test]
    fn strong_impulse_ragdolls_and_hits_root_segment() {
        let mut h = Harness::new();
        let mut incap = controller();
        let mut report = report_with_speed(3.0);
        report.velocity = Vector3::new(1.0, 0.0, 0.0);
        incap.add_impulse(Vector3::new(0.0, 50.0, 0.0), &report, &mut h.ctx());

        assert!(incap.is_ragdolling());
        assert_eq!(
            h.physics[0],
            PhysicsCommand::EnterRagdoll {
                actor: incap.actor,
                root_velocity: Vector3::new(1.0, 0.0, 0.0),
            }
        );
        assert!(matches!(h.physics[1], PhysicsCommand::AddImpulse { .. }));
        assert_eq!(
            h.presentation,
            vec![PresentationCommand::SetPerspective {
                actor: incap.actor,
                perspective: Perspective::ThirdPerson,
            }]
        );
    }

    #[test]
    fn ragdoll_recovers_at_max_time_when_never_settled() {
        let mut h = Harness::new();
        let mut incap = controller();
        let moving = report_with_speed(5.0);
        assert!(incap.enable_ragdoll(&moving, &mut h.ctx()));

        for _ in 0..999 {
            h.step(&mut incap, &moving);
        }
        assert!(incap.is_ragdolling());

        h.step(&mut incap, &moving);
        assert!(incap.is_normal());
        assert_eq!(ended_at(&mut incap), Some(Duration::from_secs(20)));
    }

    #[test]
    fn ragdoll_recovers_when_root_settles_after_minimum() {
        let mut h = Harness::new();
        let mut incap = controller();
        let moving = report_with_speed(5.0);
        let still = report_with_speed(0.5);
        incap.enable_ragdoll(&moving, &mut h.ctx());

        // Settled early, but before the 2 s minimum: keep ragdolling
        for _ in 0..50 {
            h.step(&mut incap, &still);
        }
        assert!(incap.is_ragdolling());

        for _ in 50..249 {
            h.step(&mut incap, &moving);
        }
        assert!(incap.is_ragdolling());

        h.step(&mut incap, &still);
        assert!(incap.is_normal());
        assert_eq!(ended_at(&mut incap), Some(Duration::from_secs(5)));
        assert!(!h.timers.is_pending(TimerKey::new(incap.actor, TimerKind::RagdollHold)));
        assert!(h.physics.contains(&PhysicsCommand::ExitRagdoll {
            actor: incap.actor,
            position: Point3::new(0.0, 0.5, 0.0),
        }));
    }

    #[test]
    fn struggling_shortens_ragdoll_without_going_negative() {
        let mut h = Harness::new();
        let mut incap = controller();
        let moving = report_with_speed(5.0);
        incap.enable_ragdoll(&moving, &mut h.ctx());

        for _ in 0..10 {
            incap.struggle(&mut h.ctx());
        }
        assert_eq!(incap.ragdoll_elapsed(&h.ctx()), Some(Duration::from_secs(2)));

        for _ in 0..200 {
            incap.struggle(&mut h.ctx());
        }
        h.step(&mut incap, &moving);
        assert!(incap.is_normal());
    }

    #[test]
    fn opposite_contacts_squish_onto_weaker_side() {
        let mut h = Harness::new();
        let mut incap = controller();
        let report = report_with_speed(0.0);

        incap.contact_begin(contact(1, Vector3::y(), 1.0), &report, &mut h.ctx());
        assert!(incap.is_normal());
        incap.contact_begin(contact(2, -Vector3::y(), 8.0), &report, &mut h.ctx());

        match incap.state() {
            IncapacitationState::Squished { surface, .. } => assert_eq!(surface, 1),
            other => panic!("expected squish, got {other:?}"),
        }
        assert_eq!(
            incap.squish_remaining(&h.ctx()),
            Some(Duration::from_secs(4))
        );
    }

    #[test]
    fn contact_map_is_bounded() {
        let mut h = Harness::new();
        let mut incap = controller();

        for surface in 0..3000 {
            incap.contact_update(contact(surface, Vector3::x(), 1.0), &mut h.ctx());
        }
        assert_eq!(incap.contact_count(), MAX_CONTACTS);

        // Tracked surfaces still update and can still squish
        incap.contact_update(contact(0, Vector3::y(), 1.0), &mut h.ctx());
        incap.contact_update(contact(1, -Vector3::y(), 8.0), &mut h.ctx());
        match incap.state() {
            IncapacitationState::Squished { surface, .. } => assert_eq!(surface, 0),
            other => panic!("expected squish, got {other:?}"),
        }
    }

    #[test]
    fn contacts_that_are_not_opposite_do_not_squish() {
        let mut h = Harness::new();
        let mut incap = controller();
        let report = report_with_speed(0.0);

        incap.contact_begin(contact(1, Vector3::y(), 8.0), &report, &mut h.ctx());
        incap.contact_begin(contact(2, Vector3::x(), 8.0), &report, &mut h.ctx());
        assert!(!incap.is_squished());
    }

    #[test]
    fn squish_wears_off_and_restores_camera() {
        let mut h = Harness::new();
        let mut incap = controller();
        let report = report_with_speed(0.0);
        incap.contact_begin(contact(1, Vector3::y(), 9.0), &report, &mut h.ctx());
        incap.contact_begin(contact(2, -Vector3::y(), 9.0), &report, &mut h.ctx());
        assert!(incap.is_squished());

        for _ in 0..200 {
            h.step(&mut incap, &report);
        }
        assert!(incap.is_normal());
        assert!(h.physics.contains(&PhysicsCommand::ExitSquish { actor: incap.actor }));
        assert_eq!(
            h.presentation.last(),
            Some(&PresentationCommand::SetPerspective {
                actor: incap.actor,
                perspective: Perspective::FirstPerson,
            })
        );
    }

    #[test]
    fn squish_parents_only_to_networked_surface() {
        let mut h = Harness::new();
        let mut incap = controller();
        let report = report_with_speed(0.0);
        let mut floor = contact(1, Vector3::y(), 1.0);
        floor.networked = true;
        incap.contact_begin(floor, &report, &mut h.ctx());
        incap.contact_begin(contact(2, -Vector3::y(), 9.0), &report, &mut h.ctx());

        let entered = h
            .physics
            .iter()
            .find_map(|c| match c {
                PhysicsCommand::EnterSquish { parent, up, .. } => Some((*parent, *up)),
                _ => None,
            });
        assert_eq!(entered, Some((Some(1), Vector3::y())));
    }

    #[test]
    fn no_second_incapacitation_while_one_is_active() {
        let mut h = Harness::new();
        let mut incap = controller();
        let report = report_with_speed(5.0);
        incap.enable_ragdoll(&report, &mut h.ctx());

        incap.contact_begin(contact(1, Vector3::y(), 9.0), &report, &mut h.ctx());
        incap.contact_begin(contact(2, -Vector3::y(), 9.0), &report, &mut h.ctx());
        assert!(incap.is_ragdolling());

        // And a squished actor ignores impulses entirely
        let mut h = Harness::new();
        let mut incap = controller();
        incap.contact_begin(contact(1, Vector3::y(), 9.0), &report, &mut h.ctx());
        incap.contact_begin(contact(2, -Vector3::y(), 9.0), &report, &mut h.ctx());
        h.physics.clear();
        incap.add_impulse(Vector3::new(0.0, 100.0, 0.0), &report, &mut h.ctx());
        assert!(incap.is_squished());
        assert!(h.physics.is_empty());
    }

    #[test]
    fn reset_cancels_holds() {
        let mut h = Harness::new();
        let mut incap = controller();
        incap.enable_ragdoll(&report_with_speed(5.0), &mut h.ctx());
        incap.reset(&mut h.ctx());

        assert!(incap.is_normal());
        assert!(h.timers.is_empty());
    }
}
