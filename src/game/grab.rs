//! Grab slots ("arms"): aim, attach, pull, break and regenerate

use std::time::Duration;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::arbitration::Request;
use super::authority::{OwnershipGate, Replicated};
use super::collab::{AimHit, BodyId, BodyReport, BodyTarget, ColliderTag, PhysicsCommand};
use super::timer::{TimerKey, TimerKind};
use super::{ActorId, TickContext};

/// Two arms per actor
pub const SLOT_COUNT: usize = 2;

/// Arm tuning constants
#[derive(Debug, Clone, Copy)]
pub struct ArmTuning {
    /// Aim range
    pub range: f32,
    /// Sphere-cast radius used when the primary ray misses
    pub radius: f32,
    /// Horizontal spread of the two aim points, as a fraction of the viewport width
    pub spread: f32,
    /// Pull force magnitude
    pub force: f32,
    /// Absolute length an arm always tolerates
    pub max_length: f32,
    /// Length tolerated relative to the length at attach time
    pub max_length_multiplier: f32,
    pub break_impulse_multiplier: f32,
    pub regeneration_time: Duration,
    /// Whether a detached arm object is spawned at the authority on break
    pub spawn_detached_arms: bool,
}

impl Default for ArmTuning {
    fn default() -> Self {
        Self {
            range: 10.0,
            radius: 1.0,
            spread: 0.5,
            force: 4.905,
            max_length: 25.0,
            max_length_multiplier: 1.25,
            break_impulse_multiplier: 10.0,
            regeneration_time: Duration::from_secs(5),
            spawn_detached_arms: true,
        }
    }
}

impl ArmTuning {
    pub fn aim_settings(&self) -> AimSettings {
        AimSettings {
            range: self.range,
            sphere_radius: self.radius,
            viewport: [
                aim_viewport_point(0, self.spread),
                aim_viewport_point(1, self.spread),
            ],
        }
    }
}

/// Aim geometry sent to the owning client, which runs the casts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AimSettings {
    pub range: f32,
    pub sphere_radius: f32,
    /// Normalised viewport point per slot
    pub viewport: [(f32, f32); SLOT_COUNT],
}

/// Normalised viewport point (x, y) a slot aims through
pub fn aim_viewport_point(slot: usize, spread: f32) -> (f32, f32) {
    let offset = 0.5 * spread.clamp(0.0, 1.0);
    let x = if slot == 0 { 0.5 - offset } else { 0.5 + offset };
    (x, 0.5)
}

/// Origin of the sphere-cast fallback: the primary ray pushed forward by the radius
pub fn sphere_cast_origin(origin: Point3<f32>, direction: Vector3<f32>, radius: f32) -> Point3<f32> {
    origin + radius * direction
}

/// Where a slot is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    Idle,
    Aiming,
    Attached,
    Regenerating,
}

/// Result of a grab attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabOutcome {
    Attached,
    /// Target was the flag; a claim was sent to the authority instead
    RedirectedToFlag,
    NotOwner,
    Disabled,
    InvalidSlot,
    AlreadyAttached,
    Broken,
    NoTarget,
    /// Target refuses connections
    NoConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotAttached,
    NotOwner,
    InvalidSlot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakOutcome {
    /// Arm snapped; the impulse goes to the actor's incapacitation controller
    Broken { impulse: Vector3<f32> },
    AlreadyBroken,
    NotAttached,
    NotOwner,
    InvalidSlot,
}

/// Anchored body as a weak reference: id plus the anchor offset in the body's frame
#[derive(Debug, Clone, Copy, PartialEq)]
struct AnchoredBody {
    id: BodyId,
    local_anchor: Vector3<f32>,
}

/// Replicated view of one slot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub attached: bool,
    pub broken: bool,
    pub anchor: Option<Point3<f32>>,
}

/// One arm
#[derive(Debug, Clone)]
pub struct GrabSlot {
    index: usize,
    attached: Replicated<bool>,
    broken: Replicated<bool>,
    anchor_point: Replicated<Option<Point3<f32>>>,
    anchored_body: Option<AnchoredBody>,
    base_length: f32,
    candidate: Option<AimHit>,
    /// Last report carried no aim probe for this slot
    probe_missing: bool,
}

impl GrabSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            attached: Replicated::owner_written(false),
            broken: Replicated::owner_written(false),
            anchor_point: Replicated::owner_written(None),
            anchored_body: None,
            base_length: 0.0,
            candidate: None,
            probe_missing: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_attached(&self) -> bool {
        *self.attached.get()
    }

    pub fn is_broken(&self) -> bool {
        *self.broken.get()
    }

    pub fn anchor_point(&self) -> Option<Point3<f32>> {
        *self.anchor_point.get()
    }

    pub fn anchored_body(&self) -> Option<BodyId> {
        self.anchored_body.map(|b| b.id)
    }

    pub fn base_length(&self) -> f32 {
        self.base_length
    }

    pub fn candidate(&self) -> Option<&AimHit> {
        self.candidate.as_ref()
    }

    pub fn has_aim_probe(&self) -> bool {
        !self.probe_missing
    }

    pub fn phase(&self) -> SlotPhase {
        if self.is_broken() {
            SlotPhase::Regenerating
        } else if self.is_attached() {
            SlotPhase::Attached
        } else if self.candidate.is_some() {
            SlotPhase::Aiming
        } else {
            SlotPhase::Idle
        }
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            attached: self.is_attached(),
            broken: self.is_broken(),
            anchor: self.anchor_point(),
        }
    }

    fn take_dirty(&mut self) -> bool {
        // Evaluate all three so every flag is cleared
        let attached = self.attached.take_dirty();
        let broken = self.broken.take_dirty();
        let anchor = self.anchor_point.take_dirty();
        attached || broken || anchor
    }

    /// World anchor this step: follows the anchored body while it exists,
    /// otherwise stays at the last known point
    fn current_anchor(&self, report: &BodyReport) -> Option<Point3<f32>> {
        let last = self.anchor_point()?;
        match self.anchored_body.and_then(|b| report.body(b.id).map(|s| (b, s))) {
            Some((body, state)) => Some(state.position + state.rotation * body.local_anchor),
            None => Some(last),
        }
    }

    fn clear_attachment(&mut self, gate: &OwnershipGate) {
        self.attached.set(gate, false);
        self.anchor_point.set(gate, None);
        self.anchored_body = None;
    }
}

/// Both arms of one actor
#[derive(Debug, Clone)]
pub struct ArmController {
    actor: ActorId,
    gate: OwnershipGate,
    enabled: bool,
    slots: [GrabSlot; SLOT_COUNT],
}

impl ArmController {
    pub fn new(actor: ActorId, gate: OwnershipGate) -> Self {
        Self {
            actor,
            gate,
            enabled: true,
            slots: [GrabSlot::new(0), GrabSlot::new(1)],
        }
    }

    pub fn slot(&self, index: usize) -> Option<&GrabSlot> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[GrabSlot; SLOT_COUNT] {
        &self.slots
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Incapacitation disables the arms; disabling releases both slots
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if !enabled {
            self.release_all();
            for slot in &mut self.slots {
                slot.candidate = None;
            }
        }
    }

    /// Pick this step's target candidate for every free slot
    pub fn aim(&mut self, report: &BodyReport, range: f32) {
        if !self.gate.is_owner() || !self.enabled {
            return;
        }

        for slot in &mut self.slots {
            if slot.is_attached() || slot.is_broken() {
                continue;
            }
            let Some(probe) = report.aim[slot.index] else {
                if !slot.probe_missing {
                    warn!(actor_id = %self.actor, slot = slot.index, "Missing camera reference, skipping aim");
                    slot.probe_missing = true;
                }
                continue;
            };
            if slot.probe_missing {
                debug!(actor_id = %self.actor, slot = slot.index, "Aim probe restored");
                slot.probe_missing = false;
            }
            slot.candidate = probe
                .ray
                .or(probe.sphere)
                .filter(|hit| hit.distance <= range);
        }
    }

    /// Attach slot `index` to its current candidate
    pub fn grab(&mut self, index: usize, report: &BodyReport, ctx: &mut TickContext<'_>) -> GrabOutcome {
        if !self.gate.is_owner() {
            return GrabOutcome::NotOwner;
        }
        if !self.enabled {
            return GrabOutcome::Disabled;
        }
        let gate = self.gate;
        let actor = self.actor;
        let Some(slot) = self.slots.get_mut(index) else {
            return GrabOutcome::InvalidSlot;
        };
        if slot.is_attached() {
            return GrabOutcome::AlreadyAttached;
        }
        if slot.is_broken() {
            return GrabOutcome::Broken;
        }
        let Some(hit) = slot.candidate else {
            return GrabOutcome::NoTarget;
        };

        match hit.tag {
            ColliderTag::Flag => {
                ctx.authority
                    .request(gate.owner(), Request::ClaimFlag { actor });
                return GrabOutcome::RedirectedToFlag;
            }
            ColliderTag::NoConnection => {
                debug!(actor_id = %actor, slot = index, collider = hit.collider, "Target refuses connection");
                return GrabOutcome::NoConnection;
            }
            ColliderTag::Untagged => {}
        }

        slot.attached.set(&gate, true);
        slot.anchor_point.set(&gate, Some(hit.point));
        slot.anchored_body = hit.body.map(|body| AnchoredBody {
            id: body.id,
            local_anchor: body.rotation.inverse() * (hit.point - body.position),
        });
        slot.base_length = (hit.point - report.position).norm();

        debug!(actor_id = %actor, slot = index, base_length = slot.base_length, "Arm attached");
        GrabOutcome::Attached
    }

    /// Let go without breaking
    pub fn release(&mut self, index: usize) -> ReleaseOutcome {
        if !self.gate.is_owner() {
            return ReleaseOutcome::NotOwner;
        }
        let gate = self.gate;
        let Some(slot) = self.slots.get_mut(index) else {
            return ReleaseOutcome::InvalidSlot;
        };
        if !slot.is_attached() {
            return ReleaseOutcome::NotAttached;
        }
        slot.clear_attachment(&gate);
        ReleaseOutcome::Released
    }

    pub fn release_all(&mut self) {
        for index in 0..SLOT_COUNT {
            self.release(index);
        }
    }

    /// Pull toward every anchor. A free anchored body is pulled toward the
    /// actor; otherwise the actor is pulled toward the anchor.
    pub fn apply_forces(&mut self, report: &BodyReport, ctx: &mut TickContext<'_>) {
        if !self.gate.is_owner() || !self.enabled {
            return;
        }
        let gate = self.gate;
        let force = ctx.tuning.arm.force;

        for slot in &mut self.slots {
            if !slot.is_attached() {
                continue;
            }
            let Some(anchor) = slot.current_anchor(report) else {
                continue;
            };
            slot.anchor_point.set(&gate, Some(anchor));

            let free_body = slot
                .anchored_body
                .and_then(|b| report.body(b.id))
                .filter(|state| !state.kinematic);

            match free_body {
                Some(state) => {
                    if let Some(direction) = (report.position - anchor).try_normalize(f32::EPSILON) {
                        ctx.physics.push(PhysicsCommand::AddForce {
                            target: BodyTarget::Body(state.id),
                            force: force * direction,
                        });
                    }
                }
                None => {
                    if let Some(direction) = (anchor - report.position).try_normalize(f32::EPSILON) {
                        ctx.physics.push(PhysicsCommand::AddForce {
                            target: BodyTarget::Actor(self.actor),
                            force: force * direction,
                        });
                    }
                }
            }
        }
    }

    /// Break every slot stretched past its limit. Returns the impulses to apply to the actor.
    pub fn try_break(&mut self, report: &BodyReport, ctx: &mut TickContext<'_>) -> Vec<Vector3<f32>> {
        if !self.gate.is_owner() || !self.enabled {
            return Vec::new();
        }

        let mut impulses = Vec::new();
        for index in 0..SLOT_COUNT {
            let slot = &self.slots[index];
            let Some(anchor) = slot.anchor_point().filter(|_| slot.is_attached()) else {
                continue;
            };
            let length = (anchor - report.position).norm();
            let limit = ctx
                .tuning
                .arm
                .max_length
                .max(ctx.tuning.arm.max_length_multiplier * slot.base_length);

            if length > limit {
                if let BreakOutcome::Broken { impulse } = self.break_slot(index, report, ctx) {
                    impulses.push(impulse);
                }
            }
        }
        impulses
    }

    /// Snap slot `index`: release everything, ask the authority for a
    /// detached arm, and start regenerating
    pub fn break_slot(&mut self, index: usize, report: &BodyReport, ctx: &mut TickContext<'_>) -> BreakOutcome {
        if !self.gate.is_owner() {
            return BreakOutcome::NotOwner;
        }
        let Some(slot) = self.slots.get(index) else {
            return BreakOutcome::InvalidSlot;
        };
        if slot.is_broken() {
            return BreakOutcome::AlreadyBroken;
        }
        let Some(anchor) = slot.anchor_point().filter(|_| slot.is_attached()) else {
            return BreakOutcome::NotAttached;
        };

        let arm = ctx.tuning.arm;
        let stretch = report.position - anchor;
        let impulse = arm.break_impulse_multiplier * Vector3::new(stretch.x, stretch.norm(), stretch.z);

        self.release_all();

        if arm.spawn_detached_arms {
            ctx.authority.request(
                self.gate.owner(),
                Request::SpawnArm {
                    actor: self.actor,
                    slot: index,
                    origin: report.position,
                    impulse,
                },
            );
        }

        let gate = self.gate;
        self.slots[index].broken.set(&gate, true);
        ctx.timers.start(
            TimerKey::new(self.actor, TimerKind::Regenerate(index)),
            arm.regeneration_time,
        );

        info!(actor_id = %self.actor, slot = index, "Arm broke");
        BreakOutcome::Broken { impulse }
    }

    /// Regeneration timer fired
    pub fn regenerate(&mut self, index: usize) {
        let gate = self.gate;
        if let Some(slot) = self.slots.get_mut(index) {
            slot.broken.set(&gate, false);
            debug!(actor_id = %self.actor, slot = index, "Arm regenerated");
        }
    }

    /// Back to defaults on respawn. Pending regeneration timers are the caller's to cancel.
    pub fn reset(&mut self) {
        let gate = self.gate;
        for slot in &mut self.slots {
            slot.clear_attachment(&gate);
            slot.broken.set(&gate, false);
            slot.candidate = None;
            slot.base_length = 0.0;
        }
        self.enabled = true;
    }

    /// Mirror-side update from the authority
    pub fn apply_snapshot(&mut self, snapshots: &[SlotSnapshot; SLOT_COUNT]) {
        for (slot, snapshot) in self.slots.iter_mut().zip(snapshots) {
            slot.attached.apply_remote(snapshot.attached);
            slot.broken.apply_remote(snapshot.broken);
            slot.anchor_point.apply_remote(snapshot.anchor);
            if !snapshot.attached {
                slot.anchored_body = None;
            }
        }
    }

    pub fn snapshot(&self) -> [SlotSnapshot; SLOT_COUNT] {
        [self.slots[0].snapshot(), self.slots[1].snapshot()]
    }

    pub fn take_dirty(&mut self) -> bool {
        let first = self.slots[0].take_dirty();
        let second = self.slots[1].take_dirty();
        first || second
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::arbitration::Request;
    use crate::game::authority::PeerId;
    use crate::game::collab::{AimProbe, BodyState, PresentationCommand};
    use crate::game::timer::TimerService;
    use crate::game::Tuning;
    use nalgebra::UnitQuaternion;
    use uuid::Uuid;

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
    }

    fn hit_at(point: Point3<f32>, distance: f32) -> AimHit {
        AimHit {
            collider: 7,
            point,
            normal: Vector3::y(),
            distance,
            body: None,
            tag: ColliderTag::Untagged,
        }
    }

    fn report_with_hit(position: Point3<f32>, hit: AimHit) -> BodyReport {
        let mut report = BodyReport::at(position);
        report.aim[0] = Some(AimProbe {
            ray: Some(hit),
            sphere: None,
        });
        report
    }

    fn attached_arms(h: &mut Harness, anchor: Point3<f32>) -> (ArmController, BodyReport) {
        let actor = Uuid::new_v4();
        let mut arms = ArmController::new(actor, OwnershipGate::hosted(actor));
        let report = report_with_hit(Point3::origin(), hit_at(anchor, 2.0));
        arms.aim(&report, 10.0);
        assert_eq!(arms.grab(0, &report, &mut h.ctx()), GrabOutcome::Attached);
        (arms, report)
    }

    #[test]
    fn viewport_points_are_offset_per_slot() {
        assert_eq!(aim_viewport_point(0, 0.5), (0.25, 0.5));
        assert_eq!(aim_viewport_point(1, 0.5), (0.75, 0.5));
        assert_eq!(
            sphere_cast_origin(Point3::origin(), Vector3::z(), 1.0),
            Point3::new(0.0, 0.0, 1.0)
        );

        let aim = ArmTuning::default().aim_settings();
        assert_eq!(aim.viewport, [(0.25, 0.5), (0.75, 0.5)]);
        assert_eq!(aim.sphere_radius, 1.0);
    }

    #[test]
    fn aim_falls_back_to_sphere_hit_and_respects_range() {
        let actor = Uuid::new_v4();
        let mut arms = ArmController::new(actor, OwnershipGate::hosted(actor));
        let mut report = BodyReport::at(Point3::origin());
        report.aim[0] = Some(AimProbe {
            ray: None,
            sphere: Some(hit_at(Point3::new(0.0, 0.0, 4.0), 4.0)),
        });
        report.aim[1] = Some(AimProbe {
            ray: Some(hit_at(Point3::new(0.0, 0.0, 40.0), 40.0)),
            sphere: None,
        });

        arms.aim(&report, 10.0);
        assert_eq!(arms.slot(0).map(|s| s.phase()), Some(SlotPhase::Aiming));
        assert_eq!(arms.slot(1).map(|s| s.phase()), Some(SlotPhase::Idle));
    }

    #[test]
    fn missing_camera_keeps_previous_candidate() {
        let actor = Uuid::new_v4();
        let mut arms = ArmController::new(actor, OwnershipGate::hosted(actor));
        let report = report_with_hit(Point3::origin(), hit_at(Point3::new(0.0, 0.0, 3.0), 3.0));
        arms.aim(&report, 10.0);

        let mut blind = BodyReport::at(Point3::origin());
        blind.aim = [None, None];
        arms.aim(&blind, 10.0);
        assert!(arms.slot(0).and_then(|s| s.candidate()).is_some());
        assert!(!arms.slots()[0].has_aim_probe());

        // Reported once per loss; repeated blind reports keep the slot flagged
        arms.aim(&blind, 10.0);
        assert!(!arms.slots()[0].has_aim_probe());

        arms.aim(&report, 10.0);
        assert!(arms.slots().iter().all(GrabSlot::has_aim_probe));
    }

    #[test]
    fn grab_captures_anchor_and_base_length() {
        let mut h = Harness::new();
        let (arms, _) = attached_arms(&mut h, Point3::new(0.0, 0.0, 2.0));
        let slot = &arms.slots()[0];

        assert_eq!(slot.phase(), SlotPhase::Attached);
        assert_eq!(slot.anchor_point(), Some(Point3::new(0.0, 0.0, 2.0)));
        assert!((slot.base_length() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn grab_on_flag_sends_claim_instead_of_attaching() {
        let mut h = Harness::new();
        let actor = Uuid::new_v4();
        let mut arms = ArmController::new(actor, OwnershipGate::hosted(actor));
        let mut hit = hit_at(Point3::new(0.0, 0.0, 2.0), 2.0);
        hit.tag = ColliderTag::Flag;
        let report = report_with_hit(Point3::origin(), hit);
        arms.aim(&report, 10.0);

        assert_eq!(arms.grab(0, &report, &mut h.ctx()), GrabOutcome::RedirectedToFlag);
        assert!(!arms.slots()[0].is_attached());
        assert_eq!(h.requests, vec![(actor, Request::ClaimFlag { actor })]);
    }

    #[test]
    fn no_connection_target_is_a_no_op() {
        let mut h = Harness::new();
        let actor = Uuid::new_v4();
        let mut arms = ArmController::new(actor, OwnershipGate::hosted(actor));
        let mut hit = hit_at(Point3::new(0.0, 0.0, 2.0), 2.0);
        hit.tag = ColliderTag::NoConnection;
        let report = report_with_hit(Point3::origin(), hit);
        arms.aim(&report, 10.0);

        assert_eq!(arms.grab(0, &report, &mut h.ctx()), GrabOutcome::NoConnection);
        assert!(!arms.slots()[0].is_attached());
    }

    #[test]
    fn observer_cannot_grab() {
        let mut h = Harness::new();
        let actor = Uuid::new_v4();
        let mut arms = ArmController::new(actor, OwnershipGate::observer(actor));
        let report = report_with_hit(Point3::origin(), hit_at(Point3::new(0.0, 0.0, 2.0), 2.0));
        arms.aim(&report, 10.0);

        assert_eq!(arms.grab(0, &report, &mut h.ctx()), GrabOutcome::NotOwner);
    }

    #[test]
    fn release_on_idle_slot_changes_nothing() {
        let actor = Uuid::new_v4();
        let mut arms = ArmController::new(actor, OwnershipGate::hosted(actor));
        assert_eq!(arms.release(1), ReleaseOutcome::NotAttached);
        assert!(!arms.take_dirty());
        assert_eq!(arms.release(9), ReleaseOutcome::InvalidSlot);
    }

    #[test]
    fn force_pulls_actor_toward_static_anchor() {
        let mut h = Harness::new();
        let (mut arms, report) = attached_arms(&mut h, Point3::new(0.0, 0.0, 2.0));
        arms.apply_forces(&report, &mut h.ctx());

        let force = h.tuning.arm.force;
        assert_eq!(
            h.physics,
            vec![PhysicsCommand::AddForce {
                target: BodyTarget::Actor(arms.actor),
                force: Vector3::new(0.0, 0.0, force),
            }]
        );
    }

    #[test]
    fn force_pulls_free_body_and_anchor_follows_it() {
        let mut h = Harness::new();
        let actor = Uuid::new_v4();
        let mut arms = ArmController::new(actor, OwnershipGate::hosted(actor));
        let body = BodyState {
            id: 42,
            position: Point3::new(0.0, 0.0, 3.0),
            rotation: UnitQuaternion::identity(),
            kinematic: false,
        };
        let mut hit = hit_at(Point3::new(0.0, 0.0, 2.5), 2.5);
        hit.body = Some(body);
        let report = report_with_hit(Point3::origin(), hit);
        arms.aim(&report, 10.0);
        arms.grab(0, &report, &mut h.ctx());

        let mut moved = BodyReport::at(Point3::origin());
        moved.bodies.push(BodyState {
            position: Point3::new(1.0, 0.0, 3.0),
            ..body
        });
        arms.apply_forces(&moved, &mut h.ctx());

        assert_eq!(arms.slots()[0].anchor_point(), Some(Point3::new(1.0, 0.0, 2.5)));
        match h.physics[0] {
            PhysicsCommand::AddForce { target, force } => {
                assert_eq!(target, BodyTarget::Body(42));
                assert!(force.z < 0.0);
            }
            other => panic!("unexpected command {other:?}"),
        }

        // Body went away: actor is pulled toward the last anchor
        h.physics.clear();
        arms.apply_forces(&BodyReport::at(Point3::origin()), &mut h.ctx());
        assert!(matches!(
            h.physics[0],
            PhysicsCommand::AddForce { target: BodyTarget::Actor(_), .. }
        ));
    }

    #[test]
    fn stretch_within_limit_does_not_break() {
        let mut h = Harness::new();
        let (mut arms, _) = attached_arms(&mut h, Point3::new(0.0, 0.0, 2.0));

        // 3.0 from the anchor: limit is max(25, 1.25 * 2.0) = 25
        let report = BodyReport::at(Point3::new(0.0, 0.0, -1.0));
        assert!(arms.try_break(&report, &mut h.ctx()).is_empty());
        assert!(arms.slots()[0].is_attached());
    }

    #[test]
    fn stretch_past_limit_breaks_and_arms_regeneration() {
        let mut h = Harness::new();
        let (mut arms, _) = attached_arms(&mut h, Point3::new(0.0, 0.0, 2.0));

        // 26.0 from the anchor
        let report = BodyReport::at(Point3::new(0.0, 0.0, -24.0));
        let impulses = arms.try_break(&report, &mut h.ctx());

        let slot = &arms.slots()[0];
        assert!(slot.is_broken());
        assert!(!slot.is_attached());
        assert_eq!(slot.phase(), SlotPhase::Regenerating);

        // (0, 0, -26) -> 10 * (0, 26, -26)
        assert_eq!(impulses, vec![Vector3::new(0.0, 260.0, -260.0)]);

        let key = TimerKey::new(arms.actor, TimerKind::Regenerate(0));
        assert_eq!(h.timers.remaining(key), Some(Duration::from_secs(5)));
        assert!(matches!(h.requests[0].1, Request::SpawnArm { slot: 0, .. }));
    }

    #[test]
    fn break_releases_other_slot_and_is_idempotent() {
        let mut h = Harness::new();
        let actor = Uuid::new_v4();
        let mut arms = ArmController::new(actor, OwnershipGate::hosted(actor));
        let mut report = BodyReport::at(Point3::origin());
        report.aim = [
            Some(AimProbe {
                ray: Some(hit_at(Point3::new(0.0, 0.0, 2.0), 2.0)),
                sphere: None,
            }),
            Some(AimProbe {
                ray: Some(hit_at(Point3::new(1.0, 0.0, 2.0), 2.2)),
                sphere: None,
            }),
        ];
        arms.aim(&report, 10.0);
        arms.grab(0, &report, &mut h.ctx());
        arms.grab(1, &report, &mut h.ctx());

        assert!(matches!(arms.break_slot(0, &report, &mut h.ctx()), BreakOutcome::Broken { .. }));
        assert!(!arms.slots()[1].is_attached());
        assert!(!arms.slots()[1].is_broken());
        assert_eq!(arms.break_slot(0, &report, &mut h.ctx()), BreakOutcome::AlreadyBroken);
        assert_eq!(arms.grab(0, &report, &mut h.ctx()), GrabOutcome::Broken);
    }

    #[test]
    fn never_attached_and_broken_together() {
        let mut h = Harness::new();
        let (mut arms, report) = attached_arms(&mut h, Point3::new(0.0, 0.0, 2.0));
        let far = BodyReport::at(Point3::new(0.0, 0.0, -30.0));

        for step in 0..400 {
            arms.aim(&report, 10.0);
            arms.grab(0, &report, &mut h.ctx());
            arms.apply_forces(&far, &mut h.ctx());
            arms.try_break(&far, &mut h.ctx());
            h.timers.advance(Duration::from_millis(20));
            while let Some(key) = h.timers.pop_due() {
                if let TimerKind::Regenerate(index) = key.kind {
                    arms.regenerate(index);
                }
            }
            for slot in arms.slots() {
                assert!(!(slot.is_attached() && slot.is_broken()), "step {step}");
            }
        }
    }

    #[test]
    fn regenerate_returns_slot_to_idle() {
        let mut h = Harness::new();
        let (mut arms, report) = attached_arms(&mut h, Point3::new(0.0, 0.0, 2.0));
        arms.break_slot(0, &report, &mut h.ctx());
        arms.regenerate(0);
        assert!(!arms.slots()[0].is_broken());
        assert_ne!(arms.slots()[0].phase(), SlotPhase::Regenerating);
    }

    #[test]
    fn disabling_releases_both_slots() {
        let mut h = Harness::new();
        let (mut arms, _) = attached_arms(&mut h, Point3::new(0.0, 0.0, 2.0));
        arms.set_enabled(false);
        assert!(!arms.slots()[0].is_attached());
        assert_eq!(arms.slots()[0].phase(), SlotPhase::Idle);
    }

    #[test]
    fn mirror_takes_authority_snapshot() {
        let mut h = Harness::new();
        let (arms, _) = attached_arms(&mut h, Point3::new(0.0, 0.0, 2.0));
        let mut mirror = ArmController::new(arms.actor, OwnershipGate::observer(arms.actor));
        mirror.apply_snapshot(&arms.snapshot());
        assert!(mirror.slots()[0].is_attached());
        assert_eq!(mirror.slots()[0].anchor_point(), Some(Point3::new(0.0, 0.0, 2.0)));
    }
}
