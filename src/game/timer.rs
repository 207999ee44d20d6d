//! Cancellable tick-advanced countdowns
//!
//! Regeneration after a break, the ragdoll hold and the squish hold are all
//! countdowns keyed by actor (and slot). They advance once per simulation
//! step and are drained one at a time with [`TimerService::pop_due`], so a
//! handler that cancels another timer during the drain always wins over
//! that timer's completion on the same tick.

use std::collections::BTreeMap;
use std::time::Duration;

use super::ActorId;

/// What a countdown is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Arm regeneration for one grab slot
    Regenerate(usize),
    /// Maximum ragdoll hold
    RagdollHold,
    /// Squish hold
    SquishHold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    pub actor: ActorId,
    pub kind: TimerKind,
}

impl TimerKey {
    pub fn new(actor: ActorId, kind: TimerKind) -> Self {
        Self { actor, kind }
    }
}

#[derive(Debug, Clone, Copy)]
struct Countdown {
    duration: Duration,
    elapsed: Duration,
}

impl Countdown {
    fn is_due(&self) -> bool {
        self.elapsed >= self.duration
    }
}

/// Scheduler of keyed countdowns, one per match
#[derive(Debug, Default)]
pub struct TimerService {
    timers: BTreeMap<TimerKey, Countdown>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a countdown. Any pending countdown under the same
    /// key is cancelled first, so at most one completion can ever fire per key.
    pub fn start(&mut self, key: TimerKey, duration: Duration) {
        self.timers.insert(
            key,
            Countdown {
                duration,
                elapsed: Duration::ZERO,
            },
        );
    }

    /// Cancel a pending countdown. Returns false if nothing was pending.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.timers.remove(&key).is_some()
    }

    /// Cancel every countdown that belongs to `actor`
    pub fn cancel_actor(&mut self, actor: ActorId) -> usize {
        let before = self.timers.len();
        self.timers.retain(|key, _| key.actor != actor);
        before - self.timers.len()
    }

    pub fn is_pending(&self, key: TimerKey) -> bool {
        self.timers.contains_key(&key)
    }

    pub fn elapsed(&self, key: TimerKey) -> Option<Duration> {
        self.timers.get(&key).map(|c| c.elapsed)
    }

    pub fn remaining(&self, key: TimerKey) -> Option<Duration> {
        self.timers
            .get(&key)
            .map(|c| c.duration.saturating_sub(c.elapsed))
    }

    /// Bring a countdown closer to completion. Remaining time never goes below zero.
    pub fn shorten(&mut self, key: TimerKey, by: Duration) -> bool {
        match self.timers.get_mut(&key) {
            Some(countdown) => {
                countdown.elapsed = (countdown.elapsed + by).min(countdown.duration);
                true
            }
            None => false,
        }
    }

    /// Advance every pending countdown by one step
    pub fn advance(&mut self, step: Duration) {
        for countdown in self.timers.values_mut() {
            countdown.elapsed = (countdown.elapsed + step).min(countdown.duration);
        }
    }

    /// Remove and return the next countdown that has completed
    pub fn pop_due(&mut self) -> Option<TimerKey> {
        let key = self
            .timers
            .iter()
            .find(|(_, countdown)| countdown.is_due())
            .map(|(key, _)| *key)?;
        self.timers.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const STEP: Duration = Duration::from_millis(20);

    fn run_ticks(timers: &mut TimerService, ticks: usize) -> Vec<TimerKey> {
        let mut fired = Vec::new();
        for _ in 0..ticks {
            timers.advance(STEP);
            while let Some(key) = timers.pop_due() {
                fired.push(key);
            }
        }
        fired
    }

    #[test]
    fn fires_once_after_duration() {
        let mut timers = TimerService::new();
        let key = TimerKey::new(Uuid::new_v4(), TimerKind::Regenerate(0));
        timers.start(key, Duration::from_millis(100));

        assert!(run_ticks(&mut timers, 4).is_empty());
        assert_eq!(run_ticks(&mut timers, 1), vec![key]);
        assert!(run_ticks(&mut timers, 10).is_empty());
        assert!(!timers.is_pending(key));
    }

    #[test]
    fn cancel_before_expiry_prevents_completion() {
        let mut timers = TimerService::new();
        let key = TimerKey::new(Uuid::new_v4(), TimerKind::Regenerate(1));
        timers.start(key, Duration::from_millis(60));
        run_ticks(&mut timers, 2);

        assert!(timers.cancel(key));
        assert!(run_ticks(&mut timers, 10).is_empty());
        assert!(!timers.cancel(key));
    }

    #[test]
    fn restart_replaces_pending_countdown() {
        let mut timers = TimerService::new();
        let key = TimerKey::new(Uuid::new_v4(), TimerKind::Regenerate(0));
        timers.start(key, Duration::from_millis(100));
        run_ticks(&mut timers, 3);
        timers.start(key, Duration::from_millis(100));

        assert_eq!(timers.len(), 1);
        assert!(run_ticks(&mut timers, 4).is_empty());
        assert_eq!(run_ticks(&mut timers, 10), vec![key]);
    }

    #[test]
    fn cancel_during_drain_wins_over_same_tick_completion() {
        let mut timers = TimerService::new();
        let actor = Uuid::new_v4();
        let first = TimerKey::new(actor, TimerKind::Regenerate(0));
        let second = TimerKey::new(actor, TimerKind::RagdollHold);
        timers.start(first, STEP);
        timers.start(second, STEP);

        timers.advance(STEP);
        assert_eq!(timers.pop_due(), Some(first));
        // Handler for `first` cancels `second` before it is drained
        assert!(timers.cancel(second));
        assert_eq!(timers.pop_due(), None);
    }

    #[test]
    fn shorten_clamps_at_zero_remaining() {
        let mut timers = TimerService::new();
        let key = TimerKey::new(Uuid::new_v4(), TimerKind::SquishHold);
        timers.start(key, Duration::from_millis(300));

        assert!(timers.shorten(key, Duration::from_millis(200)));
        assert_eq!(timers.remaining(key), Some(Duration::from_millis(100)));
        timers.shorten(key, Duration::from_secs(10));
        assert_eq!(timers.remaining(key), Some(Duration::ZERO));
        assert_eq!(timers.elapsed(key), Some(Duration::from_millis(300)));
    }

    #[test]
    fn cancel_actor_drops_only_that_actor() {
        let mut timers = TimerService::new();
        let gone = Uuid::new_v4();
        let stays = Uuid::new_v4();
        timers.start(TimerKey::new(gone, TimerKind::Regenerate(0)), STEP);
        timers.start(TimerKey::new(gone, TimerKind::RagdollHold), STEP);
        timers.start(TimerKey::new(stays, TimerKind::SquishHold), STEP);

        assert_eq!(timers.cancel_actor(gone), 2);
        let fired = run_ticks(&mut timers, 1);
        assert_eq!(fired, vec![TimerKey::new(stays, TimerKind::SquishHold)]);
    }
}
