//! Named, cancellable timers for the leader task, and the election
//! backoff.
//!
//! Each armed timer is a spawned sleep (or interval) task delivering fires
//! into a channel the leader task selects on. Cancellation aborts the task
//! and bumps a per-name generation counter; a fire that raced the
//! cancellation carries the old generation and is discarded.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The timers the leader task distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerName {
    /// Per-state deadline (observer wait, follower liveness, election and
    /// membership-probe watchdogs). Cancelled on every state exit.
    State,
    /// Leader heartbeat cadence. Cancelled on every state exit.
    SendHeartbeat,
    /// Idle-membership verification. Survives state changes.
    CheckMember,
}

/// A timer fire, tagged with the generation it was armed under.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerFired {
    pub name: TimerName,
    pub generation: u64,
}

struct Armed {
    handle: JoinHandle<()>,
    generation: u64,
}

/// The leader task's timer set.
pub(crate) struct TimerSet {
    tx: mpsc::UnboundedSender<TimerFired>,
    state: Option<Armed>,
    send_heartbeat: Option<Armed>,
    check_member: Option<Armed>,
    generation: u64,
}

impl TimerSet {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let set = Self {
            tx,
            state: None,
            send_heartbeat: None,
            check_member: None,
            generation: 0,
        };
        (set, rx)
    }

    /// Arm `name` to fire once after `after`. Replaces any previous timer
    /// of the same name.
    pub fn arm(&mut self, name: TimerName, after: Duration) {
        self.cancel(name);
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(TimerFired { name, generation });
        });
        *self.slot(name) = Some(Armed { handle, generation });
    }

    /// Arm `name` to fire immediately and then every `every`. Replaces any
    /// previous timer of the same name.
    pub fn arm_periodic(&mut self, name: TimerName, every: Duration) {
        self.cancel(name);
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if tx.send(TimerFired { name, generation }).is_err() {
                    return;
                }
            }
        });
        *self.slot(name) = Some(Armed { handle, generation });
    }

    pub fn cancel(&mut self, name: TimerName) {
        if let Some(armed) = self.slot(name).take() {
            armed.handle.abort();
        }
    }

    /// Cancel the timers scoped to the current state.
    pub fn cancel_state_scoped(&mut self) {
        self.cancel(TimerName::State);
        self.cancel(TimerName::SendHeartbeat);
    }

    pub fn is_armed(&self, name: TimerName) -> bool {
        self.slot_ref(name).is_some()
    }

    /// Whether a delivered fire belongs to the currently armed timer.
    pub fn is_current(&self, fired: &TimerFired) -> bool {
        match self.slot_ref(fired.name) {
            Some(armed) => armed.generation == fired.generation,
            None => false,
        }
    }

    fn slot(&mut self, name: TimerName) -> &mut Option<Armed> {
        match name {
            TimerName::State => &mut self.state,
            TimerName::SendHeartbeat => &mut self.send_heartbeat,
            TimerName::CheckMember => &mut self.check_member,
        }
    }

    fn slot_ref(&self, name: TimerName) -> &Option<Armed> {
        match name {
            TimerName::State => &self.state,
            TimerName::SendHeartbeat => &self.send_heartbeat,
            TimerName::CheckMember => &self.check_member,
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel(TimerName::State);
        self.cancel(TimerName::SendHeartbeat);
        self.cancel(TimerName::CheckMember);
    }
}

/// Exponential election backoff.
///
/// Scales the randomized observer wait. Doubles on a failed election,
/// resets to 1 when leadership is won, tracked, or granted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    factor: u32,
    max: u32,
}

impl Backoff {
    pub fn new(max: u32) -> Self {
        Self { factor: 1, max }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    pub fn double(&mut self) {
        self.factor = (self.factor * 2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.factor = 1;
    }

    /// The observer wait: `H + rand(1..=observer_multiplier·factor·H)`,
    /// in milliseconds.
    pub fn observer_wait(&self, heartbeat_interval: Duration, observer_multiplier: u32) -> Duration {
        let base = heartbeat_interval.as_millis() as u64;
        let bound = base * u64::from(observer_multiplier) * u64::from(self.factor);
        let jitter = rand::random::<u64>() % bound.max(1) + 1;
        Duration::from_millis(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(16);
        assert_eq!(b.factor(), 1);
        b.double();
        b.double();
        assert_eq!(b.factor(), 4);
        for _ in 0..10 {
            b.double();
        }
        assert_eq!(b.factor(), 16);
        b.reset();
        assert_eq!(b.factor(), 1);
    }

    #[test]
    fn observer_wait_stays_in_bounds() {
        let b = Backoff::new(16);
        let h = Duration::from_millis(100);
        for _ in 0..100 {
            let wait = b.observer_wait(h, 5);
            assert!(wait > h);
            assert!(wait <= h + Duration::from_millis(500));
        }
    }

    #[test]
    fn observer_wait_grows_with_backoff() {
        let mut b = Backoff::new(16);
        b.double();
        b.double();
        let h = Duration::from_millis(100);
        for _ in 0..100 {
            let wait = b.observer_wait(h, 5);
            assert!(wait <= h + Duration::from_millis(2000));
        }
    }

    #[tokio::test]
    async fn cancelled_fire_is_stale() {
        let (mut timers, mut rx) = TimerSet::new();
        timers.arm(TimerName::State, Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fired = rx.try_recv().unwrap();
        assert!(timers.is_current(&fired));

        // Re-arming invalidates the old fire.
        timers.arm(TimerName::State, Duration::from_secs(60));
        assert!(!timers.is_current(&fired));
    }

    #[tokio::test]
    async fn periodic_timer_fires_repeatedly() {
        let (mut timers, mut rx) = TimerSet::new();
        timers.arm_periodic(TimerName::SendHeartbeat, Duration::from_millis(5));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.name, TimerName::SendHeartbeat);
        assert_eq!(first.generation, second.generation);
        assert!(timers.is_current(&second));
    }
}
