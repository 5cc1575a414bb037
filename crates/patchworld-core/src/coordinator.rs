//! Tick quorum tracking: the stepper may advance only when every active
//! agent and every semaphore has reported for the current tick.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard};

/// A participant the coordinator waits on each tick.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Responder {
    /// An active agent; reports by issuing any action.
    Agent(u64),
    /// A semaphore; reports while its signaled flag is raised.
    Semaphore(u64),
}

#[derive(Debug, Default)]
struct CoordinatorState {
    expected: BTreeSet<Responder>,
    reported: BTreeSet<Responder>,
    /// Reports claimed by the step in flight; cleared when it finishes.
    consumed: BTreeSet<Responder>,
    stepping: bool,
    /// Whether anything changed since the last claimed step. Quorum is only
    /// re-evaluated after an external event, so a world driven purely by
    /// still-signaled semaphores does not free-run.
    fresh: bool,
}

impl CoordinatorState {
    fn quorum_reached(&self) -> bool {
        !self.expected.is_empty() && self.expected.iter().all(|r| self.reported.contains(r))
    }
}

/// Mutex-and-condvar quorum gate. Waiters blocked in
/// [`Coordinator::wait_for_step`] are woken whenever a step completes.
#[derive(Default)]
pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    step_done: Condvar,
}

impl Coordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start expecting a responder. Joining mid-tick stalls the tick until
    /// the newcomer reports.
    pub fn add(&self, responder: Responder) {
        self.lock_state().expected.insert(responder);
    }

    /// Stop expecting a responder and forget any report it made. Removing
    /// the last missing reporter can complete the tick.
    pub fn remove(&self, responder: Responder) {
        let mut state = self.lock_state();
        state.expected.remove(&responder);
        state.reported.remove(&responder);
        state.fresh = true;
    }

    /// Drop a responder's tick obligation without forgetting its report
    /// (used when an agent is deactivated).
    pub fn exclude(&self, responder: Responder) {
        let mut state = self.lock_state();
        state.expected.remove(&responder);
        state.fresh = true;
    }

    /// Record that a responder fulfilled its obligation this tick.
    pub fn report(&self, responder: Responder) {
        let mut state = self.lock_state();
        state.reported.insert(responder);
        state.fresh = true;
    }

    /// Withdraw a report that has not been consumed by a step yet (a
    /// semaphore unsignaled before quorum).
    pub fn retract(&self, responder: Responder) {
        self.lock_state().reported.remove(&responder);
    }

    /// Whether a responder has reported this tick.
    #[must_use]
    pub fn has_reported(&self, responder: Responder) -> bool {
        self.lock_state().reported.contains(&responder)
    }

    /// Atomically check for quorum and claim the step. Exactly one caller
    /// observes `true` per tick; it must follow up with
    /// [`Coordinator::finish_step`]. Reports arriving while the step runs
    /// count toward the next tick.
    #[must_use]
    pub fn try_begin_step(&self) -> bool {
        let mut state = self.lock_state();
        if state.stepping || !state.fresh || !state.quorum_reached() {
            return false;
        }
        state.stepping = true;
        state.fresh = false;
        state.consumed = state.reported.clone();
        true
    }

    /// Complete a claimed step: drop the consumed reports, re-arm `retained`
    /// responders (semaphores that stay signaled across the boundary), and
    /// wake waiters.
    pub fn finish_step(&self, retained: impl IntoIterator<Item = Responder>) {
        let mut state = self.lock_state();
        let consumed = std::mem::take(&mut state.consumed);
        for responder in &consumed {
            state.reported.remove(responder);
        }
        for responder in retained {
            state.reported.insert(responder);
        }
        state.stepping = false;
        drop(state);
        self.step_done.notify_all();
    }

    /// Block until the next step completes.
    pub fn wait_for_step(&self) {
        let state = self.lock_state();
        let _unused = self
            .step_done
            .wait(state)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// The current reporter set, for the snapshot codec.
    #[must_use]
    pub fn reported_set(&self) -> Vec<Responder> {
        self.lock_state().reported.iter().copied().collect()
    }

    /// Restore coordinator state from a snapshot.
    pub fn restore(&self, expected: Vec<Responder>, reported: Vec<Responder>) {
        let mut state = self.lock_state();
        state.expected = expected.into_iter().collect();
        state.reported = reported.into_iter().collect();
        state.consumed.clear();
        state.stepping = false;
        state.fresh = true;
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_requires_every_expected_responder() {
        let coordinator = Coordinator::new();
        coordinator.add(Responder::Agent(1));
        coordinator.add(Responder::Semaphore(2));

        coordinator.report(Responder::Agent(1));
        assert!(!coordinator.try_begin_step());

        coordinator.report(Responder::Semaphore(2));
        assert!(coordinator.try_begin_step());
        // The step is claimed; a second caller cannot claim it again.
        assert!(!coordinator.try_begin_step());
        coordinator.finish_step([Responder::Semaphore(2)]);

        // The retained semaphore counts immediately; the agent does not, and
        // nothing new has been reported.
        assert!(!coordinator.try_begin_step());
        coordinator.report(Responder::Agent(1));
        assert!(coordinator.try_begin_step());
        coordinator.finish_step([]);
    }

    #[test]
    fn empty_expectation_never_steps() {
        let coordinator = Coordinator::new();
        assert!(!coordinator.try_begin_step());
        coordinator.report(Responder::Agent(1));
        assert!(!coordinator.try_begin_step());
    }

    #[test]
    fn removal_can_complete_a_tick() {
        let coordinator = Coordinator::new();
        coordinator.add(Responder::Agent(1));
        coordinator.add(Responder::Agent(2));
        coordinator.report(Responder::Agent(1));
        assert!(!coordinator.try_begin_step());

        coordinator.remove(Responder::Agent(2));
        assert!(coordinator.try_begin_step());
        coordinator.finish_step([]);
    }

    #[test]
    fn reports_during_a_step_survive_into_the_next_tick() {
        let coordinator = Coordinator::new();
        coordinator.add(Responder::Agent(1));
        coordinator.report(Responder::Agent(1));
        assert!(coordinator.try_begin_step());

        // The agent acts again for the next tick while the step runs.
        coordinator.report(Responder::Agent(1));
        coordinator.finish_step([]);

        assert!(coordinator.has_reported(Responder::Agent(1)));
        assert!(coordinator.try_begin_step());
        coordinator.finish_step([]);
    }

    #[test]
    fn retract_withdraws_an_unconsumed_report() {
        let coordinator = Coordinator::new();
        coordinator.add(Responder::Semaphore(3));
        coordinator.report(Responder::Semaphore(3));
        coordinator.retract(Responder::Semaphore(3));
        assert!(!coordinator.try_begin_step());
    }

    #[test]
    fn restore_round_trips_reported_set() {
        let coordinator = Coordinator::new();
        coordinator.add(Responder::Agent(1));
        coordinator.add(Responder::Semaphore(7));
        coordinator.report(Responder::Semaphore(7));

        let reported = coordinator.reported_set();
        assert_eq!(reported, vec![Responder::Semaphore(7)]);

        let other = Coordinator::new();
        other.restore(
            vec![Responder::Agent(1), Responder::Semaphore(7)],
            reported,
        );
        assert!(other.has_reported(Responder::Semaphore(7)));
        assert!(!other.try_begin_step());
        other.report(Responder::Agent(1));
        assert!(other.try_begin_step());
        other.finish_step([]);
    }
}
