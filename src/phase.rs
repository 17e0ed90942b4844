//! Test phases, the phase barrier and the abort signal
//!
//! The global [`Phase`] has a single writer: the [`PhaseBarrier`], which the
//! run controller owns. Workers and the injector read it through a
//! [`PhaseWatch`] and rendezvous at the barrier between phases.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::HarnessFault;

/// Global test phase, in the order phases occur
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    Active,
    Teardown,
    Analyzing,
    Done,
}

/// How a participant left the barrier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Every participant arrived
    Released,
    /// The grace period expired first; the phase advanced anyway
    Broken,
}

/// Read-only view of the current phase
#[derive(Clone, Debug)]
pub struct PhaseWatch {
    rx: watch::Receiver<Phase>,
}

impl PhaseWatch {
    pub fn current(&self) -> Phase {
        *self.rx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.current() == Phase::Active
    }
}

#[derive(Default)]
struct BarrierState {
    arrivals: HashMap<Phase, usize>,
    broken: HashSet<Phase>,
    faults: Vec<HarnessFault>,
    /// Earliest time a phase is expected to begin
    due: HashMap<Phase, Instant>,
}

/// Reusable counting rendezvous with a bounded wait
///
/// `wait(phase)` blocks until all participants have called it for the same
/// phase, or until `grace` has elapsed since the caller arrived (or since the
/// phase was due, see [`PhaseBarrier::expect_at`]). Either way
/// the global phase advances to `phase`; a timeout breaks the barrier for that
/// phase and records a [`HarnessFault::BrokenBarrier`].
pub struct PhaseBarrier {
    participants: usize,
    grace: Duration,
    phase_tx: watch::Sender<Phase>,
    state: Mutex<BarrierState>,
}

impl PhaseBarrier {
    /// Create a barrier for `participants` parties, starting in `Setup`
    pub fn new(participants: usize, grace: Duration) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Setup);
        PhaseBarrier {
            participants,
            grace,
            phase_tx,
            state: Mutex::new(BarrierState::default()),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Subscribe to phase changes
    pub fn watch(&self) -> PhaseWatch {
        PhaseWatch {
            rx: self.phase_tx.subscribe(),
        }
    }

    pub fn current(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    /// Advance the phase without a rendezvous (controller-only transitions)
    pub fn advance(&self, phase: Phase) {
        self.phase_tx.send_if_modified(|current| {
            if *current < phase {
                *current = phase;
                true
            } else {
                false
            }
        });
    }

    /// Early arrivals for `phase` start their grace period at `at`
    pub fn expect_at(&self, phase: Phase, at: Instant) {
        self.state.lock().due.insert(phase, at);
    }

    /// Arrive at the barrier guarding the transition into `phase`
    pub async fn wait(&self, phase: Phase) -> BarrierOutcome {
        let mut rx = self.phase_tx.subscribe();
        let deadline = {
            let mut state = self.state.lock();
            let arrived = state.arrivals.entry(phase).or_insert(0);
            *arrived += 1;
            let arrived = *arrived;

            if self.current() >= phase {
                // Late: the barrier was already broken without us
                return Self::outcome_for(&state, phase);
            }
            if arrived >= self.participants {
                tracing::debug!(?phase, arrived, "phase barrier released");
                self.phase_tx.send_replace(phase);
                return BarrierOutcome::Released;
            }
            let now = Instant::now();
            state.due.get(&phase).map_or(now, |due| (*due).max(now)) + self.grace
        };

        let outcome = match tokio::time::timeout_at(deadline, rx.wait_for(|current| *current >= phase)).await {
            Ok(Ok(_)) => Self::outcome_for(&self.state.lock(), phase),
            Ok(Err(_)) => BarrierOutcome::Broken,
            Err(_) => self.break_for(phase),
        };
        outcome
    }

    fn break_for(&self, phase: Phase) -> BarrierOutcome {
        let mut state = self.state.lock();
        if self.current() >= phase {
            return Self::outcome_for(&state, phase);
        }

        let arrived = state.arrivals.get(&phase).copied().unwrap_or(0);
        tracing::warn!(
            ?phase,
            arrived,
            expected = self.participants,
            "phase barrier broken after {:?}",
            self.grace
        );
        state.broken.insert(phase);
        state.faults.push(HarnessFault::BrokenBarrier {
            phase,
            arrived,
            expected: self.participants,
        });
        self.phase_tx.send_replace(phase);
        BarrierOutcome::Broken
    }

    fn outcome_for(state: &BarrierState, phase: Phase) -> BarrierOutcome {
        if state.broken.contains(&phase) {
            BarrierOutcome::Broken
        } else {
            BarrierOutcome::Released
        }
    }

    /// Harness faults recorded by broken barriers so far
    pub fn faults(&self) -> Vec<HarnessFault> {
        self.state.lock().faults.clone()
    }
}

/// Run-wide stop request
///
/// Triggered by an operator interrupt, the run deadline, or a harness fault.
/// Only the first reason is kept.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        AbortSignal { tx: Arc::new(tx) }
    }

    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                tracing::warn!(%reason, "aborting run");
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves once the signal has been triggered
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_barrier_releases_when_all_arrive() {
        let barrier = Arc::new(PhaseBarrier::new(3, Duration::from_secs(5)));
        let watch = barrier.watch();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move { barrier.wait(Phase::Active).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), BarrierOutcome::Released);
        }

        assert_eq!(watch.current(), Phase::Active);
        assert!(barrier.faults().is_empty());
    }

    #[tokio::test]
    async fn test_barrier_is_reusable_across_phases() {
        let barrier = Arc::new(PhaseBarrier::new(2, Duration::from_secs(5)));
        for phase in [Phase::Active, Phase::Teardown, Phase::Analyzing] {
            let other = barrier.clone();
            let (a, b) = tokio::join!(barrier.wait(phase), other.wait(phase));
            assert_eq!(a, BarrierOutcome::Released);
            assert_eq!(b, BarrierOutcome::Released);
            assert_eq!(barrier.current(), phase);
        }
    }

    #[tokio::test]
    async fn test_missing_participant_breaks_barrier() {
        let barrier = Arc::new(PhaseBarrier::new(3, Duration::from_millis(50)));

        let (a, b) = tokio::join!(barrier.wait(Phase::Teardown), barrier.wait(Phase::Teardown));
        assert_eq!(a, BarrierOutcome::Broken);
        assert_eq!(b, BarrierOutcome::Broken);
        assert_eq!(barrier.current(), Phase::Teardown);
        assert_eq!(
            barrier.faults(),
            vec![HarnessFault::BrokenBarrier {
                phase: Phase::Teardown,
                arrived: 2,
                expected: 3,
            }]
        );

        // A straggler does not block and learns the barrier broke
        assert_eq!(barrier.wait(Phase::Teardown).await, BarrierOutcome::Broken);
    }

    #[tokio::test]
    async fn test_early_arrival_waits_until_phase_is_due() {
        let barrier = Arc::new(PhaseBarrier::new(2, Duration::from_millis(50)));
        barrier.expect_at(Phase::Teardown, Instant::now() + Duration::from_millis(300));

        let early = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait(Phase::Teardown).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(barrier.current(), Phase::Setup);

        assert_eq!(barrier.wait(Phase::Teardown).await, BarrierOutcome::Released);
        assert_eq!(early.await.unwrap(), BarrierOutcome::Released);
        assert!(barrier.faults().is_empty());
    }

    #[tokio::test]
    async fn test_advance_never_moves_backwards() {
        let barrier = PhaseBarrier::new(1, Duration::from_millis(10));
        barrier.advance(Phase::Analyzing);
        barrier.advance(Phase::Active);
        assert_eq!(barrier.current(), Phase::Analyzing);
    }

    #[tokio::test]
    async fn test_abort_keeps_first_reason() {
        let abort = AbortSignal::new();
        assert!(!abort.is_triggered());

        let waiter = {
            let abort = abort.clone();
            tokio::spawn(async move { abort.triggered().await })
        };
        abort.trigger("operator interrupt");
        abort.trigger("deadline");
        waiter.await.unwrap();

        assert_eq!(abort.reason().as_deref(), Some("operator interrupt"));
    }
}
