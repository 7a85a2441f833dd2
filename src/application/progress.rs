//! Dual-track progress estimation for one export session.
//!
//! Real completion events are coarse: integer counts that arrive in bursts,
//! sometimes with long gaps while a render is in flight. The UI wants a value
//! that moves continuously, never stalls visibly, never moves backward, and
//! lands on exactly 100 only when the session is truly done. The estimator
//! keeps two tracks: the authoritative `completed`/`expected` counters and a
//! simulated `displayed` value advanced on a fixed tick toward a ceiling 98 %
//! into the segment currently in flight. A real completion jumps the value
//! 2 % into the next segment, so the UI visibly ticks over the moment real
//! progress is confirmed.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default cadence of the simulated-track tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(60);

/// How far into the in-flight segment the simulated track may creep on its
/// own before the next real completion unlocks the following segment.
const SEGMENT_HEADROOM: f64 = 0.98;

/// Where the simulated track lands inside a segment immediately after a real
/// completion event.
const SEGMENT_FOOTHOLD: f64 = 0.02;

/// Session lifecycle of the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Completed,
}

/// Point-in-time view of both tracks, polled by the caller/UI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub expected: usize,
    /// The only externally rendered value, in [0, 100].
    pub displayed: f64,
    pub phase: Phase,
}

#[derive(Debug)]
struct ProgressState {
    completed: usize,
    expected: usize,
    displayed: f64,
    phase: Phase,
    revised: bool,
}

impl ProgressState {
    fn idle() -> Self {
        Self {
            completed: 0,
            expected: 0,
            displayed: 0.0,
            phase: Phase::Idle,
            revised: false,
        }
    }

    fn segment(&self) -> f64 {
        100.0 / self.expected as f64
    }

    /// Maximum value the simulated track may reach before the next real
    /// completion event.
    fn ceiling(&self) -> f64 {
        let segment = self.segment();
        (self.completed as f64 * segment + segment * SEGMENT_HEADROOM).min(100.0)
    }
}

/// Reconciles coarse completion counts with a smoothly animated progress
/// value.
///
/// Both the ticker task and the completion callback read-modify-write the
/// shared state, so it lives behind a mutex. Cloning the estimator yields a
/// handle onto the same session.
#[derive(Clone)]
pub struct ProgressEstimator {
    inner: Arc<EstimatorInner>,
}

struct EstimatorInner {
    state: Mutex<ProgressState>,
    tick_interval: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressEstimator {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            inner: Arc::new(EstimatorInner {
                state: Mutex::new(ProgressState::idle()),
                tick_interval,
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Begin a session expecting `expected` completions and start the tick
    /// task. A no-op returning `false` while a session is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, expected: NonZeroUsize) -> bool {
        if !self.transition_to_running(expected) {
            return false;
        }
        self.spawn_ticker();
        true
    }

    /// Record that one job settled (success and failure both count: the real
    /// track follows attempts finished, not successes).
    pub fn record_completion(&self) {
        let mut state = self.lock_state();
        if state.phase != Phase::Running {
            return;
        }

        state.completed = (state.completed + 1).min(state.expected);
        if state.completed == state.expected {
            state.displayed = 100.0;
            state.phase = Phase::Completed;
            // The ticker observes the phase change and exits on its next tick.
            return;
        }

        let segment = state.segment();
        let foothold = state.completed as f64 * segment + segment * SEGMENT_FOOTHOLD;
        state.displayed = state.displayed.max(foothold).min(100.0);
    }

    /// Revise the expectation once, e.g. from the requested page count to the
    /// number of jobs that survived enumeration. The revision never drops
    /// below `completed` and never moves `displayed` backward: when the new
    /// ceiling sits below the current value, the simulated track holds until
    /// the real track catches up.
    pub fn revise_expected(&self, expected: NonZeroUsize) {
        let mut state = self.lock_state();
        if state.phase != Phase::Running || state.revised {
            return;
        }
        state.revised = true;
        state.expected = expected.get().max(state.completed);
        if state.completed == state.expected {
            state.displayed = 100.0;
            state.phase = Phase::Completed;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.lock_state();
        ProgressSnapshot {
            completed: state.completed,
            expected: state.expected,
            displayed: state.displayed,
            phase: state.phase,
        }
    }

    /// Tear the session down: stop the tick task and zero the state. Safe to
    /// call in any phase.
    pub fn reset(&self) {
        if let Some(handle) = self.lock_ticker().take() {
            handle.abort();
        }
        let mut state = self.lock_state();
        *state = ProgressState::idle();
    }

    fn transition_to_running(&self, expected: NonZeroUsize) -> bool {
        let mut state = self.lock_state();
        if state.phase == Phase::Running {
            return false;
        }
        *state = ProgressState::idle();
        state.expected = expected.get();
        state.phase = Phase::Running;
        true
    }

    fn spawn_ticker(&self) {
        let estimator = self.clone();
        let tick_interval = self.inner.tick_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !estimator.tick_once() {
                    break;
                }
            }
        });
        if let Some(previous) = self.lock_ticker().replace(handle) {
            previous.abort();
        }
    }

    /// Advance the simulated track one step toward the current ceiling.
    /// Returns `false` once the session left the running phase.
    fn tick_once(&self) -> bool {
        let mut state = self.lock_state();
        if state.phase != Phase::Running {
            return false;
        }

        let ceiling = state.ceiling();
        let distance = ceiling - state.displayed;
        if distance <= 0.0 {
            return true;
        }

        // Larger steps far from the ceiling, smaller close to it: the value
        // decelerates instead of crawling linearly.
        let step = if distance > 10.0 {
            1.5
        } else if distance > 5.0 {
            1.0
        } else {
            0.5
        };
        state.displayed = (state.displayed + step).min(ceiling);
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, ProgressState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ticker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
