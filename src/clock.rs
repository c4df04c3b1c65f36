// clock.rs: one-shot timers for timeout supervision.
//
// The orchestrator never sleeps itself; it asks a `Clock` to run a callback
// after the tier's timeout and cancels the timer when the attempt ends.
// `TokioClock` backs timers with spawned tokio tasks (so a paused test clock
// drives them too). `ManualClock` fires callbacks only when advanced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::AbortHandle;

/// Identifies a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait Clock: Send + Sync {
    /// Run `callback` once after `delay`, unless cancelled first.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Cancel a pending timer. No-op if it already fired or was cancelled.
    fn cancel(&self, handle: TimerHandle);
}

// ---------------------------------------------------------------------------
// Tokio
// ---------------------------------------------------------------------------

/// Timers as tokio tasks on a runtime handle.
pub struct TokioClock {
    runtime: Handle,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioClock {
    pub fn new(runtime: Handle) -> Self {
        TokioClock { runtime, next_id: AtomicU64::new(1), pending: Arc::default() }
    }

    /// Use the runtime this is called from.
    pub fn current() -> Result<Self, TryCurrentError> {
        Handle::try_current().map(Self::new)
    }

    /// Timers scheduled and not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Clock for TokioClock {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        // Hold the lock across spawn so the task cannot remove its entry
        // before it is inserted.
        let mut guard = self.pending.lock();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if pending.lock().remove(&id).is_some() {
                callback();
            }
        });
        guard.insert(id, task.abort_handle());
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = self.pending.lock().remove(&handle.0) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Manual
// ---------------------------------------------------------------------------

struct ManualTimer {
    id: u64,
    due: Duration,
    callback: TimerCallback,
}

/// A clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    next_id: AtomicU64,
    timers: Mutex<Vec<ManualTimer>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        *self.now.lock()
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }

    /// Move time forward and fire every timer that is now due, earliest first.
    pub fn advance(&self, by: Duration) {
        let now = {
            let mut now = self.now.lock();
            *now += by;
            *now
        };
        let mut due: Vec<ManualTimer> = {
            let mut timers = self.timers.lock();
            let (due, rest): (Vec<_>, Vec<_>) =
                timers.drain(..).partition(|t| t.due <= now);
            *timers = rest;
            due
        };
        due.sort_by_key(|t| (t.due, t.id));
        for timer in due {
            (timer.callback)();
        }
    }
}

impl Clock for ManualClock {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let due = self.now() + delay;
        self.timers.lock().push(ManualTimer { id, due, callback });
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.timers.lock().retain(|t| t.id != handle.0);
    }
}
