// cancel.rs: cooperative cancellation token with an auditable cause.
//
// TRANSITION TABLE
// ────────────────
//   state             trigger     next state
//   Active            User        CancelledUser
//   Active            Timeout     CancelledTimeout
//   CancelledUser     any         CancelledUser      (no-op)
//   CancelledTimeout  any         CancelledTimeout   (no-op)
//   any               reset()     Active
//
// The whole state lives in one AtomicU8 and the Active → Cancelled edge is a
// single compare-exchange, so when the timer, a user action and a visibility
// change race, exactly one of them wins and the recorded cause is that
// writer's. Later triggers in the same session observe the cancelled state
// and change nothing.
//
// The engine reads the token only at step boundaries (after a dispatch's
// completion has been awaited). Requesting cancellation never interrupts a
// dispatch that is already in flight.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use log::debug;

/// Why a session was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelCause {
    None,
    User,
    Timeout,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::None => write!(f, "none"),
            CancelCause::User => write!(f, "user"),
            CancelCause::Timeout => write!(f, "timeout"),
        }
    }
}

/// External sources that can ask a session to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTrigger {
    /// Explicit cancel action.
    UserAction,
    /// The host surface lost visibility (window hidden, tab backgrounded).
    VisibilityLost,
    /// The tier's timeout timer fired.
    Timer,
}

impl CancelTrigger {
    pub fn cause(self) -> CancelCause {
        match self {
            CancelTrigger::UserAction | CancelTrigger::VisibilityLost => CancelCause::User,
            CancelTrigger::Timer => CancelCause::Timeout,
        }
    }
}

const ACTIVE: u8 = 0;
const CANCELLED_USER: u8 = 1;
const CANCELLED_TIMEOUT: u8 = 2;

/// Shared cancel flag plus cause. Share it across tasks with `Arc`.
#[derive(Debug)]
pub struct CancellationContext {
    state: AtomicU8,
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationContext {
    pub fn new() -> Self {
        CancellationContext { state: AtomicU8::new(ACTIVE) }
    }

    /// Return to `{cancelled: false, cause: None}`. Called between sessions.
    pub fn reset(&self) {
        self.state.store(ACTIVE, Ordering::SeqCst);
    }

    /// Request cancellation with `cause`.
    ///
    /// Returns `true` if this call moved the context from active to
    /// cancelled, `false` if it was already cancelled (the earlier cause
    /// stands) or `cause` is [`CancelCause::None`].
    pub fn request(&self, cause: CancelCause) -> bool {
        let next = match cause {
            CancelCause::None => return false,
            CancelCause::User => CANCELLED_USER,
            CancelCause::Timeout => CANCELLED_TIMEOUT,
        };
        let won = self
            .state
            .compare_exchange(ACTIVE, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            debug!("cancellation requested: {cause}");
        } else {
            debug!("cancellation ({cause}) ignored, already {}", self.cause());
        }
        won
    }

    /// Convenience for [`request`](Self::request) from a named trigger.
    pub fn trigger(&self, trigger: CancelTrigger) -> bool {
        self.request(trigger.cause())
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) != ACTIVE
    }

    pub fn cause(&self) -> CancelCause {
        match self.state.load(Ordering::SeqCst) {
            CANCELLED_USER => CancelCause::User,
            CANCELLED_TIMEOUT => CancelCause::Timeout,
            _ => CancelCause::None,
        }
    }
}
