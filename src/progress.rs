// progress.rs: per-session progress signal.
//
// A session reports 5 when it opens, then `5 + round(step / steps * 95)`
// after each completed step. Values are strictly increasing within a
// session; 100 is only reached when the final step completes. Every exit
// (success, cancellation, error) ends with a reset, which the sink renders
// as 0 / hidden.

use parking_lot::Mutex;

/// Progress reported as soon as a session opens.
pub const INITIAL_PROGRESS: u8 = 5;

/// Consumer of the progress signal (a progress bar, a log line, a test).
pub trait ProgressSink: Send + Sync {
    /// A new value in `0..=100`, strictly greater than the last one reported
    /// in the current session.
    fn update(&self, percent: u8);

    /// The session ended; show 0 / hide the indicator.
    fn reset(&self);
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn update(&self, _percent: u8) {}
    fn reset(&self) {}
}

/// Logs every update at `debug` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn update(&self, percent: u8) {
        log::debug!("progress {percent}%");
    }

    fn reset(&self) {
        log::debug!("progress reset");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Update(u8),
    Reset,
}

/// Records every event; used by tests and by callers that poll.
#[derive(Debug, Default)]
pub struct ProgressRecorder {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// Current displayed value: the last update, or 0 after a reset.
    pub fn current(&self) -> u8 {
        match self.events.lock().last() {
            Some(ProgressEvent::Update(v)) => *v,
            _ => 0,
        }
    }
}

impl ProgressSink for ProgressRecorder {
    fn update(&self, percent: u8) {
        self.events.lock().push(ProgressEvent::Update(percent));
    }

    fn reset(&self) {
        self.events.lock().push(ProgressEvent::Reset);
    }
}

/// Progress after `step` of `steps` completed steps.
///
/// Integer form of `5 + round(step / steps * 95)`, rounding halves up.
pub fn step_progress(step: u32, steps: u32) -> u8 {
    if steps == 0 {
        return 100;
    }
    let step = step.min(steps) as u64;
    let steps = steps as u64;
    let scaled = (step * 95 * 2 + steps) / (2 * steps);
    INITIAL_PROGRESS + scaled as u8
}

/// Session-scoped view of a sink: enforces monotonicity and resets on drop.
pub(crate) struct SessionProgress<'a> {
    sink: &'a dyn ProgressSink,
    last: u8,
}

impl<'a> SessionProgress<'a> {
    pub(crate) fn open(sink: &'a dyn ProgressSink) -> Self {
        sink.update(INITIAL_PROGRESS);
        SessionProgress { sink, last: INITIAL_PROGRESS }
    }

    /// Forward `percent` if it advances the bar; drop it otherwise.
    pub(crate) fn advance(&mut self, percent: u8) {
        if percent > self.last {
            self.last = percent;
            self.sink.update(percent);
        }
    }

    pub(crate) fn last(&self) -> u8 {
        self.last
    }
}

impl Drop for SessionProgress<'_> {
    fn drop(&mut self) {
        self.sink.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formula_matches_endpoints() {
        assert_eq!(step_progress(0, 8), 5);
        assert_eq!(step_progress(8, 8), 100);
        assert_eq!(step_progress(1, 1), 100);
    }

    #[test]
    fn formula_rounds_half_up() {
        // 1/8 * 95 = 11.875 → 12; 3/8 * 95 = 35.625 → 36; 1/2 * 95 = 47.5 → 48
        assert_eq!(step_progress(1, 8), 17);
        assert_eq!(step_progress(3, 8), 41);
        assert_eq!(step_progress(4, 8), 53);
    }

    #[test]
    fn strictly_increasing_for_every_catalog_step_count() {
        for steps in [1u32, 2, 3, 4, 5, 6, 8, 10, 12, 15, 20] {
            let values: Vec<u8> = (1..=steps).map(|s| step_progress(s, steps)).collect();
            assert!(values.windows(2).all(|w| w[0] < w[1]), "steps={steps}: {values:?}");
            assert!(values[0] > INITIAL_PROGRESS);
        }
    }

    #[test]
    fn session_resets_on_drop_and_ignores_regressions() {
        let rec = ProgressRecorder::new();
        {
            let mut session = SessionProgress::open(&rec);
            session.advance(40);
            session.advance(30);
            session.advance(40);
            assert_eq!(session.last(), 40);
            assert_eq!(rec.current(), 40);
        }
        assert_eq!(
            rec.events(),
            vec![ProgressEvent::Update(5), ProgressEvent::Update(40), ProgressEvent::Reset]
        );
        assert_eq!(rec.current(), 0);
    }
}
