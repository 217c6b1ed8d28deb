//! Stall detection: consecutive iterations that record no new `[DONE]` entries.

/// What the controller should do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    /// Progress was made; the counter went back to zero.
    Reset,
    /// No progress, but the limit has not been reached.
    Continue,
    /// No progress for `limit` consecutive iterations.
    Abort,
}

/// Counts consecutive iterations without progress.
///
/// A limit of zero disables detection.
#[derive(Debug, Clone, Copy)]
pub struct StallDetector {
    limit: u32,
    consecutive: u32,
}

impl StallDetector {
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    /// Records one iteration given the `[DONE]` count before and after it.
    pub fn observe(&mut self, done_before: usize, done_after: usize) -> StallAction {
        if done_after > done_before {
            self.consecutive = 0;
            return StallAction::Reset;
        }
        self.record_stall()
    }

    /// Records one iteration that made no progress.
    pub fn record_stall(&mut self) -> StallAction {
        self.consecutive += 1;
        if self.limit > 0 && self.consecutive >= self.limit {
            StallAction::Abort
        } else {
            StallAction::Continue
        }
    }

    #[must_use]
    pub const fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborts_after_exactly_limit_stalls() {
        let mut detector = StallDetector::new(2);
        assert_eq!(detector.observe(3, 3), StallAction::Continue);
        assert_eq!(detector.observe(3, 3), StallAction::Abort);
        assert_eq!(detector.consecutive(), 2);
    }

    #[test]
    fn progress_resets_the_counter() {
        let mut detector = StallDetector::new(2);
        assert_eq!(detector.observe(0, 0), StallAction::Continue);
        assert_eq!(detector.observe(0, 1), StallAction::Reset);
        assert_eq!(detector.consecutive(), 0);
        assert_eq!(detector.observe(1, 1), StallAction::Continue);
    }

    #[test]
    fn zero_limit_never_aborts() {
        let mut detector = StallDetector::new(0);
        for _ in 0..100 {
            assert_eq!(detector.observe(5, 5), StallAction::Continue);
        }
    }

    #[test]
    fn skipped_iterations_count_toward_the_limit() {
        let mut detector = StallDetector::new(3);
        assert_eq!(detector.observe(1, 1), StallAction::Continue);
        assert_eq!(detector.record_stall(), StallAction::Continue);
        assert_eq!(detector.record_stall(), StallAction::Abort);
    }

    #[test]
    fn shrinking_count_is_not_progress() {
        // A reset completion log between iterations must not look like progress.
        let mut detector = StallDetector::new(1);
        assert_eq!(detector.observe(4, 0), StallAction::Abort);
    }
}
