/// Result of offering one progress sample to a [`ProgressTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Newer than anything seen so far; callers should publish it.
    Applied(u8),
    /// Issued before the last applied sample; discard.
    Stale,
    /// Newer, but lower than progress already reported; discard.
    Regressed,
}

/// Orders progress samples by the sequence number they were issued with.
///
/// Published progress never decreases over a job's lifetime, regardless of
/// the order responses arrive in.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    last_seq: u64,
    last_progress: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, seq: u64, progress: u8) -> Observation {
        if seq <= self.last_seq {
            return Observation::Stale;
        }
        self.last_seq = seq;
        if progress < self.last_progress {
            return Observation::Regressed;
        }
        self.last_progress = progress;
        Observation::Applied(progress)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn progress(&self) -> u8 {
        self.last_progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_out_of_order_response_is_discarded() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.observe(1, 10), Observation::Applied(10));
        assert_eq!(tracker.observe(3, 45), Observation::Applied(45));
        // seq 2 resolved after seq 3
        assert_eq!(tracker.observe(2, 30), Observation::Stale);
        assert_eq!(tracker.progress(), 45);
        assert_eq!(tracker.last_seq(), 3);
    }

    #[test]
    fn test_regression_is_not_published() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(1, 60);
        assert_eq!(tracker.observe(2, 55), Observation::Regressed);
        assert_eq!(tracker.observe(3, 60), Observation::Applied(60));
        assert_eq!(tracker.observe(4, 100), Observation::Applied(100));
    }

    proptest! {
        #[test]
        fn published_progress_is_non_decreasing(
            samples in prop::collection::vec((1u64..64, 0u8..=100), 0..64)
        ) {
            let mut tracker = ProgressTracker::new();
            let mut published = Vec::new();
            for (seq, progress) in samples {
                if let Observation::Applied(p) = tracker.observe(seq, progress) {
                    published.push((seq, p));
                }
            }
            for pair in published.windows(2) {
                prop_assert!(pair[0].0 < pair[1].0);
                prop_assert!(pair[0].1 <= pair[1].1);
            }
        }
    }
}
