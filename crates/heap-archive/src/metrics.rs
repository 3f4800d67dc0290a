//! Dump statistics.
//!
//! Diagnostics only: nothing in the archive depends on these numbers.

use std::time::{Duration, Instant};

/// Counters of one `start_recording .. done_recording` round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingStats {
    /// Objects visited for the first time in this recording.
    pub walked: usize,
    /// Objects copied into a region in this recording.
    pub archived: usize,
    /// Classes added to the root's class list in this recording.
    pub recorded_classes: usize,
}

/// Cumulative statistics of a dump session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveMetrics {
    /// Completed recordings.
    pub subgraph_recordings: usize,
    /// Total objects walked.
    pub walked: usize,
    /// Total objects archived.
    pub archived: usize,
    /// Total classes recorded.
    pub recorded_classes: usize,
    /// Entry fields that were archived.
    pub archived_fields: usize,
    /// Entry fields skipped as ineligible or failed.
    pub skipped_fields: usize,
    /// Subgraphs verified against the live graph.
    pub verifications: usize,
}

impl ArchiveMetrics {
    /// Create a new `ArchiveMetrics` with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            subgraph_recordings: 0,
            walked: 0,
            archived: 0,
            recorded_classes: 0,
            archived_fields: 0,
            skipped_fields: 0,
            verifications: 0,
        }
    }

    /// Folds one finished recording into the totals.
    pub fn add_recording(&mut self, stats: &RecordingStats) {
        self.subgraph_recordings += 1;
        self.walked += stats.walked;
        self.archived += stats.archived;
        self.recorded_classes += stats.recorded_classes;
    }
}

/// Final statistics of a finished dump session.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpReport {
    /// Recording and eligibility totals.
    pub metrics: ArchiveMetrics,
    /// Time spent per phase, write phase included.
    pub phase_times: PhaseTimer,
}

/// Wall-clock time spent in each dump phase.
///
/// # Example
///
/// ```
/// use heap_archive::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... eligibility checks ...
/// timer.end_check();
///
/// timer.start();
/// // ... recording ...
/// timer.end_record();
/// assert!(timer.total() >= timer.check);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Accumulated eligibility check time.
    pub check: Duration,
    /// Accumulated recording time.
    pub record: Duration,
    /// Accumulated table and region write time.
    pub write: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            check: Duration::ZERO,
            record: Duration::ZERO,
            write: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the check phase and add its duration.
    pub fn end_check(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.check += start.elapsed();
        }
    }

    /// End the record phase and add its duration.
    pub fn end_record(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.record += start.elapsed();
        }
    }

    /// End the write phase and add its duration.
    pub fn end_write(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.write += start.elapsed();
        }
    }

    /// Sum of all phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.check + self.record + self.write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_recording() {
        let mut metrics = ArchiveMetrics::new();
        metrics.add_recording(&RecordingStats {
            walked: 3,
            archived: 2,
            recorded_classes: 1,
        });
        metrics.add_recording(&RecordingStats {
            walked: 1,
            archived: 0,
            recorded_classes: 0,
        });
        assert_eq!(metrics.subgraph_recordings, 2);
        assert_eq!(metrics.walked, 4);
        assert_eq!(metrics.archived, 2);
        assert_eq!(metrics.recorded_classes, 1);
    }

    #[test]
    fn test_phase_timer_ignores_unstarted_end() {
        let mut timer = PhaseTimer::new();
        timer.end_write();
        assert_eq!(timer.write, Duration::ZERO);
        timer.start();
        timer.end_write();
        assert_eq!(timer.total(), timer.write);
    }
}
