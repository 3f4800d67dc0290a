//! Archive tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for dump sessions and for loading. Without the feature
//! every function here compiles to nothing.

use crate::metrics::DumpReport;
use crate::region::RegionKind;

/// Stages of building and loading an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum ArchivePhase {
    /// Eligibility analysis of candidate fields and classes.
    Check,
    /// Subgraph recording.
    Record,
    /// Compaction and table/region serialization.
    Write,
    /// Mapping regions in the loading process.
    Map,
    /// Rewriting embedded references.
    Fixup,
}

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use super::{ArchivePhase, DumpReport, RegionKind};

    /// Identifier correlating all events of one dump session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionId(pub u64);

    static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next session ID.
    pub fn next_session_id() -> SessionId {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole dump session.
    pub fn trace_dump_session(id: SessionId) -> span::EnteredSpan {
        span!(Level::DEBUG, "archive_dump", session_id = id.0).entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: ArchivePhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "archive_phase", phase = ?phase).entered()
    }

    /// A candidate field was found ineligible or failed to record.
    pub fn log_field_rejected(class: &str, field: &str, reason: &str) {
        tracing::debug!(class, field, reason, "field_rejected");
    }

    /// A whole class was found not preservable.
    pub fn log_class_rejected(class: &str, reason: &str) {
        tracing::debug!(class, reason, "class_rejected");
    }

    /// One `start_recording .. done_recording` round finished.
    pub fn log_recording_done(class: &str, walked: usize, archived: usize, new_classes: usize) {
        tracing::debug!(class, walked, archived, new_classes, "recording_done");
    }

    /// A dump session produced its archive.
    pub fn log_dump_finished(report: &DumpReport) {
        let m = &report.metrics;
        tracing::debug!(
            recordings = m.subgraph_recordings,
            archived = m.archived,
            archived_fields = m.archived_fields,
            skipped_fields = m.skipped_fields,
            total_us = u64::try_from(report.phase_times.total().as_micros()).unwrap_or(u64::MAX),
            "dump_finished"
        );
    }

    /// A region finished fixup.
    pub fn log_region_fixed_up(kind: RegionKind, patched: usize, delta: i64) {
        tracing::debug!(kind = %kind, patched, delta, "region_fixed_up");
    }

    /// A class asked for archived statics and did not get them.
    pub fn log_lookup_miss(class: &str, reason: &str) {
        tracing::debug!(class, reason, "lookup_miss");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use super::{ArchivePhase, DumpReport, RegionKind};

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionId(pub u64);

    /// Guard returned by the span stubs.
    #[derive(Debug)]
    pub struct NoopSpan;

    /// Stub function when tracing is disabled.
    pub fn next_session_id() -> SessionId {
        SessionId(0)
    }

    /// Stub function when tracing is disabled.
    pub fn trace_dump_session(_id: SessionId) -> NoopSpan {
        NoopSpan
    }

    /// Stub function when tracing is disabled.
    pub fn trace_phase(_phase: ArchivePhase) -> NoopSpan {
        NoopSpan
    }

    /// Stub function when tracing is disabled.
    pub fn log_field_rejected(_class: &str, _field: &str, _reason: &str) {}

    /// Stub function when tracing is disabled.
    pub fn log_class_rejected(_class: &str, _reason: &str) {}

    /// Stub function when tracing is disabled.
    pub fn log_recording_done(_class: &str, _walked: usize, _archived: usize, _new_classes: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_dump_finished(_report: &DumpReport) {}

    /// Stub function when tracing is disabled.
    pub fn log_region_fixed_up(_kind: RegionKind, _patched: usize, _delta: i64) {}

    /// Stub function when tracing is disabled.
    pub fn log_lookup_miss(_class: &str, _reason: &str) {}
}

pub use internal::SessionId;
