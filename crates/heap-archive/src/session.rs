//! Dump sessions.
//!
//! An [`ArchiveSession`] owns every piece of dump-time state: registered
//! candidates, the eligibility caches, the object cache, the region images,
//! the subgraph infos and the statistics. Nothing outlives the session
//! except the [`HeapArchive`] it produces.
//!
//! # Example
//!
//! ```
//! use heap_archive::{ArchiveConfig, ArchiveSession, ClassDesc, LiveHeap, RegionKind, Slot};
//!
//! let mut heap = LiveHeap::new();
//! let config_class = heap.define_class(ClassDesc::new("Config").static_ref("INSTANCE"));
//! let obj = heap.alloc(config_class, vec![Slot::Prim(8080)]);
//! heap.set_static(config_class, "INSTANCE", Slot::Ref(Some(obj)));
//!
//! let mut session = ArchiveSession::new(ArchiveConfig::new(), &heap).unwrap();
//! session.add_preservable_static_field("Config", "INSTANCE", RegionKind::Open);
//! session.check_preservable_classes_and_fields();
//! session.archive_all();
//! let archive = session.finish().unwrap().expect("archiving is enabled");
//! assert_eq!(archive.table().unwrap().len(), 1);
//! ```

use crate::archive::HeapArchive;
use crate::candidate::CandidateField;
use crate::config::ArchiveConfig;
use crate::eligibility::EligibilityAnalyzer;
use crate::error::Result;
use crate::metrics::{ArchiveMetrics, DumpReport, PhaseTimer, RecordingStats};
use crate::model::{ClassId, ObjectGraph};
use crate::record::ArchivedRecord;
use crate::recorder::SubgraphRecorder;
use crate::region::RegionKind;
use crate::subgraph::EntryField;
use crate::table::CompactTableWriter;
use crate::tracing::internal::{
    log_dump_finished, log_field_rejected, next_session_id, trace_dump_session, trace_phase, SessionId,
};
use crate::tracing::ArchivePhase;
use crate::writer::HeapWriter;

#[derive(Debug)]
struct DumpState {
    analyzer: EligibilityAnalyzer,
    candidates: Vec<CandidateField>,
    class_names: Vec<String>,
    classes: Vec<ClassId>,
    checked: bool,
    recorder: SubgraphRecorder,
    timer: PhaseTimer,
}

/// The archiving context of one dump.
pub struct ArchiveSession<'g> {
    id: SessionId,
    config: ArchiveConfig,
    graph: &'g dyn ObjectGraph,
    state: Option<DumpState>,
}

impl std::fmt::Debug for ArchiveSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSession")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'g> ArchiveSession<'g> {
    /// Starts a session over a quiesced graph.
    ///
    /// With archiving disabled the session is inert: registration is
    /// ignored and [`ArchiveSession::finish`] returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Fails if an enabled configuration is invalid.
    pub fn new(config: ArchiveConfig, graph: &'g dyn ObjectGraph) -> Result<Self> {
        let state = if config.enabled {
            let writer = HeapWriter::new(&config)?;
            Some(DumpState {
                analyzer: EligibilityAnalyzer::new(config.excluded_classes.iter().cloned()),
                candidates: Vec::new(),
                class_names: Vec::new(),
                classes: Vec::new(),
                checked: false,
                recorder: SubgraphRecorder::new(writer, config.verify_subgraphs),
                timer: PhaseTimer::new(),
            })
        } else {
            None
        };
        Ok(Self {
            id: next_session_id(),
            config,
            graph,
            state,
        })
    }

    /// Returns `true` if this session archives anything.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    /// The session's configuration.
    #[must_use]
    pub const fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Registers one static reference field whose graph should be archived
    /// into region `kind`. The class does not need to be loaded yet.
    ///
    /// Returns `false` if archiving is disabled or the field is already
    /// registered.
    pub fn add_preservable_static_field(&mut self, class_name: &str, field_name: &str, kind: RegionKind) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        if state
            .candidates
            .iter()
            .any(|c| c.class_name() == class_name && c.field_name() == field_name)
        {
            return false;
        }
        state.candidates.push(CandidateField::new(class_name, field_name, kind));
        true
    }

    /// Registers a class all of whose statics should be archived.
    ///
    /// Returns `false` if archiving is disabled or the class is already
    /// registered.
    pub fn add_preservable_class(&mut self, class_name: &str) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        if state.class_names.iter().any(|c| c == class_name) {
            return false;
        }
        state.class_names.push(class_name.to_owned());
        true
    }

    /// Registered candidate fields, in registration order.
    #[must_use]
    pub fn candidates(&self) -> &[CandidateField] {
        self.state.as_ref().map_or(&[][..], |s| s.candidates.as_slice())
    }

    /// Runs the eligibility analysis: the class pass over registered classes
    /// first, then the field pass over candidates. Runs once; later calls
    /// are no-ops.
    pub fn check_preservable_classes_and_fields(&mut self) {
        let graph = self.graph;
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if state.checked {
            return;
        }
        let _span = trace_phase(ArchivePhase::Check);
        state.timer.start();
        state.classes = state
            .class_names
            .iter()
            .filter_map(|name| graph.find_class(name))
            .collect();
        state.analyzer.check_classes(graph, &state.classes);
        state.analyzer.check_fields(graph, &mut state.candidates);
        state.checked = true;
        state.timer.end_check();
    }

    /// Returns `true` if the class was registered, checked and found
    /// preservable.
    #[must_use]
    pub fn is_preservable_class(&self, class: ClassId) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.analyzer.is_preservable_class(class))
    }

    /// Returns `true` if the named candidate survived the eligibility analysis.
    #[must_use]
    pub fn is_preservable_field(&self, class_name: &str, field_name: &str) -> bool {
        self.state.as_ref().is_some_and(|s| {
            s.candidates
                .iter()
                .find(|c| c.class_name() == class_name && c.field_name() == field_name)
                .is_some_and(|c| s.analyzer.is_preservable_field(c))
        })
    }

    /// Begins a recording for `class`. See [`SubgraphRecorder::start_recording`].
    pub fn start_recording(&mut self, class: ClassId, is_partial_pre_init: bool) {
        let graph = self.graph;
        if let Some(state) = self.state.as_mut() {
            state.recorder.start_recording(graph, class, is_partial_pre_init);
        }
    }

    /// Archives one checked candidate into the current recording. Fields
    /// that did not survive the analysis are skipped and return `None`, as
    /// do fields whose walk fails.
    pub fn archive_reachable_objects_from(&mut self, field_index: usize) -> Option<EntryField> {
        let graph = self.graph;
        let state = self.state.as_mut()?;
        let field = state.candidates.get(field_index)?;
        if !state.analyzer.is_preservable_field(field) {
            state.recorder.metrics_mut().skipped_fields += 1;
            return None;
        }
        match state.recorder.archive_reachable_objects_from(graph, &state.analyzer, field) {
            Ok(entry) => {
                state.recorder.metrics_mut().archived_fields += 1;
                Some(entry)
            }
            Err(err) => {
                log_field_rejected(field.class_name(), field.field_name(), &err.to_string());
                state.recorder.metrics_mut().skipped_fields += 1;
                None
            }
        }
    }

    /// Ends the current recording.
    pub fn done_recording(&mut self) -> RecordingStats {
        self.state
            .as_mut()
            .map(|s| s.recorder.done_recording())
            .unwrap_or_default()
    }

    /// Archives everything registered: closed-region candidates, then
    /// open-region candidates, then whole classes. Runs the eligibility
    /// analysis first if it has not run yet.
    ///
    /// Candidates declared on a class that is also registered as a whole
    /// class are archived with that class. A whole class whose static fails
    /// to archive is recorded as partially pre-initialized with the statics
    /// that did succeed.
    pub fn archive_all(&mut self) {
        self.check_preservable_classes_and_fields();
        let graph = self.graph;
        let _session = trace_dump_session(self.id);
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let _span = trace_phase(ArchivePhase::Record);
        state.timer.start();

        let whole = state.classes.clone();
        let mut groups: Vec<(RegionKind, ClassId, Vec<usize>)> = Vec::new();
        for kind in RegionKind::ALL {
            for (i, field) in state.candidates.iter().enumerate() {
                let Some(class) = field.class() else { continue };
                if field.kind() != kind || whole.contains(&class) {
                    continue;
                }
                match groups.iter_mut().find(|(k, c, _)| *k == kind && *c == class) {
                    Some((_, _, fields)) => fields.push(i),
                    None => groups.push((kind, class, vec![i])),
                }
            }
        }

        for (_, class, fields) in groups {
            self.start_recording(class, true);
            for i in fields {
                self.archive_reachable_objects_from(i);
            }
            self.done_recording();
        }
        for class in whole {
            self.archive_class(graph, class);
        }

        if let Some(state) = self.state.as_mut() {
            state.timer.end_record();
        }
    }

    fn archive_class(&mut self, graph: &dyn ObjectGraph, class: ClassId) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let desc = graph.class_desc(class);
        if !state.analyzer.is_preservable_class(class) {
            state.recorder.metrics_mut().skipped_fields += desc.static_fields().len();
            return;
        }
        state.recorder.start_recording(graph, class, false);
        for field in desc.static_fields() {
            let result =
                state
                    .recorder
                    .archive_static_field(graph, &state.analyzer, class, field.offset, RegionKind::Open);
            match result {
                Ok(_) => state.recorder.metrics_mut().archived_fields += 1,
                Err(err) => {
                    log_field_rejected(desc.name(), &field.name, &err.to_string());
                    state.recorder.mark_partial();
                    state.recorder.metrics_mut().skipped_fields += 1;
                }
            }
        }
        state.recorder.done_recording();
    }

    /// Statistics so far.
    #[must_use]
    pub fn metrics(&self) -> ArchiveMetrics {
        self.state
            .as_ref()
            .map(|s| *s.recorder.metrics())
            .unwrap_or_default()
    }

    /// Time spent per phase so far.
    #[must_use]
    pub fn phase_times(&self) -> PhaseTimer {
        self.state.as_ref().map(|s| s.timer).unwrap_or_default()
    }

    /// Compacts every subgraph info into the lookup table and hands over
    /// the finished archive. `Ok(None)` if archiving is disabled.
    ///
    /// # Errors
    ///
    /// Fails if the lookup table outgrows its 32-bit offsets.
    pub fn finish(self) -> Result<Option<HeapArchive>> {
        Ok(self.finish_with_report()?.map(|(archive, _)| archive))
    }

    /// Like [`ArchiveSession::finish`], also returning the final statistics
    /// and phase times.
    ///
    /// # Errors
    ///
    /// See [`ArchiveSession::finish`].
    pub fn finish_with_report(self) -> Result<Option<(HeapArchive, DumpReport)>> {
        let _session = trace_dump_session(self.id);
        let Some(mut state) = self.state else {
            return Ok(None);
        };
        let _span = trace_phase(ArchivePhase::Write);
        state.timer.start();
        let (writer, infos, metrics) = state.recorder.into_parts();

        let mut table = CompactTableWriter::new(self.config.bucket_size);
        for info in infos
            .iter()
            .filter(|i| !i.entry_fields().is_empty() || i.num_object_classes() > 0)
        {
            table.insert(info.class_name(), &ArchivedRecord::compact(info));
        }
        let table = table.finalize()?;
        let codec = writer.codec();
        let (class_names, regions) = writer.finish();
        state.timer.end_write();

        let report = DumpReport {
            metrics,
            phase_times: state.timer,
        };
        log_dump_finished(&report);
        let archive = HeapArchive {
            codec,
            class_names,
            table,
            regions,
        };
        Ok(Some((archive, report)))
    }
}
