//! Subgraph recording.
//!
//! A recording collects the entry fields of one root class. Each entry
//! field's value graph is walked depth-first with an explicit stack. The
//! first time an object is reached in a session its copy is allocated and
//! entered into the [`ObjectCache`] before any of its children are visited,
//! so a later edge back to it (a cycle, or sharing between fields) resolves
//! to that copy. Objects archived by an earlier recording are still walked
//! to record their classes, but never copied again.
//!
//! A failed walk rolls back every copy it made, so the regions only ever
//! contain complete subgraphs.

use std::collections::HashSet;

use crate::cache::{ArchivedAddr, ObjectCache};
use crate::candidate::CandidateField;
use crate::codec::NarrowRef;
use crate::eligibility::EligibilityAnalyzer;
use crate::error::{ArchiveError, Result};
use crate::metrics::{ArchiveMetrics, RecordingStats};
use crate::model::{ClassId, ObjectGraph, ObjectId, Slot};
use crate::region::RegionKind;
use crate::subgraph::{EntryField, SubgraphInfo, SubgraphInfoTable};
use crate::tracing::internal::log_recording_done;
use crate::writer::HeapWriter;

#[derive(Debug)]
struct Recording {
    class: ClassId,
    seen: HashSet<ObjectId>,
    stats: RecordingStats,
}

/// A reference slot of a fresh copy waiting for its child's copy.
struct PendingRef {
    holder: ArchivedAddr,
    slot: usize,
    child: ObjectId,
}

/// Everything one graph walk touched, kept so a failed walk can be undone.
struct Walk<'a> {
    graph: &'a dyn ObjectGraph,
    analyzer: &'a EligibilityAnalyzer,
    kind: RegionKind,
    copied: Vec<ObjectId>,
    newly_seen: Vec<ObjectId>,
    classes: Vec<ClassId>,
    pending: Vec<PendingRef>,
}

impl<'a> Walk<'a> {
    fn new(graph: &'a dyn ObjectGraph, analyzer: &'a EligibilityAnalyzer, kind: RegionKind) -> Self {
        Self {
            graph,
            analyzer,
            kind,
            copied: Vec::new(),
            newly_seen: Vec::new(),
            classes: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn run(
        &mut self,
        cache: &mut ObjectCache,
        writer: &mut HeapWriter,
        recording: &mut Recording,
        root: ObjectId,
    ) -> Result<()> {
        let graph = self.graph;
        let mut stack = vec![root];
        while let Some(obj) = stack.pop() {
            let cached = cache.lookup(obj);
            let class = graph.class_of(obj);
            let class_name = graph.class_desc(class).name();
            if self.kind == RegionKind::Closed && cached.is_some_and(|c| c.kind == RegionKind::Open) {
                return Err(ArchiveError::ClosedReferencesOpen {
                    class: class_name.to_owned(),
                });
            }
            if !recording.seen.insert(obj) {
                continue;
            }
            self.newly_seen.push(obj);
            recording.stats.walked += 1;
            if !self.analyzer.is_archivable_class(graph, class) {
                return Err(ArchiveError::Unarchivable {
                    class: class_name.to_owned(),
                });
            }
            self.classes.push(class);

            let slots = graph.slots(obj);
            let fresh = match cached {
                Some(_) => None,
                None => {
                    let copy = writer.allocate(self.kind, class_name, slots)?;
                    cache.insert(obj, copy);
                    self.copied.push(obj);
                    Some(copy)
                }
            };
            for (i, slot) in slots.iter().enumerate().rev() {
                if let Slot::Ref(Some(child)) = *slot {
                    if let Some(holder) = fresh {
                        self.pending.push(PendingRef { holder, slot: i, child });
                    }
                    stack.push(child);
                }
            }
        }
        Ok(())
    }
}

/// Owns the object cache, the region images and the subgraph infos of a
/// dump session.
#[derive(Debug)]
pub struct SubgraphRecorder {
    cache: ObjectCache,
    writer: HeapWriter,
    infos: SubgraphInfoTable,
    current: Option<Recording>,
    metrics: ArchiveMetrics,
    verify: bool,
}

impl SubgraphRecorder {
    /// Creates a recorder writing into `writer`. With `verify` set, every
    /// archived subgraph is compared with the live graph after it is written.
    #[must_use]
    pub fn new(writer: HeapWriter, verify: bool) -> Self {
        Self {
            cache: ObjectCache::new(),
            writer,
            infos: SubgraphInfoTable::new(),
            current: None,
            metrics: ArchiveMetrics::new(),
            verify,
        }
    }

    /// The object cache.
    #[must_use]
    pub const fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// The region images built so far.
    #[must_use]
    pub const fn writer(&self) -> &HeapWriter {
        &self.writer
    }

    /// All subgraph infos.
    #[must_use]
    pub const fn infos(&self) -> &SubgraphInfoTable {
        &self.infos
    }

    /// Cumulative statistics.
    #[must_use]
    pub const fn metrics(&self) -> &ArchiveMetrics {
        &self.metrics
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut ArchiveMetrics {
        &mut self.metrics
    }

    /// Begins recording for `class`, creating its info on first use.
    ///
    /// A class recorded once as partially pre-initialized stays partial.
    pub fn start_recording(&mut self, graph: &dyn ObjectGraph, class: ClassId, is_partial_pre_init: bool) {
        debug_assert!(self.current.is_none(), "recording already in progress");
        let info = self
            .infos
            .get_or_create(class, graph.class_desc(class).name(), is_partial_pre_init);
        if is_partial_pre_init {
            info.set_partial_pre_init();
        }
        self.current = Some(Recording {
            class,
            seen: HashSet::new(),
            stats: RecordingStats::default(),
        });
    }

    /// Ends the current recording and folds its counters into the totals.
    pub fn done_recording(&mut self) -> RecordingStats {
        let Some(recording) = self.current.take() else {
            debug_assert!(false, "done_recording without start_recording");
            return RecordingStats::default();
        };
        let name = self.infos.find(recording.class).map_or("", SubgraphInfo::class_name);
        log_recording_done(
            name,
            recording.stats.walked,
            recording.stats.archived,
            recording.stats.recorded_classes,
        );
        self.metrics.add_recording(&recording.stats);
        recording.stats
    }

    /// Marks the class being recorded as only partially pre-initialized.
    pub(crate) fn mark_partial(&mut self) {
        if let Some(class) = self.current.as_ref().map(|r| r.class) {
            if let Some(info) = self.infos.find_mut(class) {
                info.set_partial_pre_init();
            }
        }
    }

    /// Archives the value of a registered candidate field and appends it to
    /// the current recording's entry fields.
    ///
    /// # Errors
    ///
    /// Fails if the field is unresolved or its graph cannot be archived. On
    /// error nothing is recorded and no copy survives.
    pub fn archive_reachable_objects_from(
        &mut self,
        graph: &dyn ObjectGraph,
        analyzer: &EligibilityAnalyzer,
        field: &CandidateField,
    ) -> Result<EntryField> {
        let (Some(class), Some(offset)) = (field.class(), field.offset()) else {
            return Err(ArchiveError::UnresolvedClass(field.class_name().to_owned()));
        };
        self.archive_static_field(graph, analyzer, class, offset, field.kind())
    }

    /// Archives the static at `offset` of `class` into region `kind`.
    ///
    /// Primitive statics are recorded by value.
    ///
    /// # Errors
    ///
    /// See [`SubgraphRecorder::archive_reachable_objects_from`].
    pub fn archive_static_field(
        &mut self,
        graph: &dyn ObjectGraph,
        analyzer: &EligibilityAnalyzer,
        class: ClassId,
        offset: u32,
        kind: RegionKind,
    ) -> Result<EntryField> {
        debug_assert!(self.current.is_some(), "archiving outside a recording");
        let class_name = graph.class_desc(class).name();
        let entry = match graph.static_value(class, offset) {
            None => return Err(ArchiveError::UnresolvedClass(class_name.to_owned())),
            Some(Slot::Prim(bits)) => EntryField::primitive(offset, bits),
            Some(Slot::Ref(None)) => EntryField::reference(offset, kind, NarrowRef::NULL),
            Some(Slot::Ref(Some(root))) => {
                let copy = self.archive_object_graph(graph, analyzer, root, kind)?;
                if self.verify {
                    self.verify_subgraph(graph, root, copy)?;
                    self.metrics.verifications += 1;
                }
                EntryField::reference(offset, copy.kind, self.writer.codec().encode(copy.addr))
            }
        };
        if let Some(info) = self.current.as_ref().and_then(|r| self.infos.find_mut(r.class)) {
            info.add_entry_field(entry);
        }
        Ok(entry)
    }

    fn archive_object_graph(
        &mut self,
        graph: &dyn ObjectGraph,
        analyzer: &EligibilityAnalyzer,
        root: ObjectId,
        kind: RegionKind,
    ) -> Result<ArchivedAddr> {
        let Some(recording) = self.current.as_mut() else {
            return Err(ArchiveError::format("no recording in progress"));
        };
        let mark = self.writer.mark();
        let mut walk = Walk::new(graph, analyzer, kind);

        if let Err(err) = walk.run(&mut self.cache, &mut self.writer, recording, root) {
            for obj in walk.copied {
                self.cache.remove(obj);
            }
            for obj in walk.newly_seen {
                recording.seen.remove(&obj);
            }
            self.writer.rollback(mark);
            return Err(err);
        }

        recording.stats.archived += walk.copied.len();
        for p in walk.pending {
            let target = self.cache.lookup(p.child);
            debug_assert!(target.is_some(), "child {:?} walked but not archived", p.child);
            self.writer.patch_reference(p.holder, p.slot, target);
        }
        if let Some(info) = self.infos.find_mut(recording.class) {
            for class in walk.classes {
                if info.add_object_class(class, graph.class_desc(class).name()) {
                    recording.stats.recorded_classes += 1;
                }
            }
        }
        self.cache
            .lookup(root)
            .ok_or_else(|| ArchiveError::format("root missing from object cache"))
    }

    /// Walks the live graph and its archived copy in lockstep and checks
    /// that classes, slot counts, primitive values and the shape of every
    /// reference agree.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::VerificationFailed`] at the first divergence.
    pub fn verify_subgraph(&self, graph: &dyn ObjectGraph, root: ObjectId, copy: ArchivedAddr) -> Result<()> {
        let fail = |obj: ObjectId, what: &str| {
            Err(ArchiveError::VerificationFailed(format!(
                "{obj:?} ({}): {what}",
                graph.class_desc(graph.class_of(obj)).name()
            )))
        };
        let mut visited = std::collections::HashMap::new();
        let mut stack = vec![(root, copy)];
        while let Some((obj, copy)) = stack.pop() {
            if let Some(&prev) = visited.get(&obj) {
                if prev != copy {
                    return fail(obj, "shared object archived twice");
                }
                continue;
            }
            visited.insert(obj, copy);

            let Some(archived) = self.writer.object(copy) else {
                return fail(obj, "copy is not a valid archived object");
            };
            if archived.class_name != graph.class_desc(graph.class_of(obj)).name() {
                return fail(obj, "class differs");
            }
            let slots = graph.slots(obj);
            if archived.words.len() != slots.len() {
                return fail(obj, "slot count differs");
            }
            for (i, (slot, &word)) in slots.iter().zip(archived.words).enumerate() {
                match *slot {
                    Slot::Prim(bits) if bits == word && !archived.is_reference(i) => {}
                    Slot::Ref(None) if word == 0 && archived.is_reference(i) => {}
                    Slot::Ref(Some(child)) if archived.is_reference(i) => {
                        let child_copy = u32::try_from(word).ok().and_then(|n| self.writer.resolve(NarrowRef(n)));
                        match child_copy {
                            Some(c) => stack.push((child, c)),
                            None => return fail(obj, "reference does not resolve"),
                        }
                    }
                    _ => return fail(obj, "slot differs"),
                }
            }
        }
        Ok(())
    }

    /// Hands over the writer and the infos once recording is over.
    #[must_use]
    pub fn into_parts(self) -> (HeapWriter, SubgraphInfoTable, ArchiveMetrics) {
        debug_assert!(self.current.is_none(), "recording still in progress");
        (self.writer, self.infos, self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveConfig;
    use crate::heap::LiveHeap;
    use crate::model::{ClassDesc, ClassFlags};

    fn recorder(capacity: usize) -> SubgraphRecorder {
        let config = ArchiveConfig::new().region_capacity(capacity);
        SubgraphRecorder::new(HeapWriter::new(&config).unwrap(), true)
    }

    #[test]
    fn test_cycle_archived_once() {
        let mut heap = LiveHeap::new();
        let holder = heap.define_class(ClassDesc::new("Holder").static_ref("RING"));
        let node = heap.define_class(ClassDesc::new("Node"));
        let a = heap.alloc(node, vec![Slot::Prim(1), Slot::NULL]);
        let b = heap.alloc(node, vec![Slot::Prim(2), Slot::Ref(Some(a))]);
        heap.set_slot(a, 1, Slot::Ref(Some(b)));
        heap.set_static(holder, "RING", Slot::Ref(Some(a)));

        let analyzer = EligibilityAnalyzer::default();
        let mut rec = recorder(4096);
        rec.start_recording(&heap, holder, false);
        let offset = heap.class_desc(holder).static_field("RING").unwrap().offset;
        let entry = rec
            .archive_static_field(&heap, &analyzer, holder, offset, RegionKind::Open)
            .unwrap();
        let stats = rec.done_recording();

        assert_eq!(stats.walked, 2);
        assert_eq!(stats.archived, 2);
        assert_eq!(stats.recorded_classes, 1);
        assert_eq!(rec.cache().len(), 2);
        assert_eq!(entry.kind, crate::subgraph::EntryKind::Open);

        let copy_a = rec.cache().lookup(a).unwrap();
        let copy_b = rec.cache().lookup(b).unwrap();
        let obj_b = rec.writer().object(copy_b).unwrap();
        let back = rec.writer().resolve(NarrowRef(u32::try_from(obj_b.words[1]).unwrap()));
        assert_eq!(back, Some(copy_a));
        assert_eq!(rec.metrics().verifications, 1);
    }

    #[test]
    fn test_shared_object_across_recordings() {
        let mut heap = LiveHeap::new();
        let first = heap.define_class(ClassDesc::new("First").static_ref("X"));
        let second = heap.define_class(ClassDesc::new("Second").static_ref("Y"));
        let box_class = heap.define_class(ClassDesc::new("Box"));
        let leaf_class = heap.define_class(ClassDesc::new("Leaf"));
        let leaf = heap.alloc(leaf_class, vec![Slot::Prim(5)]);
        let shared = heap.alloc(box_class, vec![Slot::Ref(Some(leaf))]);
        heap.set_static(first, "X", Slot::Ref(Some(shared)));
        heap.set_static(second, "Y", Slot::Ref(Some(shared)));

        let analyzer = EligibilityAnalyzer::default();
        let mut rec = recorder(4096);
        let mut entries = Vec::new();
        for class in [first, second] {
            rec.start_recording(&heap, class, false);
            let offset = heap.class_desc(class).static_fields()[0].offset;
            entries.push(
                rec.archive_static_field(&heap, &analyzer, class, offset, RegionKind::Open)
                    .unwrap(),
            );
            rec.done_recording();
        }

        assert_eq!(entries[0].value, entries[1].value);
        assert_eq!(rec.metrics().archived, 2);
        assert_eq!(rec.metrics().walked, 4);
        let second_info = rec.infos().find(second).unwrap();
        assert_eq!(second_info.object_classes(), &["Box".to_owned(), "Leaf".to_owned()]);
    }

    #[test]
    fn test_failed_walk_rolls_back() {
        let mut heap = LiveHeap::new();
        let holder = heap.define_class(ClassDesc::new("Holder").static_ref("BAD"));
        let node = heap.define_class(ClassDesc::new("Node"));
        let thread = heap.define_class(ClassDesc::new("Thread").with_flags(ClassFlags::IDENTITY_SENSITIVE));
        let t = heap.alloc(thread, vec![]);
        let n = heap.alloc(node, vec![Slot::Ref(Some(t))]);
        heap.set_static(holder, "BAD", Slot::Ref(Some(n)));

        let analyzer = EligibilityAnalyzer::default();
        let mut rec = recorder(4096);
        let before = rec.writer().mark();
        rec.start_recording(&heap, holder, true);
        let offset = heap.class_desc(holder).static_fields()[0].offset;
        let err = rec
            .archive_static_field(&heap, &analyzer, holder, offset, RegionKind::Open)
            .unwrap_err();
        rec.done_recording();

        assert!(matches!(err, ArchiveError::Unarchivable { ref class } if class == "Thread"));
        assert!(rec.cache().is_empty());
        assert_eq!(rec.writer().mark(), before);
        let info = rec.infos().find(holder).unwrap();
        assert!(info.entry_fields().is_empty());
        assert!(info.object_classes().is_empty());
    }

    #[test]
    fn test_closed_may_not_reference_open() {
        let mut heap = LiveHeap::new();
        let holder = heap.define_class(ClassDesc::new("Holder").static_ref("OPEN").static_ref("CLOSED"));
        let node = heap.define_class(ClassDesc::new("Node"));
        let shared = heap.alloc(node, vec![]);
        let wrapper = heap.alloc(node, vec![Slot::Ref(Some(shared))]);
        heap.set_static(holder, "OPEN", Slot::Ref(Some(shared)));
        heap.set_static(holder, "CLOSED", Slot::Ref(Some(wrapper)));

        let analyzer = EligibilityAnalyzer::default();
        let mut rec = recorder(4096);
        let fields = heap.class_desc(holder).static_fields().to_vec();
        rec.start_recording(&heap, holder, false);
        rec.archive_static_field(&heap, &analyzer, holder, fields[0].offset, RegionKind::Open)
            .unwrap();
        rec.done_recording();
        rec.start_recording(&heap, holder, false);
        let err = rec
            .archive_static_field(&heap, &analyzer, holder, fields[1].offset, RegionKind::Closed)
            .unwrap_err();
        rec.done_recording();

        assert!(matches!(err, ArchiveError::ClosedReferencesOpen { .. }));
        assert!(rec.cache().lookup(wrapper).is_none());
    }

    #[test]
    fn test_null_and_primitive_entries() {
        let mut heap = LiveHeap::new();
        let holder = heap.define_class(ClassDesc::new("Holder").static_ref("NONE").static_prim("COUNT"));
        heap.set_static(holder, "COUNT", Slot::Prim(42));

        let analyzer = EligibilityAnalyzer::default();
        let mut rec = recorder(4096);
        let fields = heap.class_desc(holder).static_fields().to_vec();
        rec.start_recording(&heap, holder, false);
        let none = rec
            .archive_static_field(&heap, &analyzer, holder, fields[0].offset, RegionKind::Open)
            .unwrap();
        let count = rec
            .archive_static_field(&heap, &analyzer, holder, fields[1].offset, RegionKind::Open)
            .unwrap();
        let stats = rec.done_recording();

        assert_eq!(none.narrow(), Some(NarrowRef::NULL));
        assert_eq!(count, EntryField::primitive(fields[1].offset, 42));
        assert_eq!(stats, RecordingStats::default());
        assert_eq!(rec.infos().find(holder).unwrap().entry_fields().len(), 2);
    }

    #[test]
    fn test_overflow_fails_field() {
        let mut heap = LiveHeap::new();
        let holder = heap.define_class(ClassDesc::new("Holder").static_ref("BIG"));
        let arr = heap.define_class(ClassDesc::new("Array"));
        let big = heap.alloc(arr, vec![Slot::Prim(0); 64]);
        heap.set_static(holder, "BIG", Slot::Ref(Some(big)));

        let analyzer = EligibilityAnalyzer::default();
        let mut rec = recorder(128);
        rec.start_recording(&heap, holder, false);
        let offset = heap.class_desc(holder).static_fields()[0].offset;
        let err = rec
            .archive_static_field(&heap, &analyzer, holder, offset, RegionKind::Open)
            .unwrap_err();
        rec.done_recording();
        assert!(matches!(err, ArchiveError::RegionOverflow { .. }));
    }
}
