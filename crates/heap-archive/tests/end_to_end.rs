//! End-to-end archiving: dump, persist, map, fix up and populate statics.

use heap_archive::{
    ArchiveConfig, ArchiveSession, ArchivedValue, ClassDesc, ClassId, ClassLoaderHooks, EntryKind, HeapArchive,
    HeapStatics, InitOutcome, LiveHeap, MmapRegionMapper, ObjectGraph, RegionKind, RegionState, RuntimeArchive, Slot,
};

fn config_classes(heap: &mut LiveHeap) -> (ClassId, ClassId, ClassId) {
    let config = heap.define_class(ClassDesc::new("Config").static_ref("INSTANCE").static_prim("PORT"));
    let string = heap.define_class(ClassDesc::new("String"));
    let array = heap.define_class(ClassDesc::new("Object[]"));
    (config, string, array)
}

/// `Config.INSTANCE -> Config { port, name: String, tags: [String, String] }`.
fn populated_heap() -> LiveHeap {
    let mut heap = LiveHeap::new();
    let (config, string, array) = config_classes(&mut heap);
    let name = heap.alloc(string, vec![Slot::Prim(0x6e61_6d65)]);
    let tag = heap.alloc(string, vec![Slot::Prim(0x7461_67)]);
    let tags = heap.alloc(array, vec![Slot::Ref(Some(tag)), Slot::Ref(Some(tag))]);
    let instance = heap.alloc(config, vec![Slot::Prim(8080), Slot::Ref(Some(name)), Slot::Ref(Some(tags))]);
    heap.set_static(config, "INSTANCE", Slot::Ref(Some(instance)));
    heap.set_static(config, "PORT", Slot::Prim(8080));
    heap
}

fn dump(heap: &LiveHeap, kind: RegionKind) -> HeapArchive {
    let mut session = ArchiveSession::new(ArchiveConfig::new(), heap).unwrap();
    assert!(session.add_preservable_static_field("Config", "INSTANCE", kind));
    session.archive_all();
    session.finish().unwrap().unwrap()
}

/// Keeps every value handed to the class system.
#[derive(Default)]
struct Stores(Vec<(String, u32, ArchivedValue)>);

impl ClassLoaderHooks for Stores {
    fn resolve_class(&mut self, _: &str) -> bool {
        true
    }

    fn set_static_field(&mut self, _: &RuntimeArchive, class_name: &str, offset: u32, value: ArchivedValue) {
        self.0.push((class_name.to_owned(), offset, value));
    }
}

#[test]
fn test_config_with_two_primitives_and_a_null() {
    let mut heap = LiveHeap::new();
    let config = heap.define_class(ClassDesc::new("Config").static_ref("INSTANCE"));
    let instance = heap.alloc(config, vec![Slot::Prim(80), Slot::Prim(443), Slot::NULL]);
    heap.set_static(config, "INSTANCE", Slot::Ref(Some(instance)));

    let mut session = ArchiveSession::new(ArchiveConfig::new(), &heap).unwrap();
    assert!(session.add_preservable_static_field("Config", "INSTANCE", RegionKind::Open));
    session.archive_all();
    let archive = session.finish().unwrap().unwrap();

    let table = archive.table().unwrap();
    let record = table.lookup("Config").unwrap();
    assert_eq!(record.object_classes().collect::<Vec<_>>(), vec!["Config"]);
    let fields: Vec<_> = record.entry_fields().collect();
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].kind, EntryKind::Open);
    assert_ne!(fields[0].value, 0);

    let mut runtime = RuntimeArchive::map(archive, &ArchiveConfig::new(), &MmapRegionMapper::relocating()).unwrap();
    let stats = runtime.fixup_mapped_regions().unwrap();
    assert_eq!(stats.patched, 0);
    assert_eq!(stats.nulls, 1);

    let mut stores = Stores::default();
    let outcome = runtime.initialize_from_archive("Config", &mut stores);
    assert_eq!(outcome, InitOutcome::Initialized { partial: true });
    assert_eq!(stores.0.len(), 1);
    let ArchivedValue::Object(addr) = stores.0[0].2 else {
        panic!("INSTANCE should decode to an object");
    };
    let obj = runtime.object_at(addr).unwrap();
    assert_eq!(obj.class_name(), "Config");
    assert_eq!(
        obj.slots().collect::<Vec<_>>(),
        vec![ArchivedValue::Primitive(80), ArchivedValue::Primitive(443), ArchivedValue::Null]
    );
    // Header word, then the slots; the null slot holds a literal zero.
    let region = runtime.region(RegionKind::Open).unwrap();
    assert_eq!(region.word_at(addr + 3 * 8), Some(0));

    let mut fresh = LiveHeap::new();
    let config = fresh.define_class(ClassDesc::new("Config").static_ref("INSTANCE"));
    let mut statics = HeapStatics::new(&mut fresh);
    assert_eq!(
        runtime.initialize_from_archive("Config", &mut statics),
        InitOutcome::Initialized { partial: true }
    );
    assert_eq!(statics.materialized(), 1);
    let Some(Slot::Ref(Some(copy))) = fresh.static_by_name(config, "INSTANCE") else {
        panic!("INSTANCE was not populated");
    };
    assert_eq!(fresh.slots(copy), &[Slot::Prim(80), Slot::Prim(443), Slot::NULL]);
}

#[test]
fn test_config_instance_round_trip_through_file() {
    let heap = populated_heap();
    let archive = dump(&heap, RegionKind::Open);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.hsar");
    archive.save(&path).unwrap();
    let loaded = HeapArchive::open(&path).unwrap();
    assert_eq!(loaded, archive);

    let mut runtime = RuntimeArchive::map(loaded, &ArchiveConfig::new(), &MmapRegionMapper::relocating()).unwrap();
    assert_eq!(runtime.region_state(RegionKind::Open), RegionState::Mapped);
    assert_eq!(runtime.region_state(RegionKind::Closed), RegionState::Unmapped);
    let stats = runtime.fixup_mapped_regions().unwrap();
    assert_eq!(stats.patched, 4);
    assert_eq!(runtime.region_state(RegionKind::Open), RegionState::FixedUp);

    let mut fresh = LiveHeap::new();
    let (config, _, _) = config_classes(&mut fresh);
    let mut statics = HeapStatics::new(&mut fresh);
    let outcome = runtime.initialize_from_archive("Config", &mut statics);
    assert_eq!(outcome, InitOutcome::Initialized { partial: true });
    assert_eq!(statics.failed(), 0);
    assert_eq!(statics.materialized(), 4);

    let Some(Slot::Ref(Some(instance))) = fresh.static_by_name(config, "INSTANCE") else {
        panic!("INSTANCE was not populated");
    };
    let slots = fresh.slots(instance).to_vec();
    assert_eq!(slots[0], Slot::Prim(8080));
    let (Slot::Ref(Some(name)), Slot::Ref(Some(tags))) = (slots[1], slots[2]) else {
        panic!("INSTANCE lost its references");
    };
    assert_eq!(fresh.class_desc(fresh.class_of(name)).name(), "String");
    assert_eq!(fresh.slots(name), &[Slot::Prim(0x6e61_6d65)]);
    let tag_slots = fresh.slots(tags);
    assert_eq!(tag_slots.len(), 2);
    assert_eq!(tag_slots[0], tag_slots[1], "shared element must stay shared");

    // Only the candidate field is restored; PORT keeps its default.
    assert_eq!(fresh.static_by_name(config, "PORT"), Some(Slot::Prim(0)));
}

#[test]
fn test_record_lists_object_classes() {
    let archive = dump(&populated_heap(), RegionKind::Closed);
    let table = archive.table().unwrap();
    let record = table.lookup("Config").unwrap();

    let mut classes: Vec<_> = record.object_classes().collect();
    classes.sort_unstable();
    assert_eq!(classes, vec!["Config", "Object[]", "String"]);
    let fields: Vec<_> = record.entry_fields().collect();
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].kind, EntryKind::Closed);
    assert_ne!(fields[0].value, 0);
}

#[test]
fn test_closed_region_is_usable_after_fixup() {
    let archive = dump(&populated_heap(), RegionKind::Closed);
    assert!(archive.region(RegionKind::Open).is_none_or(|r| r.words.is_empty()));

    let mut runtime = RuntimeArchive::map(archive, &ArchiveConfig::new(), &MmapRegionMapper::new()).unwrap();
    runtime.fixup_mapped_regions().unwrap();
    assert!(runtime.is_usable());

    let mut fresh = LiveHeap::new();
    let (config, _, _) = config_classes(&mut fresh);
    let outcome = runtime.initialize_from_archive("Config", &mut HeapStatics::new(&mut fresh));
    assert_eq!(outcome, InitOutcome::Initialized { partial: true });
    assert!(matches!(fresh.static_by_name(config, "INSTANCE"), Some(Slot::Ref(Some(_)))));
}

#[test]
fn test_whole_class_restores_every_static() {
    let heap = populated_heap();
    let mut session = ArchiveSession::new(ArchiveConfig::new(), &heap).unwrap();
    assert!(session.add_preservable_class("Config"));
    session.archive_all();
    let archive = session.finish().unwrap().unwrap();

    let mut runtime = RuntimeArchive::map(archive, &ArchiveConfig::new(), &MmapRegionMapper::relocating()).unwrap();
    runtime.fixup_mapped_regions().unwrap();

    let mut fresh = LiveHeap::new();
    let (config, _, _) = config_classes(&mut fresh);
    let outcome = runtime.initialize_from_archive("Config", &mut HeapStatics::new(&mut fresh));
    assert_eq!(outcome, InitOutcome::Initialized { partial: false });
    assert_eq!(fresh.static_by_name(config, "PORT"), Some(Slot::Prim(8080)));
    assert!(matches!(fresh.static_by_name(config, "INSTANCE"), Some(Slot::Ref(Some(_)))));
}

#[test]
fn test_unknown_class_is_not_found() {
    let archive = dump(&populated_heap(), RegionKind::Open);
    let mut runtime = RuntimeArchive::map(archive, &ArchiveConfig::new(), &MmapRegionMapper::new()).unwrap();
    runtime.fixup_mapped_regions().unwrap();

    let mut fresh = LiveHeap::new();
    config_classes(&mut fresh);
    let outcome = runtime.initialize_from_archive("NotArchived", &mut HeapStatics::new(&mut fresh));
    assert_eq!(outcome, InitOutcome::NotFound);
}

#[test]
fn test_missing_object_class_blocks_initialization() {
    let archive = dump(&populated_heap(), RegionKind::Open);
    let mut runtime = RuntimeArchive::map(archive, &ArchiveConfig::new(), &MmapRegionMapper::new()).unwrap();
    runtime.fixup_mapped_regions().unwrap();

    // The loading process never defines `Object[]`.
    let mut fresh = LiveHeap::new();
    let config = fresh.define_class(ClassDesc::new("Config").static_ref("INSTANCE").static_prim("PORT"));
    fresh.define_class(ClassDesc::new("String"));
    let outcome = runtime.initialize_from_archive("Config", &mut HeapStatics::new(&mut fresh));
    assert_eq!(outcome, InitOutcome::NotFound);
    assert_eq!(fresh.static_by_name(config, "INSTANCE"), Some(Slot::NULL));
    assert_eq!(fresh.object_count(), 0);
}
