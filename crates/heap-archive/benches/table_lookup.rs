//! Dump and lookup benchmarks.
//!
//! Measures compact table lookups (hits and misses) at a few table sizes,
//! and a full dump of a linked structure.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use heap_archive::{
    ArchiveConfig, ArchiveSession, ArchivedRecord, ClassDesc, CompactTable, CompactTableWriter, EntryField, LiveHeap,
    RegionKind, Slot,
};
use std::hint::black_box;
use std::time::Duration;

fn table(n: usize) -> (CompactTable, Vec<String>) {
    let names: Vec<String> = (0..n).map(|i| format!("java/util/Class{i}")).collect();
    let mut writer = CompactTableWriter::new(4);
    for name in &names {
        let record = ArchivedRecord {
            class_name: name.clone(),
            entry_fields: vec![EntryField::primitive(112, 7)].into_boxed_slice(),
            object_classes: vec!["java/lang/String".to_owned()].into_boxed_slice(),
            is_partial_pre_init: false,
        };
        writer.insert(name, &record);
    }
    let table = CompactTable::load(writer.finalize().expect("offsets fit")).expect("table loads");
    (table, names)
}

fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");
    for n in [16, 256, 4096] {
        let (table, names) = table(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % names.len();
                black_box(table.lookup(black_box(&names[i])).map(|r| r.num_entry_fields()))
            });
        });
    }
    group.finish();
}

fn bench_lookup_miss(c: &mut Criterion) {
    let (table, _) = table(4096);
    c.bench_function("lookup_miss_4096", |b| {
        b.iter(|| black_box(table.lookup(black_box("java/util/NotArchived"))));
    });
}

fn bench_dump_linked_list(c: &mut Criterion) {
    let mut heap = LiveHeap::new();
    let holder = heap.define_class(ClassDesc::new("Holder").static_ref("HEAD"));
    let node = heap.define_class(ClassDesc::new("Node"));
    let mut next = None;
    for i in 0..10_000 {
        next = Some(heap.alloc(node, vec![Slot::Prim(i), Slot::Ref(next)]));
    }
    heap.set_static(holder, "HEAD", Slot::Ref(next));

    c.bench_function("dump_linked_list_10000", |b| {
        b.iter(|| {
            let mut session = ArchiveSession::new(ArchiveConfig::new(), &heap).expect("valid config");
            session.add_preservable_static_field("Holder", "HEAD", RegionKind::Open);
            session.archive_all();
            black_box(session.finish())
        });
    });
}

criterion_group!(
    name = archive_benches;
    config = Criterion::default()
        .sample_size(30)
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(2));
    targets =
        bench_lookup_hit,
        bench_lookup_miss,
        bench_dump_linked_list,
);

criterion_main!(archive_benches);
