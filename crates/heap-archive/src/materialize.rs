//! Rebuilding archived objects into a [`LiveHeap`].
//!
//! A real runtime uses archived objects in place. The arena heap cannot, so
//! objects are copied out, two-phase: every reachable object is allocated
//! first with its references left null, then the references are patched.
//! Sharing and cycles survive because each archived address maps to exactly
//! one heap object.

use std::collections::HashMap;

use crate::heap::LiveHeap;
use crate::model::{ObjectGraph, ObjectId, Slot};
use crate::runtime::{ArchivedValue, ClassLoaderHooks, RuntimeArchive};

/// Copies archived objects into a heap, remembering what it already copied.
#[derive(Debug, Default)]
pub struct Materializer {
    copies: HashMap<u64, ObjectId>,
}

impl Materializer {
    /// Creates a materializer with no copies yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects copied so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.copies.len()
    }

    /// Returns `true` if nothing was copied yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    /// Copies the object at `addr` and everything it reaches into `heap`.
    ///
    /// Returns `None` if some reached object is unreadable or its class is
    /// not defined in `heap`. A failed call forgets every copy it made, so a
    /// later call reaching the same objects copies them afresh; the
    /// abandoned heap objects are left unreferenced.
    pub fn materialize(&mut self, archive: &RuntimeArchive, heap: &mut LiveHeap, addr: u64) -> Option<ObjectId> {
        let mut fresh = Vec::new();
        if self.copy_reachable(archive, heap, addr, &mut fresh).is_none() {
            for (addr, _) in fresh {
                self.copies.remove(&addr);
            }
            return None;
        }
        self.copies.get(&addr).copied()
    }

    fn copy_reachable(
        &mut self,
        archive: &RuntimeArchive,
        heap: &mut LiveHeap,
        addr: u64,
        fresh: &mut Vec<(u64, ObjectId)>,
    ) -> Option<()> {
        let mut stack = vec![addr];
        while let Some(addr) = stack.pop() {
            if self.copies.contains_key(&addr) {
                continue;
            }
            let obj = archive.object_at(addr)?;
            let class = heap.find_class(obj.class_name())?;
            let slots: Vec<Slot> = obj
                .slots()
                .map(|value| match value {
                    ArchivedValue::Primitive(bits) => Slot::Prim(bits),
                    ArchivedValue::Null | ArchivedValue::Object(_) => Slot::NULL,
                })
                .collect();
            let id = heap.alloc(class, slots);
            self.copies.insert(addr, id);
            fresh.push((addr, id));
            stack.extend(obj.slots().filter_map(|value| match value {
                ArchivedValue::Object(child) => Some(child),
                _ => None,
            }));
        }

        for &(addr, id) in fresh.iter() {
            let obj = archive.object_at(addr)?;
            for (i, value) in obj.slots().enumerate() {
                if let ArchivedValue::Object(child) = value {
                    heap.set_slot(id, i, Slot::Ref(self.copies.get(&child).copied()));
                }
            }
        }
        Some(())
    }
}

/// [`ClassLoaderHooks`] that populate the statics of a [`LiveHeap`].
///
/// One materializer is shared by every class initialized through the same
/// hooks, so objects reachable from several classes stay shared.
#[derive(Debug)]
pub struct HeapStatics<'h> {
    heap: &'h mut LiveHeap,
    materializer: Materializer,
    failed: usize,
}

impl<'h> HeapStatics<'h> {
    /// Hooks writing into `heap`. Classes must already be defined there.
    pub fn new(heap: &'h mut LiveHeap) -> Self {
        Self {
            heap,
            materializer: Materializer::new(),
            failed: 0,
        }
    }

    /// Number of statics left untouched because their objects could not be
    /// copied.
    #[must_use]
    pub const fn failed(&self) -> usize {
        self.failed
    }

    /// The materializer's copy count.
    #[must_use]
    pub fn materialized(&self) -> usize {
        self.materializer.len()
    }
}

impl ClassLoaderHooks for HeapStatics<'_> {
    fn resolve_class(&mut self, class_name: &str) -> bool {
        self.heap.find_class(class_name).is_some()
    }

    fn set_static_field(&mut self, archive: &RuntimeArchive, class_name: &str, offset: u32, value: ArchivedValue) {
        let Some(class) = self.heap.find_class(class_name) else {
            self.failed += 1;
            return;
        };
        let slot = match value {
            ArchivedValue::Null => Slot::NULL,
            ArchivedValue::Primitive(bits) => Slot::Prim(bits),
            ArchivedValue::Object(addr) => match self.materializer.materialize(archive, self.heap, addr) {
                Some(id) => Slot::Ref(Some(id)),
                None => {
                    self.failed += 1;
                    return;
                }
            },
        };
        if !self.heap.set_static_at(class, offset, slot) {
            self.failed += 1;
        }
    }
}
