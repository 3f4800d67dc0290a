//! An arena-backed object heap.
//!
//! `LiveHeap` is the reference implementation of [`ObjectGraph`]. Objects
//! live in a flat arena and are identified by their index, which gives the
//! dump-time walks a stable identity token without looking at addresses.
//! It is also the target the materializer rebuilds archived objects into.

use std::collections::HashMap;

use crate::model::{ClassDesc, ClassId, ObjectGraph, ObjectId, Slot};

#[derive(Debug, Clone)]
struct HeapObject {
    class: ClassId,
    slots: Vec<Slot>,
}

#[derive(Debug, Clone)]
struct ClassEntry {
    desc: ClassDesc,
    statics: Vec<Slot>,
}

/// A simple single-threaded heap of classes and objects.
#[derive(Debug, Default, Clone)]
pub struct LiveHeap {
    classes: Vec<ClassEntry>,
    by_name: HashMap<String, ClassId>,
    objects: Vec<HeapObject>,
}

impl LiveHeap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a class. Defining a name twice returns the existing class.
    ///
    /// Static fields start as zero or null.
    pub fn define_class(&mut self, desc: ClassDesc) -> ClassId {
        if let Some(&id) = self.by_name.get(desc.name()) {
            return id;
        }
        let id = ClassId(index_u32(self.classes.len()));
        let statics = desc
            .static_fields()
            .iter()
            .map(|f| if f.is_reference { Slot::NULL } else { Slot::Prim(0) })
            .collect();
        self.by_name.insert(desc.name().to_owned(), id);
        self.classes.push(ClassEntry { desc, statics });
        id
    }

    /// Allocates an object.
    pub fn alloc(&mut self, class: ClassId, slots: Vec<Slot>) -> ObjectId {
        debug_assert!((class.0 as usize) < self.classes.len(), "unknown class");
        let id = ObjectId(index_u32(self.objects.len()));
        self.objects.push(HeapObject { class, slots });
        id
    }

    /// Overwrites one slot of an object.
    ///
    /// # Panics
    ///
    /// Panics if `obj` or `index` is out of range.
    pub fn set_slot(&mut self, obj: ObjectId, index: usize, value: Slot) {
        self.objects[obj.0 as usize].slots[index] = value;
    }

    /// Sets a static field by name. Returns `false` if the field does not exist.
    pub fn set_static(&mut self, class: ClassId, field: &str, value: Slot) -> bool {
        let entry = &mut self.classes[class.0 as usize];
        let Some(offset) = entry.desc.static_field(field).map(|f| f.offset) else {
            return false;
        };
        match ClassDesc::static_index(offset) {
            Some(index) => {
                entry.statics[index] = value;
                true
            }
            None => false,
        }
    }

    /// Sets a static field by offset. Returns `false` if no field lives there.
    pub fn set_static_at(&mut self, class: ClassId, offset: u32, value: Slot) -> bool {
        let entry = &mut self.classes[class.0 as usize];
        match ClassDesc::static_index(offset) {
            Some(index) if index < entry.statics.len() => {
                entry.statics[index] = value;
                true
            }
            _ => false,
        }
    }

    /// Reads a static field by name.
    #[must_use]
    pub fn static_by_name(&self, class: ClassId, field: &str) -> Option<Slot> {
        let offset = self.class_desc(class).static_field(field)?.offset;
        self.static_value(class, offset)
    }

    /// Number of allocated objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

impl ObjectGraph for LiveHeap {
    fn find_class(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    fn class_desc(&self, class: ClassId) -> &ClassDesc {
        &self.classes[class.0 as usize].desc
    }

    fn class_of(&self, obj: ObjectId) -> ClassId {
        self.objects[obj.0 as usize].class
    }

    fn slots(&self, obj: ObjectId) -> &[Slot] {
        &self.objects[obj.0 as usize].slots
    }

    fn static_value(&self, class: ClassId, offset: u32) -> Option<Slot> {
        let entry = self.classes.get(class.0 as usize)?;
        entry.statics.get(ClassDesc::static_index(offset)?).copied()
    }
}

fn index_u32(index: usize) -> u32 {
    u32::try_from(index).unwrap_or_else(|_| panic!("heap index {index} overflows u32"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_class_is_idempotent() {
        let mut heap = LiveHeap::new();
        let a = heap.define_class(ClassDesc::new("A"));
        let again = heap.define_class(ClassDesc::new("A").static_prim("X"));
        assert_eq!(a, again);
        assert_eq!(heap.find_class("A"), Some(a));
        assert!(heap.class_desc(a).static_fields().is_empty());
    }

    #[test]
    fn test_statics_default_and_update() {
        let mut heap = LiveHeap::new();
        let cls = heap.define_class(ClassDesc::new("S").static_ref("R").static_prim("P"));
        assert_eq!(heap.static_by_name(cls, "R"), Some(Slot::NULL));
        assert_eq!(heap.static_by_name(cls, "P"), Some(Slot::Prim(0)));

        let obj = heap.alloc(cls, vec![Slot::Prim(5)]);
        assert!(heap.set_static(cls, "R", Slot::Ref(Some(obj))));
        assert!(!heap.set_static(cls, "missing", Slot::NULL));
        assert_eq!(heap.static_by_name(cls, "R"), Some(Slot::Ref(Some(obj))));
        assert_eq!(heap.class_of(obj), cls);
        assert_eq!(heap.slots(obj), &[Slot::Prim(5)]);
    }

    #[test]
    fn test_set_slot_builds_cycles() {
        let mut heap = LiveHeap::new();
        let node = heap.define_class(ClassDesc::new("Node"));
        let a = heap.alloc(node, vec![Slot::NULL]);
        let b = heap.alloc(node, vec![Slot::Ref(Some(a))]);
        heap.set_slot(a, 0, Slot::Ref(Some(b)));
        assert_eq!(heap.slots(a), &[Slot::Ref(Some(b))]);
        assert_eq!(heap.object_count(), 2);
    }
}
