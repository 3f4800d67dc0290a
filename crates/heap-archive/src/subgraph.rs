//! Dump-time subgraph infos.
//!
//! One [`SubgraphInfo`] per root class collects the class's archived entry
//! fields and every class whose instances appear in the archived subgraphs.
//! The loading process resolves those classes before handing out any of the
//! archived objects.

use std::collections::{HashMap, HashSet};

use crate::codec::NarrowRef;
use crate::model::ClassId;
use crate::region::RegionKind;

/// How an entry field's value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EntryKind {
    /// Narrow reference into the closed region.
    Closed = 0,
    /// Narrow reference into the open region.
    Open = 1,
    /// Raw bits of a primitive static.
    Primitive = 2,
}

impl EntryKind {
    /// Inverse of `self as u32`.
    #[must_use]
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Closed),
            1 => Some(Self::Open),
            2 => Some(Self::Primitive),
            _ => None,
        }
    }

    /// Region holding the referenced object, `None` for primitives.
    #[must_use]
    pub const fn region(self) -> Option<RegionKind> {
        match self {
            Self::Closed => Some(RegionKind::Closed),
            Self::Open => Some(RegionKind::Open),
            Self::Primitive => None,
        }
    }
}

impl From<RegionKind> for EntryKind {
    fn from(kind: RegionKind) -> Self {
        match kind {
            RegionKind::Closed => Self::Closed,
            RegionKind::Open => Self::Open,
        }
    }
}

/// One archived static field of a root class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryField {
    /// Byte offset of the static field.
    pub offset: u32,
    /// How `value` is to be read.
    pub kind: EntryKind,
    /// Narrow reference (zero-extended) or primitive bits.
    pub value: u64,
}

impl EntryField {
    /// An entry holding a reference.
    #[must_use]
    pub fn reference(offset: u32, kind: RegionKind, narrow: NarrowRef) -> Self {
        Self {
            offset,
            kind: kind.into(),
            value: u64::from(narrow.0),
        }
    }

    /// An entry holding primitive bits.
    #[must_use]
    pub const fn primitive(offset: u32, bits: u64) -> Self {
        Self {
            offset,
            kind: EntryKind::Primitive,
            value: bits,
        }
    }

    /// The narrow reference, or `None` for primitive entries and values
    /// that do not fit in 32 bits.
    #[must_use]
    pub fn narrow(&self) -> Option<NarrowRef> {
        match self.kind {
            EntryKind::Primitive => None,
            _ => u32::try_from(self.value).ok().map(NarrowRef),
        }
    }
}

/// Mutable per-root-class record built during recording.
#[derive(Debug, Clone)]
pub struct SubgraphInfo {
    class: ClassId,
    class_name: String,
    entry_fields: Vec<EntryField>,
    object_classes: Vec<String>,
    seen_classes: HashSet<ClassId>,
    is_partial_pre_init: bool,
}

impl SubgraphInfo {
    /// Creates an empty info for `class`.
    #[must_use]
    pub fn new(class: ClassId, class_name: impl Into<String>, is_partial_pre_init: bool) -> Self {
        Self {
            class,
            class_name: class_name.into(),
            entry_fields: Vec::new(),
            object_classes: Vec::new(),
            seen_classes: HashSet::new(),
            is_partial_pre_init,
        }
    }

    /// The root class.
    #[must_use]
    pub const fn class(&self) -> ClassId {
        self.class
    }

    /// Name of the root class.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Entry fields in recording order.
    #[must_use]
    pub fn entry_fields(&self) -> &[EntryField] {
        &self.entry_fields
    }

    /// Names of classes with instances in the subgraphs, in first-seen order.
    #[must_use]
    pub fn object_classes(&self) -> &[String] {
        &self.object_classes
    }

    /// Whether only some static fields are pre-initialized.
    #[must_use]
    pub const fn is_partial_pre_init(&self) -> bool {
        self.is_partial_pre_init
    }

    pub(crate) fn set_partial_pre_init(&mut self) {
        self.is_partial_pre_init = true;
    }

    /// Appends an entry field.
    pub fn add_entry_field(&mut self, field: EntryField) {
        debug_assert!(
            self.entry_fields.iter().all(|f| f.offset != field.offset),
            "field at offset {} recorded twice",
            field.offset
        );
        self.entry_fields.push(field);
    }

    /// Records the class of a walked object, the root class included.
    /// Returns `true` if the class was not recorded before.
    pub fn add_object_class(&mut self, class: ClassId, name: &str) -> bool {
        if !self.seen_classes.insert(class) {
            return false;
        }
        self.object_classes.push(name.to_owned());
        true
    }

    /// Number of recorded object classes.
    #[must_use]
    pub fn num_object_classes(&self) -> usize {
        self.object_classes.len()
    }
}

/// All subgraph infos of a session, in creation order.
#[derive(Debug, Default)]
pub struct SubgraphInfoTable {
    infos: Vec<SubgraphInfo>,
    index: HashMap<ClassId, usize>,
}

impl SubgraphInfoTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the info for `class`, creating it if needed.
    pub fn get_or_create(&mut self, class: ClassId, name: &str, is_partial_pre_init: bool) -> &mut SubgraphInfo {
        let infos = &mut self.infos;
        let idx = *self.index.entry(class).or_insert_with(|| {
            infos.push(SubgraphInfo::new(class, name, is_partial_pre_init));
            infos.len() - 1
        });
        &mut self.infos[idx]
    }

    /// The info for `class`, if any.
    #[must_use]
    pub fn find(&self, class: ClassId) -> Option<&SubgraphInfo> {
        self.index.get(&class).map(|&i| &self.infos[i])
    }

    pub(crate) fn find_mut(&mut self, class: ClassId) -> Option<&mut SubgraphInfo> {
        self.index.get(&class).map(|&i| &mut self.infos[i])
    }

    /// Iterates in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &SubgraphInfo> {
        self.infos.iter()
    }

    /// Number of infos.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_classes_deduplicated_and_include_root() {
        let mut info = SubgraphInfo::new(ClassId(0), "Root", false);
        assert!(info.add_object_class(ClassId(0), "Root"));
        assert!(info.add_object_class(ClassId(1), "A"));
        assert!(!info.add_object_class(ClassId(0), "Root"));
        assert!(!info.add_object_class(ClassId(1), "A"));
        assert_eq!(info.object_classes(), &["Root".to_owned(), "A".to_owned()]);
    }

    #[test]
    fn test_entry_field_values() {
        let r = EntryField::reference(16, RegionKind::Closed, NarrowRef(7));
        assert_eq!(r.kind, EntryKind::Closed);
        assert_eq!(r.narrow(), Some(NarrowRef(7)));
        let p = EntryField::primitive(24, u64::MAX);
        assert_eq!(p.narrow(), None);
        assert_eq!(EntryKind::from_u32(2), Some(EntryKind::Primitive));
        assert_eq!(EntryKind::from_u32(3), None);
        assert_eq!(EntryKind::Open.region(), Some(RegionKind::Open));
    }

    #[test]
    fn test_table_keeps_creation_order() {
        let mut table = SubgraphInfoTable::new();
        table.get_or_create(ClassId(5), "Five", true);
        table.get_or_create(ClassId(2), "Two", false);
        let again = table.get_or_create(ClassId(5), "Five", false);
        assert!(again.is_partial_pre_init());

        let names: Vec<&str> = table.iter().map(SubgraphInfo::class_name).collect();
        assert_eq!(names, vec!["Five", "Two"]);
        assert_eq!(table.len(), 2);
        assert!(table.find(ClassId(9)).is_none());
    }
}
