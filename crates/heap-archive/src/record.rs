//! Record compaction.

use crate::subgraph::{EntryField, SubgraphInfo};

/// The frozen form of a [`SubgraphInfo`], as stored in the lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchivedRecord {
    /// Name of the root class; the table key.
    pub class_name: String,
    /// Entry fields in recording order.
    pub entry_fields: Box<[EntryField]>,
    /// Classes to resolve before the entry values may be used.
    pub object_classes: Box<[String]>,
    /// Whether only some static fields are pre-initialized.
    pub is_partial_pre_init: bool,
}

impl ArchivedRecord {
    /// Flattens an info. Pure: the same info always yields the same record.
    #[must_use]
    pub fn compact(info: &SubgraphInfo) -> Self {
        Self {
            class_name: info.class_name().to_owned(),
            entry_fields: info.entry_fields().into(),
            object_classes: info.object_classes().into(),
            is_partial_pre_init: info.is_partial_pre_init(),
        }
    }
}
