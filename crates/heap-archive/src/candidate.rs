//! Static fields registered for archiving.
//!
//! Candidates are named before their classes are loaded and resolved to a
//! class and byte offset once, when the eligibility analyzer runs.

use crate::model::{ClassId, ObjectGraph};
use crate::region::RegionKind;

/// A (class, field) pair slated for archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateField {
    class_name: String,
    field_name: String,
    kind: RegionKind,
    resolved: Option<(ClassId, u32)>,
    can_preserve: bool,
}

impl CandidateField {
    /// Registers a candidate. It starts out preservable and unresolved.
    #[must_use]
    pub fn new(class_name: impl Into<String>, field_name: impl Into<String>, kind: RegionKind) -> Self {
        Self {
            class_name: class_name.into(),
            field_name: field_name.into(),
            kind,
            resolved: None,
            can_preserve: true,
        }
    }

    /// Name of the declaring class.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Name of the static field.
    #[must_use]
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Region the field's subgraph is archived into.
    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Resolved class, if resolution succeeded.
    #[must_use]
    pub fn class(&self) -> Option<ClassId> {
        self.resolved.map(|(class, _)| class)
    }

    /// Resolved byte offset, if resolution succeeded.
    #[must_use]
    pub fn offset(&self) -> Option<u32> {
        self.resolved.map(|(_, offset)| offset)
    }

    /// Whether the field's subgraph may be archived.
    #[must_use]
    pub const fn can_preserve(&self) -> bool {
        self.can_preserve
    }

    pub(crate) fn set_can_preserve(&mut self, can_preserve: bool) {
        self.can_preserve = can_preserve;
    }

    /// Resolves the candidate against loaded classes.
    ///
    /// A missing class, a missing field or a primitive field leaves the
    /// candidate unresolved and not preservable. Resolving twice is a no-op.
    pub fn resolve(&mut self, graph: &dyn ObjectGraph) -> bool {
        if self.resolved.is_some() {
            return true;
        }
        let resolved = graph.find_class(&self.class_name).and_then(|class| {
            graph
                .class_desc(class)
                .static_field(&self.field_name)
                .filter(|f| f.is_reference)
                .map(|f| (class, f.offset))
        });
        match resolved {
            Some(r) => {
                self.resolved = Some(r);
                true
            }
            None => {
                self.can_preserve = false;
                false
            }
        }
    }
}
