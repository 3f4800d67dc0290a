//! Eligibility analysis.
//!
//! Decides which candidate fields and classes may be archived. Every
//! candidate starts out preservable. The object pass walks each candidate's
//! value graph and flips the candidate as soon as it reaches an object whose
//! class is intrinsically unsafe to copy into another process: flagged
//! identity-sensitive or externally-resourced, excluded by name, or already
//! found not preservable. Nothing here is an error; rejected candidates are
//! simply left out of the archive.

use std::collections::{HashMap, HashSet};

use crate::candidate::CandidateField;
use crate::model::{ClassId, ObjectGraph, ObjectId, Slot};
use crate::tracing::internal::{log_class_rejected, log_field_rejected};

/// Cached outcome of checking a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Eligibility {
    /// Not checked yet.
    #[default]
    Unchecked,
    /// All static state may be archived.
    Preservable,
    /// Neither the class's statics nor its instances may be archived.
    NotPreservable,
}

/// Two-pass eligibility checker with per-class and per-object caches.
#[derive(Debug, Default)]
pub struct EligibilityAnalyzer {
    excluded: HashSet<String>,
    classes: HashMap<ClassId, Eligibility>,
    /// Objects whose whole reachable closure passed.
    known_good: HashSet<ObjectId>,
    /// Objects that failed the object-level test themselves.
    known_bad: HashSet<ObjectId>,
}

impl EligibilityAnalyzer {
    /// Creates an analyzer that also rejects the named classes.
    #[must_use]
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: excluded.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Cached state of `class`.
    #[must_use]
    pub fn class_eligibility(&self, class: ClassId) -> Eligibility {
        self.classes.get(&class).copied().unwrap_or_default()
    }

    /// Returns `true` only for classes checked and found preservable.
    #[must_use]
    pub fn is_preservable_class(&self, class: ClassId) -> bool {
        self.class_eligibility(class) == Eligibility::Preservable
    }

    /// Returns `true` if the field resolved and survived the object pass.
    #[must_use]
    pub fn is_preservable_field(&self, field: &CandidateField) -> bool {
        field.can_preserve() && field.class().is_some()
    }

    /// The object-level test applied to every object reached by a walk.
    #[must_use]
    pub fn is_archivable_class(&self, graph: &dyn ObjectGraph, class: ClassId) -> bool {
        let desc = graph.class_desc(class);
        !desc.flags().is_intrinsically_unsafe()
            && !self.excluded.contains(desc.name())
            && self.class_eligibility(class) != Eligibility::NotPreservable
    }

    /// Walks everything reachable from `root` and reports whether all of it
    /// passes the object-level test. Stops at the first failure.
    pub fn check_reachable_objects_from(&mut self, graph: &dyn ObjectGraph, root: ObjectId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![root];
        while let Some(obj) = stack.pop() {
            if self.known_bad.contains(&obj) {
                return false;
            }
            if self.known_good.contains(&obj) || !visited.insert(obj) {
                continue;
            }
            if !self.is_archivable_class(graph, graph.class_of(obj)) {
                self.known_bad.insert(obj);
                return false;
            }
            stack.extend(graph.slots(obj).iter().filter_map(|slot| match slot {
                Slot::Ref(Some(child)) => Some(*child),
                _ => None,
            }));
        }
        self.known_good.extend(visited);
        true
    }

    fn check_static_value(&mut self, graph: &dyn ObjectGraph, class: ClassId, offset: u32) -> bool {
        match graph.static_value(class, offset) {
            Some(Slot::Ref(Some(obj))) => self.check_reachable_objects_from(graph, obj),
            Some(_) => true,
            None => false,
        }
    }

    /// Object pass over whole classes: a class is preservable only if every
    /// static reference field's graph passes.
    pub fn check_classes(&mut self, graph: &dyn ObjectGraph, classes: &[ClassId]) {
        for &class in classes {
            if self.class_eligibility(class) != Eligibility::Unchecked {
                continue;
            }
            let desc = graph.class_desc(class);
            let failed = if self.is_archivable_class(graph, class) {
                desc.static_fields()
                    .iter()
                    .filter(|f| f.is_reference)
                    .find(|f| !self.check_static_value(graph, class, f.offset))
                    .map(|f| f.name.clone())
            } else {
                Some(String::from("<class>"))
            };
            let outcome = match failed {
                Some(field) => {
                    log_class_rejected(desc.name(), &field);
                    Eligibility::NotPreservable
                }
                None => Eligibility::Preservable,
            };
            self.classes.insert(class, outcome);
        }
        // Classes just rejected may have instances among the objects already
        // accepted; recheck everything from scratch for the field pass.
        self.known_good.clear();
    }

    /// Field pass then object pass over registered candidates.
    pub fn check_fields(&mut self, graph: &dyn ObjectGraph, fields: &mut [CandidateField]) {
        for field in fields.iter_mut() {
            if !field.resolve(graph) {
                log_field_rejected(field.class_name(), field.field_name(), "unresolved");
            }
        }
        for field in fields.iter_mut().filter(|f| f.can_preserve()) {
            let (Some(class), Some(offset)) = (field.class(), field.offset()) else {
                continue;
            };
            if !self.check_static_value(graph, class, offset) {
                field.set_can_preserve(false);
                log_field_rejected(field.class_name(), field.field_name(), "unsafe object reachable");
            }
        }
    }
}
