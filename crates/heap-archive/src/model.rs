//! The object-model boundary.
//!
//! Archiving never owns the objects it walks. The producing process exposes
//! its heap through [`ObjectGraph`]: every object has a stable identity
//! token, a class, and a flat list of slots that are either primitive bits
//! or references.

use std::fmt;

/// Byte offset of the first static field in a class's static block.
pub const STATIC_FIELD_BASE: u32 = 16;

/// Size of a static field or object slot in bytes.
pub const SLOT_SIZE: u32 = 8;

/// Identity of a class in the producing or loading process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Identity of a live object. Stable for the duration of a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// One field or array element of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Raw primitive bits.
    Prim(u64),
    /// A reference, `None` for null.
    Ref(Option<ObjectId>),
}

impl Slot {
    /// The null reference.
    pub const NULL: Self = Self::Ref(None);

    /// Returns `true` if this slot holds a reference (null included).
    #[must_use]
    pub const fn is_reference(&self) -> bool {
        matches!(self, Self::Ref(_))
    }
}

/// Per-class traits relevant to archiving.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassFlags(u8);

impl ClassFlags {
    /// No special traits.
    pub const NONE: Self = Self(0);
    /// Instances carry identity that must not be duplicated across
    /// processes (locks, thread handles, interned tokens).
    pub const IDENTITY_SENSITIVE: Self = Self(1 << 0);
    /// Instances wrap a resource owned by the producing process
    /// (file descriptors, native memory, sockets).
    pub const EXTERNAL_RESOURCE: Self = Self(1 << 1);

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if instances are unsafe to archive regardless of policy.
    #[must_use]
    pub const fn is_intrinsically_unsafe(self) -> bool {
        self.0 & (Self::IDENTITY_SENSITIVE.0 | Self::EXTERNAL_RESOURCE.0) != 0
    }
}

impl std::ops::BitOr for ClassFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ClassFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(Self::IDENTITY_SENSITIVE) {
            set.entry(&"IDENTITY_SENSITIVE");
        }
        if self.contains(Self::EXTERNAL_RESOURCE) {
            set.entry(&"EXTERNAL_RESOURCE");
        }
        set.finish()
    }
}

/// A static field declared by a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticField {
    /// Field name.
    pub name: String,
    /// Byte offset in the class's static block.
    pub offset: u32,
    /// Whether the field holds a reference.
    pub is_reference: bool,
}

/// Description of a class: its name, flags and static fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDesc {
    name: String,
    flags: ClassFlags,
    static_fields: Vec<StaticField>,
}

impl ClassDesc {
    /// Starts describing a class with no static fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: ClassFlags::NONE,
            static_fields: Vec::new(),
        }
    }

    /// Sets the class flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: ClassFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Declares a static reference field.
    #[must_use]
    pub fn static_ref(self, name: impl Into<String>) -> Self {
        self.push_static(name.into(), true)
    }

    /// Declares a static primitive field.
    #[must_use]
    pub fn static_prim(self, name: impl Into<String>) -> Self {
        self.push_static(name.into(), false)
    }

    fn push_static(mut self, name: String, is_reference: bool) -> Self {
        let index = u32::try_from(self.static_fields.len()).unwrap_or(u32::MAX);
        self.static_fields.push(StaticField {
            name,
            offset: STATIC_FIELD_BASE + index * SLOT_SIZE,
            is_reference,
        });
        self
    }

    /// The class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The class flags.
    #[must_use]
    pub const fn flags(&self) -> ClassFlags {
        self.flags
    }

    /// All static fields in declaration order.
    #[must_use]
    pub fn static_fields(&self) -> &[StaticField] {
        &self.static_fields
    }

    /// Looks up a static field by name.
    #[must_use]
    pub fn static_field(&self, name: &str) -> Option<&StaticField> {
        self.static_fields.iter().find(|f| f.name == name)
    }

    /// Index of the static field at `offset` in declaration order.
    #[must_use]
    pub fn static_index(offset: u32) -> Option<usize> {
        let rel = offset.checked_sub(STATIC_FIELD_BASE)?;
        (rel % SLOT_SIZE == 0).then(|| (rel / SLOT_SIZE) as usize)
    }
}

/// Read access to the producing process's heap, used by the dump-time walks.
///
/// Implementations must present a quiesced heap: no object, slot or static
/// value may change while a session holds the graph.
pub trait ObjectGraph {
    /// Resolves a class by name, if it is loaded.
    fn find_class(&self, name: &str) -> Option<ClassId>;

    /// Describes a loaded class.
    fn class_desc(&self, class: ClassId) -> &ClassDesc;

    /// The runtime class of an object.
    fn class_of(&self, obj: ObjectId) -> ClassId;

    /// Instance fields or array elements of an object.
    fn slots(&self, obj: ObjectId) -> &[Slot];

    /// Current value of the static field at `offset` of `class`.
    fn static_value(&self, class: ClassId, offset: u32) -> Option<Slot>;
}
