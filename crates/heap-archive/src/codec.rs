//! Compressed references used inside the archive.
//!
//! Archived objects refer to each other through 32-bit narrow references
//! computed against the archive's own base and shift. These are fixed when
//! the archive heap is laid out at dump time and have nothing to do with any
//! compression scheme the loading process uses for its own heap, so decoding
//! archived data must always go through [`NarrowCodec`].

/// Largest supported shift. Archived objects are 8-byte aligned.
pub const MAX_NARROW_SHIFT: u32 = 3;

/// A 32-bit archive-relative reference. Zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct NarrowRef(pub u32);

impl NarrowRef {
    /// The null reference.
    pub const NULL: Self = Self(0);

    /// Returns `true` for the null reference.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Encodes `reference` relative to `base`, shifted right by `shift`.
///
/// Address zero encodes to zero. A non-null reference must lie above `base`,
/// be aligned to `1 << shift` relative to it and fit in 32 bits once
/// shifted; the dump-time layout guarantees all three.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode(reference: u64, base: u64, shift: u32) -> NarrowRef {
    if reference == 0 {
        return NarrowRef::NULL;
    }
    debug_assert!(reference > base, "reference {reference:#x} below base {base:#x}");
    let delta = reference - base;
    debug_assert_eq!(delta & ((1 << shift) - 1), 0, "misaligned reference");
    let narrow = delta >> shift;
    debug_assert!(u32::try_from(narrow).is_ok(), "reference out of narrow range");
    NarrowRef(narrow as u32)
}

/// Decodes a narrow reference. Zero decodes to zero without touching
/// `base` or `shift`.
#[inline]
#[must_use]
pub fn decode(narrow: NarrowRef, base: u64, shift: u32) -> u64 {
    if narrow.is_null() {
        return 0;
    }
    base + (u64::from(narrow.0) << shift)
}

/// The base/shift pair an archive was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NarrowCodec {
    base: u64,
    shift: u32,
}

impl NarrowCodec {
    /// Creates a codec.
    ///
    /// Returns `None` if `shift` exceeds [`MAX_NARROW_SHIFT`], `base` is
    /// not aligned to `1 << shift`, or the highest narrow value would decode
    /// past `u64::MAX`.
    #[must_use]
    pub const fn new(base: u64, shift: u32) -> Option<Self> {
        if shift > MAX_NARROW_SHIFT || base & ((1 << shift) - 1) != 0 {
            return None;
        }
        if base.checked_add((u32::MAX as u64) << shift).is_none() {
            return None;
        }
        Some(Self { base, shift })
    }

    /// The archive base address.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// The archive shift.
    #[must_use]
    pub const fn shift(&self) -> u32 {
        self.shift
    }

    /// Highest address encodable with this codec.
    #[must_use]
    pub const fn max_address(&self) -> u64 {
        self.base + ((u32::MAX as u64) << self.shift)
    }

    /// See [`encode`].
    #[inline]
    #[must_use]
    pub fn encode(&self, reference: u64) -> NarrowRef {
        encode(reference, self.base, self.shift)
    }

    /// See [`decode`]. Never overflows: the codec's range was checked on
    /// construction.
    #[inline]
    #[must_use]
    pub fn decode(&self, narrow: NarrowRef) -> u64 {
        decode(narrow, self.base, self.shift)
    }
}
