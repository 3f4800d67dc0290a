//! Archive heap regions.
//!
//! A region is a contiguous run of 8-byte words holding archived objects,
//! paired with a [`RefBitmap`] marking which words are references. Closed
//! regions hold objects that are never written after load and may be shared
//! read-only; open regions may be mutated in place.
//!
//! At dump time a region exists as a [`RegionImage`]. At load time it is
//! copied into memory granted by a [`RegionMapper`] and becomes a
//! [`MappedRegion`], which moves through `Unmapped -> Mapped -> FixedUp`
//! and never back.

use std::fmt;
use std::io;

#[cfg(loom)]
use loom::sync::atomic::{AtomicU8, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU8, Ordering};

use sys_alloc::{Mmap, MmapOptions};

use crate::bitmap::RefBitmap;
use crate::error::{ArchiveError, Result};

/// Size of a region word in bytes.
pub const WORD_SIZE: usize = 8;

/// The two kinds of archive heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RegionKind {
    /// Never mutated after load; shareable read-only.
    Closed = 0,
    /// May be mutated in place after load.
    Open = 1,
}

impl RegionKind {
    /// Both kinds, closed first.
    pub const ALL: [Self; 2] = [Self::Closed, Self::Open];

    /// Index into per-kind arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Inverse of `self as u8`.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Closed),
            1 => Some(Self::Open),
            _ => None,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
        }
    }
}

/// Lifecycle of a region in the loading process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionState {
    /// No memory holds the region.
    Unmapped = 0,
    /// The image has been copied into mapped memory; references are still narrow.
    Mapped = 1,
    /// Every reference word holds a native address.
    FixedUp = 2,
}

impl RegionState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Mapped,
            2 => Self::FixedUp,
            _ => Self::Unmapped,
        }
    }
}

/// A region as written at dump time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionImage {
    /// Region kind.
    pub kind: RegionKind,
    /// Address the region was laid out at.
    pub dump_base: u64,
    /// Region contents.
    pub words: Vec<u64>,
    /// Reference words.
    pub oopmap: RefBitmap,
}

impl RegionImage {
    /// Creates an empty image.
    #[must_use]
    pub fn new(kind: RegionKind, dump_base: u64) -> Self {
        Self {
            kind,
            dump_base,
            words: Vec::new(),
            oopmap: RefBitmap::new(0),
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    /// Returns `true` if the dump-time address `addr` falls inside the image.
    #[must_use]
    pub fn contains_dump_addr(&self, addr: u64) -> bool {
        addr >= self.dump_base && addr < self.dump_base + self.byte_len() as u64
    }
}

/// The memory-mapping collaborator.
///
/// Chooses where a region lives in the loading process. The granted address
/// may differ from `preferred_base`; fixup relocates accordingly.
pub trait RegionMapper {
    /// Maps at least `len` zeroed, writable bytes for a region.
    fn map_region(&self, kind: RegionKind, preferred_base: u64, len: usize) -> io::Result<Mmap>;
}

/// Maps regions with anonymous memory, asking for the dump-time address.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapRegionMapper {
    ignore_preferred: bool,
}

impl MmapRegionMapper {
    /// A mapper that requests the dump-time address.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ignore_preferred: false,
        }
    }

    /// A mapper that lets the OS pick, so regions almost always relocate.
    #[must_use]
    pub const fn relocating() -> Self {
        Self {
            ignore_preferred: true,
        }
    }
}

impl RegionMapper for MmapRegionMapper {
    fn map_region(&self, _kind: RegionKind, preferred_base: u64, len: usize) -> io::Result<Mmap> {
        let mut opts = MmapOptions::new().len(sys_alloc::round_to_page(len));
        if !self.ignore_preferred {
            if let Ok(hint) = usize::try_from(preferred_base) {
                opts = opts.with_hint(hint);
            }
        }
        // SAFETY: the hint is advisory; an occupied range is never replaced.
        unsafe { opts.map_anon() }
    }
}

/// A region copied into memory of the loading process.
#[derive(Debug)]
pub struct MappedRegion {
    kind: RegionKind,
    dump_base: u64,
    len_words: usize,
    memory: Mmap,
    oopmap: RefBitmap,
    state: AtomicU8,
}

impl MappedRegion {
    /// Maps `image` through `mapper` and copies its words in.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::MapFailed`] if the mapper fails or hands back
    /// less memory than asked for.
    pub fn map(image: &RegionImage, mapper: &dyn RegionMapper) -> Result<Self> {
        let len = image.byte_len();
        let mut memory = mapper
            .map_region(image.kind, image.dump_base, len)
            .map_err(|source| ArchiveError::MapFailed {
                kind: image.kind,
                source,
            })?;
        if memory.len() < len {
            return Err(ArchiveError::MapFailed {
                kind: image.kind,
                source: io::Error::new(io::ErrorKind::InvalidData, "mapping shorter than region"),
            });
        }
        for (chunk, word) in memory.as_mut_slice().chunks_exact_mut(WORD_SIZE).zip(&image.words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        Ok(Self {
            kind: image.kind,
            dump_base: image.dump_base,
            len_words: image.words.len(),
            memory,
            oopmap: image.oopmap.clone(),
            state: AtomicU8::new(RegionState::Mapped as u8),
        })
    }

    /// Region kind.
    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Address the region was laid out at during the dump.
    #[must_use]
    pub const fn dump_base(&self) -> u64 {
        self.dump_base
    }

    /// Address the region was granted in this process.
    #[must_use]
    pub fn live_base(&self) -> u64 {
        self.memory.addr() as u64
    }

    /// Region size in bytes (excluding page rounding).
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.len_words * WORD_SIZE
    }

    /// Number of words.
    #[must_use]
    pub const fn len_words(&self) -> usize {
        self.len_words
    }

    /// Reference words.
    #[must_use]
    pub const fn oopmap(&self) -> &RefBitmap {
        &self.oopmap
    }

    /// Current state. Acquire ordering pairs with the release in
    /// [`MappedRegion::mark_fixed_up`].
    #[must_use]
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` once fixup has completed.
    #[must_use]
    pub fn is_fixed_up(&self) -> bool {
        self.state() == RegionState::FixedUp
    }

    /// Returns `true` if the live address `addr` falls inside the region.
    #[must_use]
    pub fn contains_live_addr(&self, addr: u64) -> bool {
        addr >= self.live_base() && addr < self.live_base() + self.byte_len() as u64
    }

    /// Reads the word at `index`.
    #[must_use]
    pub fn word(&self, index: usize) -> Option<u64> {
        if index >= self.len_words {
            return None;
        }
        let start = index * WORD_SIZE;
        let mut buf = [0u8; WORD_SIZE];
        buf.copy_from_slice(&self.memory.as_slice()[start..start + WORD_SIZE]);
        Some(u64::from_ne_bytes(buf))
    }

    /// Reads the word at live address `addr`.
    #[must_use]
    pub fn word_at(&self, addr: u64) -> Option<u64> {
        if !self.contains_live_addr(addr) || addr % WORD_SIZE as u64 != 0 {
            return None;
        }
        self.word(usize::try_from((addr - self.live_base()) / WORD_SIZE as u64).ok()?)
    }

    pub(crate) fn set_word(&mut self, index: usize, value: u64) {
        let start = index * WORD_SIZE;
        self.memory.as_mut_slice()[start..start + WORD_SIZE].copy_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn mark_fixed_up(&self) {
        self.state.store(RegionState::FixedUp as u8, Ordering::Release);
    }

    pub(crate) fn protect(&self) -> Result<()> {
        if self.kind == RegionKind::Closed {
            self.memory.protect_read_only()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingMapper;

    impl RegionMapper for FailingMapper {
        fn map_region(&self, _: RegionKind, _: u64, _: usize) -> io::Result<Mmap> {
            Err(io::Error::new(io::ErrorKind::OutOfMemory, "no address space"))
        }
    }

    fn image() -> RegionImage {
        let mut image = RegionImage::new(RegionKind::Open, 0x10_0000);
        image.words = vec![0xAA, 0xBB, 3];
        image.oopmap = RefBitmap::new(3);
        image.oopmap.set(2);
        image
    }

    #[test]
    fn test_map_copies_words() {
        let region = MappedRegion::map(&image(), &MmapRegionMapper::relocating()).unwrap();
        assert_eq!(region.state(), RegionState::Mapped);
        assert_eq!(region.len_words(), 3);
        assert_eq!(region.word(0), Some(0xAA));
        assert_eq!(region.word(2), Some(3));
        assert_eq!(region.word(3), None);
        assert_eq!(region.word_at(region.live_base() + 8), Some(0xBB));
        assert_eq!(region.word_at(region.live_base() + 4), None);
        assert!(region.oopmap().is_set(2));
    }

    #[test]
    fn test_map_failure_is_reported() {
        let err = MappedRegion::map(&image(), &FailingMapper).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::MapFailed {
                kind: RegionKind::Open,
                ..
            }
        ));
    }

    #[test]
    fn test_dump_addr_bounds() {
        let image = image();
        assert!(image.contains_dump_addr(0x10_0000));
        assert!(image.contains_dump_addr(0x10_0010));
        assert!(!image.contains_dump_addr(0x10_0018));
        assert!(!image.contains_dump_addr(0x0f_fff8));
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in RegionKind::ALL {
            assert_eq!(RegionKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(RegionKind::from_u8(9), None);
        assert_eq!(RegionKind::Closed.to_string(), "closed");
    }
}
