//! Region fixup.
//!
//! Rewrites every reference word of a mapped region from its dump-time
//! narrow form to a native address in this process. A narrow value decodes
//! to a dump-time address; that address is relocated by the delta of
//! whichever region contains it, since the two regions may have been mapped
//! at unrelated addresses.

use crate::codec::{NarrowCodec, NarrowRef};
use crate::error::{ArchiveError, Result};
use crate::region::{MappedRegion, RegionKind, RegionState};
use crate::tracing::internal::log_region_fixed_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Relocation {
    kind: RegionKind,
    dump_base: u64,
    len: u64,
    live_base: u64,
}

/// Dump-time to load-time address translation for every mapped region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationMap {
    entries: Vec<Relocation>,
}

impl RelocationMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects the placement of every region in `regions`.
    pub fn from_regions<'a>(regions: impl IntoIterator<Item = &'a MappedRegion>) -> Self {
        let mut map = Self::new();
        for region in regions {
            map.add(region.kind(), region.dump_base(), region.byte_len(), region.live_base());
        }
        map
    }

    /// Adds one region's placement.
    pub fn add(&mut self, kind: RegionKind, dump_base: u64, byte_len: usize, live_base: u64) {
        self.entries.push(Relocation {
            kind,
            dump_base,
            len: byte_len as u64,
            live_base,
        });
    }

    /// Translates a dump-time address. `None` if no region contains it.
    #[must_use]
    pub fn relocate(&self, dump_addr: u64) -> Option<u64> {
        self.region_of(dump_addr)
            .map(|r| r.live_base + (dump_addr - r.dump_base))
    }

    /// Region kind holding a dump-time address.
    #[must_use]
    pub fn kind_of(&self, dump_addr: u64) -> Option<RegionKind> {
        self.region_of(dump_addr).map(|r| r.kind)
    }

    /// Live base minus dump base of region `kind`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delta(&self, kind: RegionKind) -> Option<i64> {
        self.entries
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.live_base.wrapping_sub(r.dump_base) as i64)
    }

    fn region_of(&self, dump_addr: u64) -> Option<&Relocation> {
        self.entries
            .iter()
            .find(|r| dump_addr >= r.dump_base && dump_addr - r.dump_base < r.len)
    }
}

/// Counters of one region's fixup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixupStats {
    /// Reference words rewritten to a native address.
    pub patched: usize,
    /// Null reference words, left at zero.
    pub nulls: usize,
}

impl std::ops::AddAssign for FixupStats {
    fn add_assign(&mut self, rhs: Self) {
        self.patched += rhs.patched;
        self.nulls += rhs.nulls;
    }
}

/// Rewrites the reference words of mapped regions.
#[derive(Debug, Clone, Copy)]
pub struct RegionFixup<'a> {
    codec: NarrowCodec,
    relocations: &'a RelocationMap,
}

impl<'a> RegionFixup<'a> {
    /// Creates a fixup pass for regions written with `codec`.
    #[must_use]
    pub const fn new(codec: NarrowCodec, relocations: &'a RelocationMap) -> Self {
        Self { codec, relocations }
    }

    /// Fixes up one region.
    ///
    /// Every marked word is decoded and relocated before any is written, so
    /// a failure leaves the region exactly as mapped. On success the region
    /// is published as [`RegionState::FixedUp`] and, if closed, made
    /// read-only.
    ///
    /// # Errors
    ///
    /// * [`ArchiveError::AlreadyFixedUp`] if the region was fixed up before.
    /// * [`ArchiveError::RegionNotMapped`] if it holds no memory.
    /// * [`ArchiveError::DanglingReference`] if a word does not decode into
    ///   any mapped region.
    pub fn fixup(&self, region: &mut MappedRegion) -> Result<FixupStats> {
        let kind = region.kind();
        match region.state() {
            RegionState::FixedUp => return Err(ArchiveError::AlreadyFixedUp(kind)),
            RegionState::Unmapped => return Err(ArchiveError::RegionNotMapped(kind)),
            RegionState::Mapped => {}
        }

        let mut stats = FixupStats::default();
        let mut patches = Vec::with_capacity(region.oopmap().set_count());
        for index in region.oopmap().iter_set() {
            let word = region.word(index).unwrap_or(u64::MAX);
            let dangling = |narrow| ArchiveError::DanglingReference { kind, word: index, narrow };
            let narrow = u32::try_from(word).map_err(|_| dangling(u32::MAX))?;
            if narrow == 0 {
                stats.nulls += 1;
                continue;
            }
            let dump_addr = self.codec.decode(NarrowRef(narrow));
            let live = self.relocations.relocate(dump_addr).ok_or_else(|| dangling(narrow))?;
            patches.push((index, live));
        }

        for &(index, live) in &patches {
            region.set_word(index, live);
        }
        stats.patched = patches.len();
        region.mark_fixed_up();
        log_region_fixed_up(kind, stats.patched, self.relocations.delta(kind).unwrap_or(0));
        region.protect()?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::RefBitmap;
    use crate::region::{MmapRegionMapper, RegionImage};

    const BASE: u64 = 0x7_0000_0000;

    fn codec() -> NarrowCodec {
        NarrowCodec::new(BASE, 3).unwrap()
    }

    /// Open region at `BASE + 0x100`: word 0 header, word 1 points at word 3,
    /// word 2 null, word 3 primitive.
    fn open_image() -> RegionImage {
        let mut image = RegionImage::new(RegionKind::Open, BASE + 0x100);
        let target = codec().encode(BASE + 0x100 + 24);
        image.words = vec![1 << 32, u64::from(target.0), 0, 0xDEAD];
        image.oopmap = RefBitmap::new(4);
        image.oopmap.set(1);
        image.oopmap.set(2);
        image
    }

    #[test]
    fn test_relocation_map() {
        let mut map = RelocationMap::new();
        map.add(RegionKind::Closed, 0x1000, 0x100, 0x9000);
        map.add(RegionKind::Open, 0x1100, 0x100, 0x4000);
        assert_eq!(map.relocate(0x1008), Some(0x9008));
        assert_eq!(map.relocate(0x1108), Some(0x4008));
        assert_eq!(map.relocate(0x1200), None);
        assert_eq!(map.kind_of(0x10f8), Some(RegionKind::Closed));
        assert_eq!(map.delta(RegionKind::Open), Some(0x4000 - 0x1100));
        assert_eq!(map.delta(RegionKind::Closed), Some(0x8000));
    }

    #[test]
    fn test_fixup_patches_and_publishes() {
        let mut region = MappedRegion::map(&open_image(), &MmapRegionMapper::relocating()).unwrap();
        let relocations = RelocationMap::from_regions([&region]);
        let stats = RegionFixup::new(codec(), &relocations).fixup(&mut region).unwrap();

        assert_eq!(stats, FixupStats { patched: 1, nulls: 1 });
        assert_eq!(region.state(), RegionState::FixedUp);
        assert_eq!(region.word(1), Some(region.live_base() + 24));
        assert_eq!(region.word(2), Some(0));
        assert_eq!(region.word(3), Some(0xDEAD));
    }

    #[test]
    fn test_second_fixup_rejected() {
        let mut region = MappedRegion::map(&open_image(), &MmapRegionMapper::relocating()).unwrap();
        let relocations = RelocationMap::from_regions([&region]);
        let fixup = RegionFixup::new(codec(), &relocations);
        fixup.fixup(&mut region).unwrap();
        let patched = region.word(1);

        let err = fixup.fixup(&mut region).unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyFixedUp(RegionKind::Open)));
        assert_eq!(region.word(1), patched);
    }

    #[test]
    fn test_dangling_reference_leaves_region_untouched() {
        let mut image = open_image();
        image.oopmap.set(3);
        let mut region = MappedRegion::map(&image, &MmapRegionMapper::relocating()).unwrap();
        let relocations = RelocationMap::from_regions([&region]);
        let err = RegionFixup::new(codec(), &relocations).fixup(&mut region).unwrap_err();

        assert!(matches!(
            err,
            ArchiveError::DanglingReference {
                kind: RegionKind::Open,
                word: 3,
                ..
            }
        ));
        assert_eq!(region.state(), RegionState::Mapped);
        assert_eq!(region.word(1), Some(image.words[1]));
    }
}
