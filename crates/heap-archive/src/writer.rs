//! Dump-time region images.
//!
//! Archived objects are bump-allocated into one image per region kind. Each
//! object is a header word followed by one word per slot:
//!
//! ```text
//! header   class index (low 32 bits) | slot count (high 32 bits)
//! slot     primitive bits, or a narrow reference (0 = null)
//! ```
//!
//! Class indices point into the archive's class-name table. Every reference
//! slot is marked in the region's oopmap, null or not. Word 0 of the closed
//! region is a reserved sentinel so no object ever encodes to narrow zero.

use std::collections::HashMap;

use crate::cache::ArchivedAddr;
use crate::codec::{NarrowCodec, NarrowRef};
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::model::Slot;
use crate::region::{RegionImage, RegionKind, WORD_SIZE};

/// Splits a header word into (class index, slot count).
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn decode_header(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// Packs a header word.
#[inline]
#[must_use]
pub const fn encode_header(class_index: u32, slot_count: u32) -> u64 {
    class_index as u64 | ((slot_count as u64) << 32)
}

/// An archived object as laid out in a [`HeapWriter`] image.
#[derive(Debug, Clone, Copy)]
pub struct WrittenObject<'a> {
    /// Name of the object's class.
    pub class_name: &'a str,
    /// Slot words.
    pub words: &'a [u64],
    first_word: usize,
    image: &'a RegionImage,
}

impl WrittenObject<'_> {
    /// Returns `true` if slot `index` is a reference slot.
    #[must_use]
    pub fn is_reference(&self, index: usize) -> bool {
        self.image.oopmap.is_set(self.first_word + index)
    }
}

/// Builds the closed and open region images of one dump.
#[derive(Debug)]
pub struct HeapWriter {
    codec: NarrowCodec,
    capacity: usize,
    images: [RegionImage; 2],
    class_names: Vec<String>,
    class_index: HashMap<String, u32>,
}

impl HeapWriter {
    /// Creates empty images at the configured dump-time bases.
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not describe addressable regions.
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        config.validate()?;
        let mut closed = RegionImage::new(RegionKind::Closed, config.region_base(RegionKind::Closed));
        closed.words.push(0);
        closed.oopmap.grow(1);
        Ok(Self {
            codec: config.codec()?,
            capacity: config.region_capacity,
            images: [closed, RegionImage::new(RegionKind::Open, config.region_base(RegionKind::Open))],
            class_names: Vec::new(),
            class_index: HashMap::new(),
        })
    }

    /// The codec narrow references are written with.
    #[must_use]
    pub const fn codec(&self) -> NarrowCodec {
        self.codec
    }

    /// The image of `kind` as built so far.
    #[must_use]
    pub const fn image(&self, kind: RegionKind) -> &RegionImage {
        &self.images[kind.index()]
    }

    /// Class-name table index of `name`, adding it if needed.
    pub fn class_index(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.class_index.get(name) {
            return idx;
        }
        #[allow(clippy::cast_possible_truncation)]
        let idx = self.class_names.len() as u32;
        self.class_names.push(name.to_owned());
        self.class_index.insert(name.to_owned(), idx);
        idx
    }

    /// Copies an object's shape into region `kind`.
    ///
    /// Primitive slots are copied; reference slots are zeroed and marked,
    /// to be filled in by [`HeapWriter::patch_reference`].
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::RegionOverflow`] if the object does not fit.
    pub fn allocate(&mut self, kind: RegionKind, class_name: &str, slots: &[Slot]) -> Result<ArchivedAddr> {
        let overflow = || ArchiveError::RegionOverflow {
            kind,
            capacity: self.capacity,
        };
        let image = &self.images[kind.index()];
        let start = image.words.len();
        let end = start + 1 + slots.len();
        if end * WORD_SIZE > self.capacity {
            return Err(overflow());
        }
        let slot_count = u32::try_from(slots.len()).map_err(|_| overflow())?;

        let class_index = self.class_index(class_name);
        let image = &mut self.images[kind.index()];
        image.words.push(encode_header(class_index, slot_count));
        image.oopmap.grow(end);
        for (i, slot) in slots.iter().enumerate() {
            match *slot {
                Slot::Prim(bits) => image.words.push(bits),
                Slot::Ref(_) => {
                    image.words.push(0);
                    image.oopmap.set(start + 1 + i);
                }
            }
        }
        Ok(ArchivedAddr {
            addr: image.dump_base + (start * WORD_SIZE) as u64,
            kind,
        })
    }

    fn word_index(&self, obj: ArchivedAddr) -> usize {
        let base = self.images[obj.kind.index()].dump_base;
        usize::try_from((obj.addr - base) / WORD_SIZE as u64).unwrap_or(usize::MAX)
    }

    /// Stores a narrow reference to `target` in slot `slot` of `obj`.
    pub fn patch_reference(&mut self, obj: ArchivedAddr, slot: usize, target: Option<ArchivedAddr>) {
        let at = self.word_index(obj) + 1 + slot;
        let narrow = target.map_or(NarrowRef::NULL, |t| self.codec.encode(t.addr));
        let image = &mut self.images[obj.kind.index()];
        debug_assert!(image.oopmap.is_set(at), "patching non-reference word {at}");
        image.words[at] = u64::from(narrow.0);
    }

    /// Reads back an archived object.
    #[must_use]
    pub fn object(&self, obj: ArchivedAddr) -> Option<WrittenObject<'_>> {
        let image = &self.images[obj.kind.index()];
        if !image.contains_dump_addr(obj.addr) {
            return None;
        }
        let at = self.word_index(obj);
        let (class_index, slot_count) = decode_header(*image.words.get(at)?);
        let words = image.words.get(at + 1..at + 1 + slot_count as usize)?;
        Some(WrittenObject {
            class_name: self.class_names.get(class_index as usize)?,
            words,
            first_word: at + 1,
            image,
        })
    }

    /// Resolves a narrow reference to the object it names.
    #[must_use]
    pub fn resolve(&self, narrow: NarrowRef) -> Option<ArchivedAddr> {
        if narrow.is_null() {
            return None;
        }
        let addr = self.codec.decode(narrow);
        RegionKind::ALL
            .into_iter()
            .find(|&kind| self.images[kind.index()].contains_dump_addr(addr))
            .map(|kind| ArchivedAddr { addr, kind })
    }

    /// Current fill of both images, for [`HeapWriter::rollback`].
    #[must_use]
    pub fn mark(&self) -> [usize; 2] {
        [self.images[0].words.len(), self.images[1].words.len()]
    }

    /// Discards everything allocated since `mark`.
    pub fn rollback(&mut self, mark: [usize; 2]) {
        for (image, len) in self.images.iter_mut().zip(mark) {
            image.words.truncate(len);
            image.oopmap.truncate(len);
        }
    }

    /// Hands over the class-name table and both images, closed first.
    #[must_use]
    pub fn finish(mut self) -> (Vec<String>, Vec<RegionImage>) {
        let closed = &mut self.images[RegionKind::Closed.index()];
        if closed.words.len() == 1 {
            closed.words.clear();
            closed.oopmap.truncate(0);
        }
        (self.class_names, self.images.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectId;

    fn writer() -> HeapWriter {
        HeapWriter::new(&ArchiveConfig::new().region_capacity(256)).unwrap()
    }

    #[test]
    fn test_closed_sentinel_reserved() {
        let mut w = writer();
        let first = w.allocate(RegionKind::Closed, "A", &[]).unwrap();
        assert_eq!(first.addr, w.image(RegionKind::Closed).dump_base + 8);
        assert!(!w.codec().encode(first.addr).is_null());

        let open = w.allocate(RegionKind::Open, "A", &[]).unwrap();
        assert_eq!(open.addr, w.image(RegionKind::Open).dump_base);
        assert!(!w.codec().encode(open.addr).is_null());
    }

    #[test]
    fn test_layout_and_oopmap() {
        let mut w = writer();
        let a = w
            .allocate(RegionKind::Open, "Pair", &[Slot::Prim(7), Slot::Ref(Some(ObjectId(1))), Slot::NULL])
            .unwrap();
        let b = w.allocate(RegionKind::Open, "Leaf", &[Slot::Prim(9)]).unwrap();
        w.patch_reference(a, 1, Some(b));
        w.patch_reference(a, 2, None);

        let obj = w.object(a).unwrap();
        assert_eq!(obj.class_name, "Pair");
        assert_eq!(obj.words[0], 7);
        assert_eq!(w.resolve(NarrowRef(u32::try_from(obj.words[1]).unwrap())), Some(b));
        assert_eq!(obj.words[2], 0);
        assert!(!obj.is_reference(0));
        assert!(obj.is_reference(1));
        assert!(obj.is_reference(2));

        let image = w.image(RegionKind::Open);
        assert_eq!(image.oopmap.iter_set().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(decode_header(image.words[0]), (0, 3));
        assert_eq!(decode_header(image.words[4]), (1, 1));
    }

    #[test]
    fn test_overflow() {
        let mut w = writer();
        let big = vec![Slot::Prim(0); 31];
        assert!(w.allocate(RegionKind::Open, "Big", &big).is_ok());
        let err = w.allocate(RegionKind::Open, "Small", &[]).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::RegionOverflow {
                kind: RegionKind::Open,
                capacity: 256
            }
        ));
    }

    #[test]
    fn test_rollback_discards_objects() {
        let mut w = writer();
        w.allocate(RegionKind::Open, "Keep", &[Slot::NULL]).unwrap();
        let mark = w.mark();
        let dropped = w.allocate(RegionKind::Open, "Drop", &[Slot::NULL, Slot::NULL]).unwrap();
        w.allocate(RegionKind::Closed, "Drop", &[]).unwrap();
        w.rollback(mark);

        assert!(w.object(dropped).is_none());
        assert_eq!(w.image(RegionKind::Open).words.len(), 2);
        assert_eq!(w.image(RegionKind::Open).oopmap.set_count(), 1);
        assert_eq!(w.image(RegionKind::Closed).words.len(), 1);
        let again = w.allocate(RegionKind::Open, "Next", &[]).unwrap();
        assert_eq!(again, dropped);
    }

    #[test]
    fn test_class_names_deduplicated() {
        let mut w = writer();
        w.allocate(RegionKind::Closed, "A", &[]).unwrap();
        w.allocate(RegionKind::Open, "B", &[]).unwrap();
        w.allocate(RegionKind::Open, "A", &[]).unwrap();
        let (names, images) = w.finish();
        assert_eq!(names, vec!["A".to_owned(), "B".to_owned()]);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].kind, RegionKind::Closed);
    }
}
