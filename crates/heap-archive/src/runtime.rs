//! Loading an archive.
//!
//! [`RuntimeArchive::map`] loads the lookup table and copies each non-empty
//! region into memory from a [`RegionMapper`]. [`RuntimeArchive::fixup_mapped_regions`]
//! then turns every reference into a native address. Only after that do
//! [`RuntimeArchive::initialize_from_archive`] calls hand out objects.
//!
//! A class that cannot be served from the archive, for whatever reason, gets
//! [`InitOutcome::NotFound`] and runs its ordinary initializer instead.

use crate::archive::HeapArchive;
use crate::codec::{NarrowCodec, NarrowRef};
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::fixup::{FixupStats, RegionFixup, RelocationMap};
use crate::region::{MappedRegion, RegionKind, RegionMapper, RegionState, WORD_SIZE};
use crate::subgraph::EntryKind;
use crate::table::CompactTable;
use crate::tracing::internal::{log_lookup_miss, trace_phase};
use crate::tracing::ArchivePhase;
use crate::writer::decode_header;

/// A value read from the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivedValue {
    /// Null reference.
    Null,
    /// Live address of an archived object.
    Object(u64),
    /// Raw primitive bits.
    Primitive(u64),
}

/// The loading process's class system, as seen by the archive.
pub trait ClassLoaderHooks {
    /// Makes sure the named class is loaded. Returns `false` if it cannot be.
    fn resolve_class(&mut self, class_name: &str) -> bool;

    /// Stores an archived value into a static field of a resolved class.
    fn set_static_field(&mut self, archive: &RuntimeArchive, class_name: &str, offset: u32, value: ArchivedValue);
}

/// Result of [`RuntimeArchive::initialize_from_archive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Statics were populated from the archive.
    Initialized {
        /// Only some statics were archived; the class must initialize the
        /// rest itself.
        partial: bool,
    },
    /// Nothing was applied.
    NotFound,
}

/// A read-only view of one archived object in a fixed-up region.
#[derive(Debug, Clone, Copy)]
pub struct ArchivedObject<'a> {
    region: &'a MappedRegion,
    class_names: &'a [String],
    addr: u64,
    first_word: usize,
    class_index: u32,
    slot_count: usize,
}

impl<'a> ArchivedObject<'a> {
    /// Live address of the object.
    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    /// Region holding the object.
    #[must_use]
    pub const fn region_kind(&self) -> RegionKind {
        self.region.kind()
    }

    /// Name of the object's class.
    #[must_use]
    pub fn class_name(&self) -> &'a str {
        self.class_names
            .get(self.class_index as usize)
            .map_or("", String::as_str)
    }

    /// Number of slots.
    #[must_use]
    pub const fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Reads slot `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<ArchivedValue> {
        if index >= self.slot_count {
            return None;
        }
        let at = self.first_word + index;
        let word = self.region.word(at)?;
        Some(if !self.region.oopmap().is_set(at) {
            ArchivedValue::Primitive(word)
        } else if word == 0 {
            ArchivedValue::Null
        } else {
            ArchivedValue::Object(word)
        })
    }

    /// All slots in order.
    pub fn slots(&self) -> impl Iterator<Item = ArchivedValue> + 'a {
        let this = *self;
        (0..self.slot_count).filter_map(move |i| this.slot(i))
    }
}

/// A mapped, loadable archive.
#[derive(Debug)]
pub struct RuntimeArchive {
    enabled: bool,
    codec: NarrowCodec,
    class_names: Vec<String>,
    table: CompactTable,
    regions: [Option<MappedRegion>; 2],
    relocations: RelocationMap,
}

impl RuntimeArchive {
    /// Loads the table and maps every non-empty region.
    ///
    /// With archiving disabled nothing is mapped and every lookup misses.
    ///
    /// # Errors
    ///
    /// Fails if the table is malformed or a region cannot be mapped. A
    /// region that failed to map is never fixed up or used.
    pub fn map(archive: HeapArchive, config: &ArchiveConfig, mapper: &dyn RegionMapper) -> Result<Self> {
        let _span = trace_phase(ArchivePhase::Map);
        let HeapArchive {
            codec,
            class_names,
            table,
            regions: images,
        } = archive;
        let table = CompactTable::load(table)?;

        let mut regions = [None, None];
        if config.enabled {
            for image in images.iter().filter(|image| !image.words.is_empty()) {
                regions[image.kind.index()] = Some(MappedRegion::map(image, mapper)?);
            }
        }
        let relocations = RelocationMap::from_regions(regions.iter().flatten());
        Ok(Self {
            enabled: config.enabled,
            codec,
            class_names,
            table,
            regions,
            relocations,
        })
    }

    /// The lookup table.
    #[must_use]
    pub const fn table(&self) -> &CompactTable {
        &self.table
    }

    /// The codec references were written with.
    #[must_use]
    pub const fn codec(&self) -> NarrowCodec {
        self.codec
    }

    /// The mapped region of `kind`, if any.
    #[must_use]
    pub fn region(&self, kind: RegionKind) -> Option<&MappedRegion> {
        self.regions[kind.index()].as_ref()
    }

    /// State of region `kind`. Regions that were empty are never mapped.
    #[must_use]
    pub fn region_state(&self, kind: RegionKind) -> RegionState {
        self.region(kind).map_or(RegionState::Unmapped, MappedRegion::state)
    }

    /// Returns `true` if objects may be handed out: archiving is enabled
    /// and every mapped region is fixed up.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.enabled && self.regions.iter().flatten().all(MappedRegion::is_fixed_up)
    }

    /// Fixes up every mapped region that is not fixed up yet, closed first.
    ///
    /// A region that failed is left `Mapped` and is retried by the next
    /// call; regions already fixed up are skipped.
    ///
    /// # Errors
    ///
    /// Stops at the first region that fails; see [`RegionFixup::fixup`].
    /// Fails with [`ArchiveError::AlreadyFixedUp`] once every mapped region
    /// is fixed up.
    pub fn fixup_mapped_regions(&mut self) -> Result<FixupStats> {
        let _span = trace_phase(ArchivePhase::Fixup);
        let mut mapped = self.regions.iter().flatten().peekable();
        if let Some(first) = mapped.peek().map(|r| r.kind()) {
            if mapped.all(MappedRegion::is_fixed_up) {
                return Err(ArchiveError::AlreadyFixedUp(first));
            }
        }
        let fixup = RegionFixup::new(self.codec, &self.relocations);
        let mut total = FixupStats::default();
        for region in self.regions.iter_mut().flatten().filter(|r| !r.is_fixed_up()) {
            total += fixup.fixup(region)?;
        }
        Ok(total)
    }

    /// Views the object at live address `addr`. Only fixed-up regions are
    /// readable.
    #[must_use]
    pub fn object_at(&self, addr: u64) -> Option<ArchivedObject<'_>> {
        let region = self
            .regions
            .iter()
            .flatten()
            .find(|r| r.contains_live_addr(addr))?;
        if !region.is_fixed_up() || (addr - region.live_base()) % WORD_SIZE as u64 != 0 {
            return None;
        }
        let header_at = usize::try_from((addr - region.live_base()) / WORD_SIZE as u64).ok()?;
        let (class_index, slot_count) = decode_header(region.word(header_at)?);
        let slot_count = slot_count as usize;
        if header_at + 1 + slot_count > region.len_words() || class_index as usize >= self.class_names.len() {
            return None;
        }
        Some(ArchivedObject {
            region,
            class_names: &self.class_names,
            addr,
            first_word: header_at + 1,
            class_index,
            slot_count,
        })
    }

    fn decode_entry(&self, kind: EntryKind, value: u64) -> Option<ArchivedValue> {
        let Some(region_kind) = kind.region() else {
            return Some(ArchivedValue::Primitive(value));
        };
        let narrow = NarrowRef(u32::try_from(value).ok()?);
        if narrow.is_null() {
            return Some(ArchivedValue::Null);
        }
        let dump_addr = self.codec.decode(narrow);
        if self.relocations.kind_of(dump_addr) != Some(region_kind) {
            return None;
        }
        let live = self.relocations.relocate(dump_addr)?;
        self.object_at(live).map(|obj| ArchivedValue::Object(obj.addr()))
    }

    /// Populates the statics of `class_name` from its archived record.
    ///
    /// Every class named by the record is resolved and every entry decoded
    /// before the first static is written; if any step fails nothing is
    /// applied and the class gets [`InitOutcome::NotFound`].
    pub fn initialize_from_archive(&self, class_name: &str, hooks: &mut dyn ClassLoaderHooks) -> InitOutcome {
        let miss = |reason: &str| {
            log_lookup_miss(class_name, reason);
            InitOutcome::NotFound
        };
        if !self.is_usable() {
            return miss("archive not usable");
        }
        let Some(record) = self.table.lookup(class_name) else {
            return miss("no record");
        };
        if let Some(unresolved) = record.object_classes().find(|c| !hooks.resolve_class(c)) {
            return miss(&ArchiveError::UnresolvedClass(unresolved.to_owned()).to_string());
        }

        let mut values = Vec::with_capacity(record.num_entry_fields());
        for field in record.entry_fields() {
            match self.decode_entry(field.kind, field.value) {
                Some(value) => values.push((field.offset, value)),
                None => return miss("entry does not decode into a mapped region"),
            }
        }
        for (offset, value) in values {
            hooks.set_static_field(self, class_name, offset, value);
        }
        InitOutcome::Initialized {
            partial: record.is_partial_pre_init(),
        }
    }
}
