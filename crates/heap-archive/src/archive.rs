//! The persisted archive.
//!
//! # Layout
//!
//! Little endian throughout. Sections follow each other without padding.
//!
//! ```text
//! header    magic "HSAR" | version u16 | region count u16 | codec base u64 | codec shift u32
//! classes   count u32 | count x (len u32, utf-8 bytes)
//! table     len u32 | table blob
//! regions   region count x (kind u8 | dump base u64 | word count u64 | words
//!                           | bitmap words u64 x ceil(word count / 64))
//! ```
//!
//! The table, the regions and their bitmaps are always written and read
//! together.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::bitmap::RefBitmap;
use crate::codec::NarrowCodec;
use crate::error::{ArchiveError, Result};
use crate::region::{RegionImage, RegionKind};
use crate::table::CompactTable;

/// Magic bytes identifying an archive file.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"HSAR";
/// Current archive format version.
pub const ARCHIVE_VERSION: u16 = 1;

/// Upper bound on any single length read from an archive, in elements.
const MAX_SECTION_LEN: u64 = 1 << 32;

/// Everything a dump produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapArchive {
    /// Codec the regions' narrow references were written with.
    pub codec: NarrowCodec,
    /// Class names indexed by the class index of object headers.
    pub class_names: Vec<String>,
    /// Serialized [`CompactTable`].
    pub table: Vec<u8>,
    /// Region images, closed first.
    pub regions: Vec<RegionImage>,
}

impl HeapArchive {
    /// Loads the lookup table.
    ///
    /// # Errors
    ///
    /// See [`CompactTable::load`].
    pub fn table(&self) -> Result<CompactTable> {
        CompactTable::load(self.table.clone())
    }

    /// The image of `kind`.
    #[must_use]
    pub fn region(&self, kind: RegionKind) -> Option<&RegionImage> {
        self.regions.iter().find(|r| r.kind == kind)
    }

    /// Serializes the archive.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from `out`.
    pub fn write_to<W: Write>(&self, mut out: W) -> Result<()> {
        let region_count = u16::try_from(self.regions.len())
            .map_err(|_| ArchiveError::format("too many regions"))?;
        out.write_all(&ARCHIVE_MAGIC)?;
        out.write_all(&ARCHIVE_VERSION.to_le_bytes())?;
        out.write_all(&region_count.to_le_bytes())?;
        out.write_all(&self.codec.base().to_le_bytes())?;
        out.write_all(&self.codec.shift().to_le_bytes())?;

        write_len(&mut out, self.class_names.len())?;
        for name in &self.class_names {
            write_len(&mut out, name.len())?;
            out.write_all(name.as_bytes())?;
        }

        write_len(&mut out, self.table.len())?;
        out.write_all(&self.table)?;

        for region in &self.regions {
            out.write_all(&[region.kind as u8])?;
            out.write_all(&region.dump_base.to_le_bytes())?;
            out.write_all(&(region.words.len() as u64).to_le_bytes())?;
            for word in &region.words {
                out.write_all(&word.to_le_bytes())?;
            }
            for word in region.oopmap.as_words() {
                out.write_all(&word.to_le_bytes())?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Reads an archive written by [`HeapArchive::write_to`].
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Format`] for bad magic, an unsupported
    /// version, truncated input or inconsistent sections, and
    /// [`ArchiveError::Io`] for other read failures.
    pub fn read_from<R: Read>(mut input: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact(&mut input, &mut magic)?;
        if magic != ARCHIVE_MAGIC {
            return Err(ArchiveError::format("bad archive magic"));
        }
        let version = read_u16(&mut input)?;
        if version != ARCHIVE_VERSION {
            return Err(ArchiveError::format(format!("unsupported archive version {version}")));
        }
        let region_count = read_u16(&mut input)?;
        let base = read_u64(&mut input)?;
        let shift = read_u32(&mut input)?;
        let codec = NarrowCodec::new(base, shift)
            .ok_or_else(|| ArchiveError::format(format!("invalid codec base {base:#x} shift {shift}")))?;

        let class_count = read_len(&mut input)?;
        let mut class_names = Vec::with_capacity(class_count.min(1024));
        for _ in 0..class_count {
            let len = read_len(&mut input)?;
            let bytes = read_vec(&mut input, len)?;
            let name = String::from_utf8(bytes).map_err(|_| ArchiveError::format("class name is not utf-8"))?;
            class_names.push(name);
        }

        let table_len = read_len(&mut input)?;
        let table = read_vec(&mut input, table_len)?;

        let mut regions: Vec<RegionImage> = Vec::with_capacity(usize::from(region_count));
        for _ in 0..region_count {
            let mut kind = [0u8; 1];
            read_exact(&mut input, &mut kind)?;
            let kind =
                RegionKind::from_u8(kind[0]).ok_or_else(|| ArchiveError::format("unknown region kind"))?;
            if regions.iter().any(|r| r.kind == kind) {
                return Err(ArchiveError::format(format!("duplicate {kind} region")));
            }
            let dump_base = read_u64(&mut input)?;
            let word_count = read_u64(&mut input)?;
            if word_count > MAX_SECTION_LEN {
                return Err(ArchiveError::format("region too large"));
            }
            let word_count = usize::try_from(word_count).map_err(|_| ArchiveError::format("region too large"))?;
            let words = read_words(&mut input, word_count)?;
            let bitmap_words = read_words(&mut input, word_count.div_ceil(64))?;
            let oopmap = RefBitmap::from_words(bitmap_words, word_count)
                .ok_or_else(|| ArchiveError::format(format!("{kind} region bitmap is inconsistent")))?;
            regions.push(RegionImage {
                kind,
                dump_base,
                words,
                oopmap,
            });
        }
        regions.sort_by_key(|r| r.kind);

        Ok(Self {
            codec,
            class_names,
            table,
            regions,
        })
    }

    /// Writes the archive to a file.
    ///
    /// # Errors
    ///
    /// Propagates file creation and write errors.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.write_to(BufWriter::new(File::create(path)?))
    }

    /// Reads an archive from a file.
    ///
    /// # Errors
    ///
    /// See [`HeapArchive::read_from`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::read_from(BufReader::new(File::open(path)?))
    }
}

fn write_len<W: Write>(out: &mut W, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| ArchiveError::format("section too large"))?;
    out.write_all(&len.to_le_bytes())?;
    Ok(())
}

fn read_exact<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ArchiveError::format("truncated archive"),
        _ => ArchiveError::Io(e),
    })
}

fn read_u16<R: Read>(input: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(input, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(input, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(input, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_len<R: Read>(input: &mut R) -> Result<usize> {
    usize::try_from(read_u32(input)?).map_err(|_| ArchiveError::format("section too large"))
}

fn read_vec<R: Read>(input: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let read = input.take(len as u64).read_to_end(&mut bytes)?;
    if read != len {
        return Err(ArchiveError::format("truncated archive"));
    }
    Ok(bytes)
}

fn read_words<R: Read>(input: &mut R, count: usize) -> Result<Vec<u64>> {
    let bytes = read_vec(input, count * 8)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}
