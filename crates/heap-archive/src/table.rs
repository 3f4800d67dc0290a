//! Compact, read-only lookup table of archived records.
//!
//! Built once at dump time, loaded as one flat blob at run time. Every
//! internal reference is an offset from the start of the blob, so the blob
//! can live anywhere in memory. The bucket count is chosen when the table is
//! built and stored in its header, and keys are hashed with FNV-1a, which is
//! stable across processes.
//!
//! # Layout
//!
//! All integers little endian, every section 4-byte aligned.
//!
//! ```text
//! header   magic "HSTB" | version u16 | reserved u16 | bucket_count u32 | entry_count u32
//! buckets  (bucket_count + 1) x u32        first entry index of each bucket, then entry_count
//! entries  entry_count x (hash u32, record offset u32)
//! records  name u32 | flags u32 | fields u32 | classes u32
//!          | fields x (offset u32, kind u32, value u64) | classes x name u32
//! strings  len u32 | utf-8 bytes | zero padding
//! ```

use std::collections::HashMap;

use crate::error::{ArchiveError, Result};
use crate::record::ArchivedRecord;
use crate::subgraph::{EntryField, EntryKind};

/// Magic bytes of a table blob.
pub const TABLE_MAGIC: [u8; 4] = *b"HSTB";
/// Current table format version.
pub const TABLE_VERSION: u16 = 1;

const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 8;
const RECORD_HEADER_SIZE: usize = 16;
const FIELD_SIZE: usize = 16;
const FLAG_PARTIAL_PRE_INIT: u32 = 1;

/// 32-bit FNV-1a, the table's key hash.
#[must_use]
pub fn hash_class_name(name: &str) -> u32 {
    name.bytes().fold(0x811c_9dc5, |h, b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193))
}

fn record_size(record: &ArchivedRecord) -> usize {
    RECORD_HEADER_SIZE + record.entry_fields.len() * FIELD_SIZE + record.object_classes.len() * 4
}

fn to_u32(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| ArchiveError::format(format!("table offset {v} overflows u32")))
}

// ============================================================================
// Writer
// ============================================================================

/// Collects records and serializes them into a table blob.
#[derive(Debug)]
pub struct CompactTableWriter {
    bucket_size: usize,
    records: Vec<ArchivedRecord>,
}

impl CompactTableWriter {
    /// Creates a writer aiming for `bucket_size` records per bucket.
    #[must_use]
    pub fn new(bucket_size: usize) -> Self {
        Self {
            bucket_size: bucket_size.max(1),
            records: Vec::new(),
        }
    }

    /// Adds the record of `class_name`. Returns `false`, leaving the table
    /// unchanged, if the class already has a record.
    pub fn insert(&mut self, class_name: &str, record: &ArchivedRecord) -> bool {
        if self.records.iter().any(|r| r.class_name == class_name) {
            return false;
        }
        debug_assert_eq!(record.class_name, class_name, "record keyed under another class");
        self.records.push(ArchivedRecord {
            class_name: class_name.to_owned(),
            ..record.clone()
        });
        true
    }

    /// Number of records inserted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no record was inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serializes the table.
    ///
    /// The output depends only on the set of records, not on insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Format`] if an offset or count does not fit
    /// in 32 bits.
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        let entry_count = self.records.len();
        let bucket_count = entry_count.div_ceil(self.bucket_size).max(1);
        let bucket_of = |name: &str| hash_class_name(name) as usize % bucket_count;

        self.records.sort_by(|a, b| {
            (bucket_of(a.class_name.as_str()), hash_class_name(&a.class_name), &a.class_name).cmp(&(
                bucket_of(b.class_name.as_str()),
                hash_class_name(&b.class_name),
                &b.class_name,
            ))
        });

        let buckets_start = HEADER_SIZE;
        let entries_start = buckets_start + (bucket_count + 1) * 4;
        let records_start = entries_start + entry_count * ENTRY_SIZE;
        let strings_start = records_start + self.records.iter().map(record_size).sum::<usize>();

        let mut strings = StringPool::new(strings_start);
        let mut out = Vec::with_capacity(strings_start);

        out.extend_from_slice(&TABLE_MAGIC);
        out.extend_from_slice(&TABLE_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&to_u32(bucket_count)?.to_le_bytes());
        out.extend_from_slice(&to_u32(entry_count)?.to_le_bytes());

        let mut next = 0;
        for bucket in 0..bucket_count {
            out.extend_from_slice(&to_u32(next)?.to_le_bytes());
            while next < entry_count && bucket_of(self.records[next].class_name.as_str()) == bucket {
                next += 1;
            }
        }
        out.extend_from_slice(&to_u32(entry_count)?.to_le_bytes());

        let mut offset = records_start;
        for record in &self.records {
            out.extend_from_slice(&hash_class_name(&record.class_name).to_le_bytes());
            out.extend_from_slice(&to_u32(offset)?.to_le_bytes());
            offset += record_size(record);
        }

        for record in &self.records {
            let flags = if record.is_partial_pre_init { FLAG_PARTIAL_PRE_INIT } else { 0 };
            out.extend_from_slice(&strings.intern(&record.class_name)?.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&to_u32(record.entry_fields.len())?.to_le_bytes());
            out.extend_from_slice(&to_u32(record.object_classes.len())?.to_le_bytes());
            for field in record.entry_fields.iter() {
                out.extend_from_slice(&field.offset.to_le_bytes());
                out.extend_from_slice(&(field.kind as u32).to_le_bytes());
                out.extend_from_slice(&field.value.to_le_bytes());
            }
            for class in record.object_classes.iter() {
                out.extend_from_slice(&strings.intern(class)?.to_le_bytes());
            }
        }

        debug_assert_eq!(out.len(), strings_start);
        out.extend_from_slice(&strings.bytes);
        to_u32(out.len())?;
        Ok(out)
    }
}

/// Deduplicated string storage for the tail of the blob.
struct StringPool {
    base: usize,
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringPool {
    fn new(base: usize) -> Self {
        Self {
            base,
            bytes: Vec::new(),
            offsets: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> Result<u32> {
        if let Some(&off) = self.offsets.get(s) {
            return Ok(off);
        }
        let off = to_u32(self.base + self.bytes.len())?;
        self.bytes.extend_from_slice(&to_u32(s.len())?.to_le_bytes());
        self.bytes.extend_from_slice(s.as_bytes());
        while self.bytes.len() % 4 != 0 {
            self.bytes.push(0);
        }
        self.offsets.insert(s.to_owned(), off);
        Ok(off)
    }
}

// ============================================================================
// Loaded table
// ============================================================================

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let lo = read_u32(bytes, at)?;
    let hi = read_u32(bytes, at.checked_add(4)?)?;
    Some(u64::from(lo) | (u64::from(hi) << 32))
}

fn read_str_bytes(bytes: &[u8], at: usize) -> Option<&[u8]> {
    let len = read_u32(bytes, at)? as usize;
    let start = at.checked_add(4)?;
    bytes.get(start..start.checked_add(len)?)
}

/// A loaded table. Immutable and safe to share between threads.
#[derive(Debug, Clone)]
pub struct CompactTable {
    bytes: Box<[u8]>,
    bucket_count: usize,
    entry_count: usize,
}

impl CompactTable {
    /// Validates a blob and takes ownership of it.
    ///
    /// The whole blob is checked here, so lookups never fail on malformed
    /// data afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Format`] if anything is out of bounds,
    /// mis-ordered or not valid UTF-8.
    pub fn load(bytes: impl Into<Box<[u8]>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < HEADER_SIZE || bytes[0..4] != TABLE_MAGIC {
            return Err(ArchiveError::format("bad table magic"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != TABLE_VERSION {
            return Err(ArchiveError::format(format!("unsupported table version {version}")));
        }
        let truncated = || ArchiveError::format("truncated table");
        let bucket_count = read_u32(&bytes, 8).ok_or_else(truncated)? as usize;
        let entry_count = read_u32(&bytes, 12).ok_or_else(truncated)? as usize;
        if bucket_count == 0 {
            return Err(ArchiveError::format("table has no buckets"));
        }

        let table = Self {
            bytes,
            bucket_count,
            entry_count,
        };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        let bad = |what: &str| ArchiveError::format(format!("corrupt table: {what}"));
        let entries_start = HEADER_SIZE + (self.bucket_count + 1) * 4;
        if entries_start + self.entry_count * ENTRY_SIZE > self.bytes.len() {
            return Err(bad("entries out of bounds"));
        }

        let mut prev = 0;
        for bucket in 0..=self.bucket_count {
            let start = self.bucket_start(bucket).ok_or_else(|| bad("bucket array"))?;
            if start < prev || start > self.entry_count {
                return Err(bad("bucket starts not monotonic"));
            }
            prev = start;
        }
        if prev != self.entry_count {
            return Err(bad("bucket array does not cover all entries"));
        }

        for i in 0..self.entry_count {
            let (hash, offset) = self.entry(i).ok_or_else(|| bad("entry"))?;
            let bucket = (hash as usize) % self.bucket_count;
            let (lo, hi) = self.bucket_range(bucket);
            if !(lo..hi).contains(&i) {
                return Err(bad("entry in wrong bucket"));
            }
            let view = RecordView {
                bytes: &self.bytes,
                offset,
            };
            let name = view.checked_class_name().ok_or_else(|| bad("record name"))?;
            if hash_class_name(name) != hash {
                return Err(bad("record hash mismatch"));
            }
            let fields = view.checked_len(8).ok_or_else(|| bad("record field count"))?;
            let classes = view.checked_len(12).ok_or_else(|| bad("record class count"))?;
            let end = offset + RECORD_HEADER_SIZE + fields * FIELD_SIZE + classes * 4;
            if end > self.bytes.len() {
                return Err(bad("record out of bounds"));
            }
            for f in 0..fields {
                let kind = read_u32(&self.bytes, view.field_at(f) + 4).ok_or_else(|| bad("field"))?;
                if EntryKind::from_u32(kind).is_none() {
                    return Err(bad("unknown entry kind"));
                }
            }
            for c in 0..classes {
                let at = read_u32(&self.bytes, view.class_at(c)).ok_or_else(|| bad("class ref"))?;
                read_str_bytes(&self.bytes, at as usize)
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .ok_or_else(|| bad("class name"))?;
            }
        }
        Ok(())
    }

    fn bucket_start(&self, bucket: usize) -> Option<usize> {
        read_u32(&self.bytes, HEADER_SIZE + bucket * 4).map(|v| v as usize)
    }

    fn bucket_range(&self, bucket: usize) -> (usize, usize) {
        (
            self.bucket_start(bucket).unwrap_or(0),
            self.bucket_start(bucket + 1).unwrap_or(0),
        )
    }

    fn entry(&self, index: usize) -> Option<(u32, usize)> {
        let at = HEADER_SIZE + (self.bucket_count + 1) * 4 + index * ENTRY_SIZE;
        Some((read_u32(&self.bytes, at)?, read_u32(&self.bytes, at + 4)? as usize))
    }

    /// Finds the record of `class_name`. Allocation-free.
    #[must_use]
    pub fn lookup(&self, class_name: &str) -> Option<RecordView<'_>> {
        let hash = hash_class_name(class_name);
        let (lo, hi) = self.bucket_range(hash as usize % self.bucket_count);
        (lo..hi)
            .filter_map(|i| self.entry(i))
            .filter(|&(h, _)| h == hash)
            .map(|(_, offset)| RecordView {
                bytes: &self.bytes,
                offset,
            })
            .find(|view| view.name_bytes() == Some(class_name.as_bytes()))
    }

    /// All records in table order.
    pub fn iter(&self) -> impl Iterator<Item = RecordView<'_>> {
        (0..self.entry_count)
            .filter_map(move |i| self.entry(i))
            .map(move |(_, offset)| RecordView {
                bytes: &self.bytes,
                offset,
            })
    }

    /// Number of records.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entry_count
    }

    /// Returns `true` if the table holds no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Number of buckets fixed at build time.
    #[must_use]
    pub const fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// The serialized blob.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A record inside a loaded table.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> RecordView<'a> {
    fn u32_at(&self, rel: usize) -> u32 {
        read_u32(self.bytes, self.offset + rel).unwrap_or(0)
    }

    fn checked_len(&self, rel: usize) -> Option<usize> {
        read_u32(self.bytes, self.offset + rel).map(|v| v as usize)
    }

    fn field_at(&self, index: usize) -> usize {
        self.offset + RECORD_HEADER_SIZE + index * FIELD_SIZE
    }

    fn class_at(&self, index: usize) -> usize {
        self.field_at(self.num_entry_fields()) + index * 4
    }

    fn name_bytes(&self) -> Option<&'a [u8]> {
        read_str_bytes(self.bytes, read_u32(self.bytes, self.offset)? as usize)
    }

    fn checked_class_name(&self) -> Option<&'a str> {
        std::str::from_utf8(self.name_bytes()?).ok()
    }

    /// Root class name.
    #[must_use]
    pub fn class_name(&self) -> &'a str {
        self.checked_class_name().unwrap_or_default()
    }

    /// Whether only some static fields are pre-initialized.
    #[must_use]
    pub fn is_partial_pre_init(&self) -> bool {
        self.u32_at(4) & FLAG_PARTIAL_PRE_INIT != 0
    }

    /// Number of entry fields.
    #[must_use]
    pub fn num_entry_fields(&self) -> usize {
        self.u32_at(8) as usize
    }

    /// Number of object classes.
    #[must_use]
    pub fn num_object_classes(&self) -> usize {
        self.u32_at(12) as usize
    }

    /// Entry fields in recording order.
    pub fn entry_fields(&self) -> impl Iterator<Item = EntryField> + 'a {
        let view = *self;
        (0..self.num_entry_fields()).map(move |i| {
            let at = view.field_at(i);
            EntryField {
                offset: read_u32(view.bytes, at).unwrap_or(0),
                kind: read_u32(view.bytes, at + 4)
                    .and_then(EntryKind::from_u32)
                    .unwrap_or(EntryKind::Primitive),
                value: read_u64(view.bytes, at + 8).unwrap_or(0),
            }
        })
    }

    /// Names of classes to resolve before use.
    pub fn object_classes(&self) -> impl Iterator<Item = &'a str> + 'a {
        let view = *self;
        (0..self.num_object_classes()).map(move |i| {
            read_u32(view.bytes, view.class_at(i))
                .and_then(|at| read_str_bytes(view.bytes, at as usize))
                .and_then(|b| std::str::from_utf8(b).ok())
                .unwrap_or_default()
        })
    }

    /// Copies the record out of the table.
    #[must_use]
    pub fn to_record(&self) -> ArchivedRecord {
        ArchivedRecord {
            class_name: self.class_name().to_owned(),
            entry_fields: self.entry_fields().collect(),
            object_classes: self.object_classes().map(str::to_owned).collect(),
            is_partial_pre_init: self.is_partial_pre_init(),
        }
    }
}
