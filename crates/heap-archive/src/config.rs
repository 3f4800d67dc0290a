//! Archiving configuration.

use crate::codec::{NarrowCodec, MAX_NARROW_SHIFT};
use crate::error::{ArchiveError, Result};
use crate::region::RegionKind;

/// Default dump-time address of the closed region.
pub const DEFAULT_REQUESTED_BASE: u64 = 0x7_0000_0000;
/// Default narrow reference shift (8-byte object alignment).
pub const DEFAULT_NARROW_SHIFT: u32 = 3;
/// Default capacity of each region in bytes.
pub const DEFAULT_REGION_CAPACITY: usize = 64 << 20;
/// Default average number of records per lookup-table bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 4;

/// Settings for a dump session and for loading its archive.
///
/// # Example
///
/// ```
/// use heap_archive::ArchiveConfig;
///
/// let config = ArchiveConfig::new()
///     .region_capacity(1 << 20)
///     .verify_subgraphs(true)
///     .exclude_class("java/lang/Thread");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Master switch. When off, every entry point is a no-op.
    pub enabled: bool,
    /// Dump-time address of the closed region; the open region follows it
    /// at `requested_base + region_capacity`.
    pub requested_base: u64,
    /// Shift of the archive's narrow references.
    pub narrow_shift: u32,
    /// Maximum size of each region in bytes.
    pub region_capacity: usize,
    /// Re-walk every recorded subgraph and compare it against the live graph.
    pub verify_subgraphs: bool,
    /// Class names whose instances must never be archived.
    pub excluded_classes: Vec<String>,
    /// Average number of records per lookup-table bucket.
    pub bucket_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requested_base: DEFAULT_REQUESTED_BASE,
            narrow_shift: DEFAULT_NARROW_SHIFT,
            region_capacity: DEFAULT_REGION_CAPACITY,
            verify_subgraphs: cfg!(debug_assertions),
            excluded_classes: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }
}

impl ArchiveConfig {
    /// Default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings with archiving switched off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the master switch.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the dump-time base address.
    #[must_use]
    pub const fn requested_base(mut self, base: u64) -> Self {
        self.requested_base = base;
        self
    }

    /// Sets the narrow reference shift.
    #[must_use]
    pub const fn narrow_shift(mut self, shift: u32) -> Self {
        self.narrow_shift = shift;
        self
    }

    /// Sets the per-region capacity.
    #[must_use]
    pub const fn region_capacity(mut self, bytes: usize) -> Self {
        self.region_capacity = bytes;
        self
    }

    /// Turns subgraph verification on or off.
    #[must_use]
    pub const fn verify_subgraphs(mut self, verify: bool) -> Self {
        self.verify_subgraphs = verify;
        self
    }

    /// Excludes a class from archiving.
    #[must_use]
    pub fn exclude_class(mut self, name: impl Into<String>) -> Self {
        self.excluded_classes.push(name.into());
        self
    }

    /// Sets the average bucket size of the lookup table.
    #[must_use]
    pub const fn bucket_size(mut self, size: usize) -> Self {
        self.bucket_size = size;
        self
    }

    /// The codec implied by these settings.
    ///
    /// # Errors
    ///
    /// Fails if the shift is too large or the base is misaligned.
    pub fn codec(&self) -> Result<NarrowCodec> {
        NarrowCodec::new(self.requested_base, self.narrow_shift).ok_or_else(|| {
            ArchiveError::format(format!(
                "base {:#x} / shift {} is not a valid narrow encoding (max shift {MAX_NARROW_SHIFT})",
                self.requested_base, self.narrow_shift
            ))
        })
    }

    /// Dump-time base of a region.
    #[must_use]
    pub const fn region_base(&self, kind: RegionKind) -> u64 {
        match kind {
            RegionKind::Closed => self.requested_base,
            RegionKind::Open => self.requested_base.saturating_add(self.region_capacity as u64),
        }
    }

    /// Checks that both regions are addressable by the codec.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Format`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let codec = self.codec()?;
        if self.region_capacity == 0 || self.region_capacity % 8 != 0 {
            return Err(ArchiveError::format(format!(
                "region capacity {} must be a non-zero multiple of 8",
                self.region_capacity
            )));
        }
        let end = self
            .region_base(RegionKind::Open)
            .saturating_add(self.region_capacity as u64);
        if end > codec.max_address() {
            return Err(ArchiveError::format(format!(
                "regions end at {end:#x}, beyond narrow range {:#x}",
                codec.max_address()
            )));
        }
        if self.bucket_size == 0 {
            return Err(ArchiveError::format("bucket size must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ArchiveConfig::default();
        assert!(config.enabled);
        config.validate().unwrap();
        assert_eq!(config.region_base(RegionKind::Closed), DEFAULT_REQUESTED_BASE);
        assert_eq!(
            config.region_base(RegionKind::Open),
            DEFAULT_REQUESTED_BASE + DEFAULT_REGION_CAPACITY as u64
        );
    }

    #[test]
    fn test_rejects_out_of_range_regions() {
        let config = ArchiveConfig::new().narrow_shift(0).region_capacity(3 << 30);
        assert!(matches!(config.validate(), Err(ArchiveError::Format(_))));
    }

    #[test]
    fn test_rejects_bad_codec_and_capacity() {
        assert!(ArchiveConfig::new().narrow_shift(5).validate().is_err());
        assert!(ArchiveConfig::new().requested_base(0x1001).validate().is_err());
        assert!(ArchiveConfig::new().region_capacity(12).validate().is_err());
        assert!(ArchiveConfig::new().bucket_size(0).validate().is_err());
    }

    #[test]
    fn test_exclusions() {
        let config = ArchiveConfig::disabled().exclude_class("Thread").exclude_class("Socket");
        assert!(!config.enabled);
        assert_eq!(config.excluded_classes, vec!["Thread".to_owned(), "Socket".to_owned()]);
    }
}
