//! Anonymous memory mappings used to host archive heap regions.
//!
//! The archive loader asks for a mapping at the address a region was
//! written for. The OS may place it elsewhere; callers read the granted
//! address back from [`Mmap::addr`] and relocate accordingly. Once a region
//! is final it can be made read-only with [`Mmap::protect_read_only`].

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Alignment an address hint must have to be honored.
///
/// The page size on Unix; the allocation granularity (typically 64KB) on
/// Windows.
pub fn hint_alignment() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a multiple of the page size.
pub fn round_to_page(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// An owned anonymous mapping, released on drop.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Granted base address.
    pub fn addr(&self) -> usize {
        self.inner.ptr() as usize
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has no bytes. Never the case for a
    /// mapping made by [`MmapOptions::map_anon`].
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Views the mapping as bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is owned by `self` and valid for `len` bytes.
        unsafe { std::slice::from_raw_parts(self.inner.ptr(), self.len()) }
    }

    /// Views the mapping as mutable bytes.
    ///
    /// Writing after [`Mmap::protect_read_only`] faults.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: owned, valid for `len` bytes, and `&mut self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.inner.ptr(), self.len()) }
    }

    /// Drops write access to the whole mapping.
    pub fn protect_read_only(&self) -> io::Result<()> {
        // SAFETY: the range is exactly the mapping owned by `self`.
        unsafe { self.inner.protect_read_only() }
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

/// Builder for an anonymous mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    hint: usize,
}

impl MmapOptions {
    /// Options with length 0. A length must be set before mapping.
    pub const fn new() -> Self {
        Self { len: 0, hint: 0 }
    }

    /// Sets the length in bytes.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Asks for the mapping to start at `addr`.
    ///
    /// Advisory only. Hints not aligned to [`hint_alignment`] are dropped.
    pub fn with_hint(mut self, addr: usize) -> Self {
        self.hint = if addr % hint_alignment() == 0 { addr } else { 0 };
        self
    }

    /// Creates a zero-filled read-write mapping.
    ///
    /// # Safety
    ///
    /// The hint must not name memory the caller relies on. The mapping is
    /// never placed with `MAP_FIXED`, but callers should not depend on that.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "mapping length must be non-zero"));
        }
        let inner = unsafe { os::MmapInner::map_anon(self.hint, self.len)? };
        Ok(Mmap { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_page() -> Mmap {
        unsafe { MmapOptions::new().len(page_size()).map_anon() }.expect("failed to map")
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn test_round_to_page() {
        let ps = page_size();
        assert_eq!(round_to_page(1), ps);
        assert_eq!(round_to_page(ps), ps);
        assert_eq!(round_to_page(ps + 1), 2 * ps);
    }

    #[test]
    fn test_map_is_zeroed_and_writable() {
        let mut mmap = map_page();
        assert_eq!(mmap.addr() % page_size(), 0);
        assert!(mmap.as_slice().iter().all(|&b| b == 0));
        mmap.as_mut_slice()[17] = 42;
        assert_eq!(mmap.as_slice()[17], 42);
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = unsafe { MmapOptions::new().map_anon() }.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_unaligned_hint_dropped() {
        let opts = MmapOptions::new().len(page_size()).with_hint(0x1001);
        assert_eq!(opts.hint, 0);
    }

    #[test]
    fn test_protect_read_only_keeps_contents() {
        let mut mmap = map_page();
        mmap.as_mut_slice()[0] = 7;
        mmap.protect_read_only().expect("protect failed");
        assert_eq!(mmap.as_slice()[0], 7);
    }

    #[test]
    fn test_hinted_mapping_is_usable_wherever_it_lands() {
        #[cfg(target_pointer_width = "64")]
        let hint = 0x6100_0000_0000usize;
        #[cfg(target_pointer_width = "32")]
        let hint = 0x4000_0000usize;

        let opts = MmapOptions::new().len(hint_alignment()).with_hint(hint);
        if let Ok(mut mmap) = unsafe { opts.map_anon() } {
            mmap.as_mut_slice()[0] = 99;
            assert_eq!(mmap.as_slice()[0], 99);
        }
    }
}
