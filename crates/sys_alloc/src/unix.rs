use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: `sysconf` has no preconditions.
            let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let size = usize::try_from(queried).unwrap_or(4096);
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Maps `len` zeroed read-write bytes, near `hint` when it is non-zero.
    ///
    /// Without `MAP_FIXED` the kernel treats the hint as advisory and never
    /// clobbers an existing mapping.
    pub unsafe fn map_anon(hint: usize, len: usize) -> io::Result<Self> {
        let addr = if hint == 0 {
            ptr::null_mut()
        } else {
            hint as *mut libc::c_void
        };
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        // SAFETY: anonymous private mapping without MAP_FIXED.
        let ptr = unsafe { libc::mmap(addr, len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    /// Switches the whole mapping to `PROT_READ`.
    pub unsafe fn protect_read_only(&self) -> io::Result<()> {
        // SAFETY: the range is exactly this mapping.
        let rc = unsafe { libc::mprotect(self.ptr, self.len, libc::PROT_READ) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful `mmap` owned by `self`.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

// SAFETY: the mapping is plain memory owned by this handle.
unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
