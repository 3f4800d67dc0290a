use std::ffi::c_void;
use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_PROTECTION_FLAGS,
    PAGE_READONLY, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    // SAFETY: `GetSystemInfo` fills the zeroed struct and cannot fail.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// `VirtualAlloc` hints must be aligned to this value (typically 64KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

pub struct MmapInner {
    ptr: *mut c_void,
    len: usize,
}

impl MmapInner {
    /// Commits `len` zeroed read-write bytes at `hint`, or wherever the OS
    /// likes if the hint is zero or taken.
    pub unsafe fn map_anon(hint: usize, len: usize) -> io::Result<Self> {
        let kind = MEM_COMMIT | MEM_RESERVE;
        let mut ptr = ptr::null_mut();
        if hint != 0 {
            // SAFETY: reserving at a hint never replaces an existing range.
            ptr = unsafe { VirtualAlloc(hint as *const c_void, len, kind, PAGE_READWRITE) };
        }
        if ptr.is_null() {
            // SAFETY: as above, with the OS choosing the address.
            ptr = unsafe { VirtualAlloc(ptr::null(), len, kind, PAGE_READWRITE) };
        }
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    /// Switches the whole mapping to `PAGE_READONLY`.
    pub unsafe fn protect_read_only(&self) -> io::Result<()> {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        // SAFETY: the range is exactly this allocation.
        if unsafe { VirtualProtect(self.ptr, self.len, PAGE_READONLY, &mut old) } == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `VirtualAlloc`; MEM_RELEASE takes size 0.
        unsafe {
            VirtualFree(self.ptr, 0, MEM_RELEASE);
        }
    }
}

// SAFETY: the allocation is plain memory owned by this handle.
unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
