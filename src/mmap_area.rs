use std::io;
use std::sync::Arc;

use libc::{
    c_int, c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_PRIVATE, PROT_READ,
    PROT_WRITE,
};
use log::warn;
use thiserror::Error;

/// The anonymous memory mapping backing the UMEM.
///
/// mmap returns page-aligned memory, which is what UMEM registration
/// requires. The mapping is fixed for the lifetime of the area: the pointer
/// is handed to the kernel at registration and must never move.
#[derive(Debug)]
pub struct MmapArea {
    len: usize,
    ptr: *mut c_void,
}

// MmapArea is not Send/Sync by default because of the raw pointer. The
// pointer is private, set once at construction, and the pointed-to memory is
// only ever interpreted through the kernel ring descriptors, so sharing the
// area behind an Arc is sound.
unsafe impl Send for MmapArea {}
unsafe impl Sync for MmapArea {}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("mmap failed: {0}")]
    Mmap(io::Error),
}

/// Configuration options for MmapArea
#[derive(Debug, Default)]
pub struct MmapAreaOptions {
    /// If set to true, the mmap call is passed MAP_HUGETLB
    pub huge_tlb: bool,
}

impl MmapArea {
    /// Map `len` bytes of zeroed, page-aligned anonymous memory.
    pub fn new(len: usize, options: MmapAreaOptions) -> Result<Arc<MmapArea>, MmapError> {
        let mut flags: c_int = MAP_PRIVATE | MAP_ANONYMOUS;

        if options.huge_tlb {
            flags |= MAP_HUGETLB;
        }

        let ptr: *mut c_void;
        unsafe {
            ptr = mmap(std::ptr::null_mut(), len, PROT_READ | PROT_WRITE, flags, -1, 0);
        }

        if ptr == MAP_FAILED {
            return Err(MmapError::Mmap(io::Error::last_os_error()));
        }

        Ok(Arc::new(MmapArea { len, ptr }))
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MmapArea {
    fn drop(&mut self) {
        let r: c_int;

        unsafe {
            r = munmap(self.ptr, self.len);
        }

        if r != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}
