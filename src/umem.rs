use std::io;
use std::sync::Arc;

use libbpf_sys::{
    _xsk_prod_nb_free, _xsk_ring_cons__comp_addr, _xsk_ring_cons__peek, _xsk_ring_cons__release,
    _xsk_ring_prod__fill_addr, _xsk_ring_prod__reserve, _xsk_ring_prod__submit, xsk_ring_cons,
    xsk_ring_prod, xsk_umem, xsk_umem__create, xsk_umem__delete, xsk_umem_config,
    XSK_UMEM__DEFAULT_FRAME_HEADROOM,
};
use thiserror::Error;

use crate::mmap_area::MmapArea;
use crate::util;
use crate::FRAME_SIZE;

/// The UMEM is the region of memory shared between userspace and the NIC.
/// Frames within it hold packet payloads; the Fill and Completion rings move
/// frame ownership back and forth across the kernel boundary.
#[derive(Debug)]
pub struct UmemRegion {
    area: Arc<MmapArea>,
    umem: *mut xsk_umem,
}

// The raw UMEM handle is only touched at creation and deletion; between
// those points the kernel owns it. Arc-sharing the region with the socket
// is sound.
unsafe impl Send for UmemRegion {}
unsafe impl Sync for UmemRegion {}

/// Producer ring carrying empty frame addresses to the kernel, which writes
/// received packets into them.
#[derive(Debug)]
pub struct FillRing {
    umem: Arc<UmemRegion>,
    fq: Box<xsk_ring_prod>,
    size: u32,
}

/// Consumer ring carrying the addresses of transmitted frames back from the
/// kernel once it is done with them.
#[derive(Debug)]
pub struct CompletionRing {
    umem: Arc<UmemRegion>,
    cq: Box<xsk_ring_cons>,
    size: u32,
}

#[derive(Debug, Error)]
pub enum UmemError {
    #[error("umem create failed: {0}")]
    Create(io::Error),
    #[error("umem ring size not a power of two")]
    RingNotPowerOfTwo,
    #[error("buffer of {0} bytes is not a whole number of {FRAME_SIZE}-byte frames")]
    BufferNotFrameAligned(usize),
}

impl UmemRegion {
    /// Register `area` as a UMEM with the kernel. Returns the shared region
    /// plus the two ring handles; both rings start empty.
    ///
    /// The ring handles each hold an Arc back to the region, so the region
    /// outlives every ring and socket built over it.
    pub fn new(
        area: Arc<MmapArea>,
        fill_size: u32,
        comp_size: u32,
    ) -> Result<(Arc<UmemRegion>, FillRing, CompletionRing), UmemError> {
        // Ring sizes must be powers of two.
        // https://www.kernel.org/doc/html/latest/networking/af_xdp.html
        if !util::is_pow_of_two(fill_size) || !util::is_pow_of_two(comp_size) {
            return Err(UmemError::RingNotPowerOfTwo);
        }

        if area.len() == 0 || area.len() % FRAME_SIZE as usize != 0 {
            return Err(UmemError::BufferNotFrameAligned(area.len()));
        }

        let cfg = xsk_umem_config {
            fill_size,
            comp_size,
            frame_size: FRAME_SIZE,
            frame_headroom: XSK_UMEM__DEFAULT_FRAME_HEADROOM,
            flags: 0,
        };

        // The rings live on the heap since the kernel keeps pointers to them.
        let mut fq: Box<xsk_ring_prod> = Default::default();
        let mut cq: Box<xsk_ring_cons> = Default::default();

        // Double indirection in the C function
        let mut umem: *mut xsk_umem = std::ptr::null_mut();

        let ret: std::os::raw::c_int;
        unsafe {
            ret = xsk_umem__create(
                &mut umem,
                area.as_ptr(),
                area.len() as u64,
                fq.as_mut(),
                cq.as_mut(),
                &cfg,
            );
        }

        if ret != 0 {
            return Err(UmemError::Create(io::Error::from_raw_os_error(-ret)));
        }

        let region = Arc::new(UmemRegion { area, umem });

        let fill = FillRing {
            umem: region.clone(),
            fq,
            size: fill_size,
        };
        let comp = CompletionRing {
            umem: region.clone(),
            cq,
            size: comp_size,
        };

        Ok((region, fill, comp))
    }

    pub(crate) fn raw(&self) -> *mut xsk_umem {
        self.umem
    }

    pub fn area(&self) -> &Arc<MmapArea> {
        &self.area
    }
}

impl Drop for UmemRegion {
    fn drop(&mut self) {
        unsafe {
            xsk_umem__delete(self.umem);
        }
    }
}

impl FillRing {
    /// Reserve up to `n` slots. Returns the count actually reserved and the
    /// cursor of the first slot. libbpf reservations are all-or-nothing, so
    /// the count is either `n` or 0.
    #[inline]
    pub fn reserve(&mut self, n: u32) -> (u32, u32) {
        let mut idx: u32 = 0;
        let got: u32;

        unsafe {
            got = _xsk_ring_prod__reserve(self.fq.as_mut(), n as u64, &mut idx) as u32;
        }

        (got, idx)
    }

    /// Write a frame address into a reserved slot.
    #[inline]
    pub fn set(&mut self, idx: u32, addr: u64) {
        unsafe {
            *_xsk_ring_prod__fill_addr(self.fq.as_mut(), idx) = addr;
        }
    }

    /// Publish `n` previously reserved slots to the kernel.
    #[inline]
    pub fn submit(&mut self, n: u32) {
        unsafe {
            _xsk_ring_prod__submit(self.fq.as_mut(), n as u64);
        }
    }

    /// Slots the kernel has already consumed and we may reserve again.
    #[inline]
    pub fn free_slots(&mut self) -> u32 {
        unsafe { _xsk_prod_nb_free(self.fq.as_mut(), self.size) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn umem(&self) -> &Arc<UmemRegion> {
        &self.umem
    }
}

impl CompletionRing {
    /// Peek up to `max` completed entries. Returns the count available and
    /// the cursor of the first one.
    #[inline]
    pub fn peek(&mut self, max: u32) -> (u32, u32) {
        let mut idx: u32 = 0;
        let got: u32;

        unsafe {
            got = _xsk_ring_cons__peek(self.cq.as_mut(), max as u64, &mut idx) as u32;
        }

        (got, idx)
    }

    /// Frame address stored at a peeked cursor position.
    #[inline]
    pub fn addr(&mut self, idx: u32) -> u64 {
        unsafe { *_xsk_ring_cons__comp_addr(self.cq.as_mut(), idx) }
    }

    /// Hand `n` consumed entries back to the kernel.
    #[inline]
    pub fn release(&mut self, n: u32) {
        unsafe {
            _xsk_ring_cons__release(self.cq.as_mut(), n as u64);
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn umem(&self) -> &Arc<UmemRegion> {
        &self.umem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap_area::{MmapArea, MmapAreaOptions};
    use crate::{FRAME_SIZE, NUM_FRAMES};

    fn area() -> Arc<MmapArea> {
        MmapArea::new(
            (NUM_FRAMES * FRAME_SIZE) as usize,
            MmapAreaOptions::default(),
        )
        .unwrap()
    }

    // Ring size validation happens before the kernel is involved, so these
    // run unprivileged.
    #[test]
    fn rejects_non_pow2_fill() {
        match UmemRegion::new(area(), 1000, 2048) {
            Err(UmemError::RingNotPowerOfTwo) => {}
            other => panic!("expected RingNotPowerOfTwo, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn rejects_non_pow2_comp() {
        match UmemRegion::new(area(), 2048, 100) {
            Err(UmemError::RingNotPowerOfTwo) => {}
            other => panic!("expected RingNotPowerOfTwo, got {:?}", other.is_ok()),
        }
    }

    // Registration itself needs RLIMIT_MEMLOCK raised.
    #[test]
    fn creates_umem_when_privileged() {
        use rlimit::{setrlimit, Resource};
        use std::io::Write;

        if setrlimit(Resource::MEMLOCK, rlimit::INFINITY, rlimit::INFINITY).is_err() {
            writeln!(
                &mut std::io::stdout(),
                "Test skipped as it needs to be run as root"
            )
            .unwrap();
            return;
        }

        let r = UmemRegion::new(area(), 2048, 2048);
        match r {
            Ok((_region, fill, comp)) => {
                assert_eq!(fill.size(), 2048);
                assert_eq!(comp.size(), 2048);
            }
            Err(err) => panic!("umem create failed: {}", err),
        }
    }
}
