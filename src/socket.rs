use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use errno::errno;
use libbpf_sys::{
    _xsk_ring_cons__peek, _xsk_ring_cons__release, _xsk_ring_cons__rx_desc,
    _xsk_ring_prod__reserve, _xsk_ring_prod__submit, _xsk_ring_prod__tx_desc,
    bpf_map_update_elem, xsk_ring_cons, xsk_ring_prod, xsk_socket, xsk_socket__create,
    xsk_socket__delete, xsk_socket__fd, xsk_socket_config, XDP_COPY,
    XDP_FLAGS_UPDATE_IF_NOEXIST, XDP_USE_NEED_WAKEUP, XDP_ZEROCOPY,
    XSK_LIBBPF_FLAGS__INHIBIT_PROG_LOAD,
};
use libc::{poll, pollfd, sendto, EAGAIN, EBUSY, ENETDOWN, ENOBUFS, MSG_DONTWAIT, POLLIN};
use log::warn;
use thiserror::Error;

use crate::frame_pool::FramePool;
use crate::umem::{CompletionRing, FillRing, UmemRegion};
use crate::util;

/// One packet descriptor: a UMEM frame offset and the payload length within
/// the frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    pub addr: u64,
    pub len: u32,
}

/// How the socket binds to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Let the kernel pick; zero-copy where the driver supports it.
    Auto,
    /// Force copy mode.
    Copy,
    /// Force zero-copy; socket creation fails if the driver cannot.
    ZeroCopy,
}

/// The ring surface the engine drives, separated from the AF_XDP socket so
/// the batch loop can also run against an instrumented mock kernel.
///
/// Reserve/submit on producer rings and peek/release on consumer rings carry
/// the acquire/release ordering the kernel expects; implementations must not
/// submit more than reserved or release more than peeked.
pub trait Datapath {
    /// Non-blocking check of the RX ring: (entries available, first cursor).
    fn rx_peek(&mut self, max: u32) -> (u32, u32);
    /// Descriptor at a peeked cursor position.
    fn rx_desc(&mut self, idx: u32) -> FrameDesc;
    /// Mark `n` RX entries consumed.
    fn rx_release(&mut self, n: u32);

    /// Reserve `n` TX slots; `None` if fewer than `n` are free.
    fn tx_reserve(&mut self, n: u32) -> Option<u32>;
    fn tx_set(&mut self, idx: u32, desc: FrameDesc);
    fn tx_submit(&mut self, n: u32);

    /// Fill-ring slots currently reservable.
    fn fq_free_slots(&mut self) -> u32;
    fn fq_reserve(&mut self, n: u32) -> (u32, u32);
    fn fq_set(&mut self, idx: u32, addr: u64);
    fn fq_submit(&mut self, n: u32);

    fn cq_peek(&mut self, max: u32) -> (u32, u32);
    fn cq_addr(&mut self, idx: u32) -> u64;
    fn cq_release(&mut self, n: u32);

    /// Nudge the kernel to process the TX ring. Never blocks; the kernel may
    /// defer transmission indefinitely without it.
    fn kick_tx(&mut self);

    /// Block until the socket is readable or the timeout elapses. Returns
    /// whether it became readable.
    fn wait_rx(&mut self, timeout_ms: i32) -> bool;
}

/// An AF_XDP socket bound to one (interface, queue) pair, owning all four
/// rings: RX/TX from the socket itself plus the UMEM's Fill and Completion
/// rings. Exactly one task drives it.
#[derive(Debug)]
pub struct XskSocket {
    umem: Arc<UmemRegion>,
    xsk: *mut xsk_socket,
    fd: RawFd,
    queue: u32,
    rx: Box<xsk_ring_cons>,
    tx: Box<xsk_ring_prod>,
    fill: FillRing,
    comp: CompletionRing,
}

unsafe impl Send for XskSocket {}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("ring size not a power of two")]
    RingNotPowerOfTwo,
    #[error("interface name contains an interior nul byte")]
    BadInterfaceName,
    #[error("xsk_socket__create failed: {0}")]
    Create(io::Error),
    #[error("socket map insert failed: {0}")]
    MapInsert(io::Error),
    #[error("fill ring prime reserved {got} of {want} slots")]
    FillPrime { want: u32, got: u32 },
    #[error("frame pool holds {have} frames, fill ring needs {need}")]
    PoolTooSmall { need: u32, have: u32 },
}

impl XskSocket {
    /// Create the socket and prime the Fill ring.
    ///
    /// The redirect program is always supplied by the caller (see
    /// [`crate::xdp::XdpLoader`]), so the libbpf default program load is
    /// inhibited unconditionally. Until [`XskSocket::register_in_map`] runs,
    /// the kernel program falls through to the regular stack and no packets
    /// arrive here.
    ///
    /// Priming moves `fill_size` frames from `pool` into the Fill ring:
    /// without them the kernel has nowhere to write received packets and
    /// drops everything.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        umem: Arc<UmemRegion>,
        fill: FillRing,
        comp: CompletionRing,
        if_name: &str,
        queue: u32,
        rx_size: u32,
        tx_size: u32,
        bind_mode: BindMode,
        pool: &mut FramePool,
    ) -> Result<XskSocket, SocketError> {
        if !util::is_pow_of_two(rx_size) || !util::is_pow_of_two(tx_size) {
            return Err(SocketError::RingNotPowerOfTwo);
        }

        let mut cfg = xsk_socket_config {
            rx_size,
            tx_size,
            xdp_flags: XDP_FLAGS_UPDATE_IF_NOEXIST,
            bind_flags: XDP_USE_NEED_WAKEUP as u16,
            libbpf_flags: XSK_LIBBPF_FLAGS__INHIBIT_PROG_LOAD,
        };

        match bind_mode {
            BindMode::Auto => {}
            BindMode::Copy => cfg.bind_flags |= XDP_COPY as u16,
            BindMode::ZeroCopy => cfg.bind_flags |= XDP_ZEROCOPY as u16,
        }

        // Heap allocate the rings since the kernel keeps pointers to them.
        let mut rx: Box<xsk_ring_cons> = Default::default();
        let mut tx: Box<xsk_ring_prod> = Default::default();

        // C function has double indirection
        let mut xsk: *mut xsk_socket = std::ptr::null_mut();

        let if_name_c = CString::new(if_name).map_err(|_| SocketError::BadInterfaceName)?;

        let ret: std::os::raw::c_int;
        unsafe {
            ret = xsk_socket__create(
                &mut xsk,
                if_name_c.as_ptr(),
                queue,
                umem.raw(),
                rx.as_mut(),
                tx.as_mut(),
                &cfg,
            );
        }

        if ret != 0 {
            return Err(SocketError::Create(io::Error::from_raw_os_error(-ret)));
        }

        let fd = unsafe { xsk_socket__fd(xsk) };

        let mut socket = XskSocket {
            umem,
            xsk,
            fd,
            queue,
            rx,
            tx,
            fill,
            comp,
        };

        socket.prime_fill_ring(pool)?;

        Ok(socket)
    }

    /// Insert this socket into the redirect program's socket map at
    /// `key = queue_id` so the kernel starts steering packets to it.
    pub fn register_in_map(&self, map_fd: RawFd) -> Result<(), SocketError> {
        let key = self.queue;
        let value = self.fd;

        let ret = unsafe {
            bpf_map_update_elem(
                map_fd,
                &key as *const u32 as *const libc::c_void,
                &value as *const RawFd as *const libc::c_void,
                0,
            )
        };
        if ret != 0 {
            return Err(SocketError::MapInsert(io::Error::from_raw_os_error(-ret)));
        }

        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn umem(&self) -> &Arc<UmemRegion> {
        &self.umem
    }

    // The rings are empty at this point, so the reservation either returns
    // everything or the UMEM is broken.
    fn prime_fill_ring(&mut self, pool: &mut FramePool) -> Result<(), SocketError> {
        let n = self.fill.size();

        if pool.free_count() < n {
            return Err(SocketError::PoolTooSmall {
                need: n,
                have: pool.free_count(),
            });
        }

        let (got, mut idx) = self.fill.reserve(n);
        if got != n {
            return Err(SocketError::FillPrime { want: n, got });
        }

        for _ in 0..n {
            let addr = match pool.alloc() {
                Some(addr) => addr,
                None => panic!("pool emptied during fill prime"),
            };
            self.fill.set(idx, addr);
            idx += 1;
        }
        self.fill.submit(n);

        Ok(())
    }
}

impl Datapath for XskSocket {
    #[inline]
    fn rx_peek(&mut self, max: u32) -> (u32, u32) {
        let mut idx: u32 = 0;
        let got: u32;

        unsafe {
            got = _xsk_ring_cons__peek(self.rx.as_mut(), max as u64, &mut idx) as u32;
        }

        (got, idx)
    }

    #[inline]
    fn rx_desc(&mut self, idx: u32) -> FrameDesc {
        unsafe {
            let desc = _xsk_ring_cons__rx_desc(self.rx.as_mut(), idx);
            FrameDesc {
                addr: (*desc).addr,
                len: (*desc).len,
            }
        }
    }

    #[inline]
    fn rx_release(&mut self, n: u32) {
        unsafe {
            _xsk_ring_cons__release(self.rx.as_mut(), n as u64);
        }
    }

    #[inline]
    fn tx_reserve(&mut self, n: u32) -> Option<u32> {
        let mut idx: u32 = 0;
        let got: u32;

        unsafe {
            got = _xsk_ring_prod__reserve(self.tx.as_mut(), n as u64, &mut idx) as u32;
        }

        // libbpf reservations are all-or-nothing.
        if got == n {
            Some(idx)
        } else {
            None
        }
    }

    #[inline]
    fn tx_set(&mut self, idx: u32, desc: FrameDesc) {
        unsafe {
            let slot = _xsk_ring_prod__tx_desc(self.tx.as_mut(), idx);
            (*slot).addr = desc.addr;
            (*slot).len = desc.len;
            (*slot).options = 0;
        }
    }

    #[inline]
    fn tx_submit(&mut self, n: u32) {
        unsafe {
            _xsk_ring_prod__submit(self.tx.as_mut(), n as u64);
        }
    }

    #[inline]
    fn fq_free_slots(&mut self) -> u32 {
        self.fill.free_slots()
    }

    #[inline]
    fn fq_reserve(&mut self, n: u32) -> (u32, u32) {
        self.fill.reserve(n)
    }

    #[inline]
    fn fq_set(&mut self, idx: u32, addr: u64) {
        self.fill.set(idx, addr);
    }

    #[inline]
    fn fq_submit(&mut self, n: u32) {
        self.fill.submit(n);
    }

    #[inline]
    fn cq_peek(&mut self, max: u32) -> (u32, u32) {
        self.comp.peek(max)
    }

    #[inline]
    fn cq_addr(&mut self, idx: u32) -> u64 {
        self.comp.addr(idx)
    }

    #[inline]
    fn cq_release(&mut self, n: u32) {
        self.comp.release(n);
    }

    fn kick_tx(&mut self) {
        let ret = unsafe {
            sendto(
                self.fd,
                std::ptr::null(),
                0,
                MSG_DONTWAIT,
                std::ptr::null(),
                0,
            )
        };

        if ret < 0 {
            // The xdpsock_user.c sample application treats these errno
            // values as benign and panics otherwise. Copying that behavior.
            let errno = errno().0;
            match errno {
                ENOBUFS | EAGAIN | EBUSY | ENETDOWN => {}
                _ => panic!("tx kick failed with errno {}", errno),
            }
        }
    }

    fn wait_rx(&mut self, timeout_ms: i32) -> bool {
        let mut fds = [pollfd {
            fd: self.fd,
            events: POLLIN,
            revents: 0,
        }];

        let ret: i32;
        unsafe {
            ret = poll(fds.as_mut_ptr(), 1, timeout_ms);
        }

        if ret < 0 {
            let errno = errno().0;
            warn!("poll error on xsk fd: errno={}", errno);
            return false;
        }

        ret > 0 && (fds[0].revents & POLLIN) != 0
    }
}

impl Drop for XskSocket {
    fn drop(&mut self) {
        unsafe {
            xsk_socket__delete(self.xsk);
        }
    }
}
