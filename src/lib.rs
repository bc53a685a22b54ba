//! Userspace AF_XDP datapath that bounces every received frame back out the
//! interface it arrived on.
//!
//! A small XDP program in the kernel redirects selected ingress packets into
//! a shared UMEM region. This crate owns the userspace half: the UMEM and its
//! frame allocator, the four rings shared with the kernel (RX, TX, Fill,
//! Completion), the redirect-program loader, and the polling engine that
//! drives receive → transmit → completion batches.
//!
//! The engine runs single threaded and owns its socket and frame pool
//! outright, so the hot path takes no locks. The only concurrent reader is
//! the optional stats thread, which observes atomic counters.

use std::io;

use thiserror::Error;

pub mod config;
pub mod engine;
pub mod frame_pool;
pub mod mmap_area;
pub mod socket;
pub mod stats;
pub mod umem;
pub mod xdp;
mod util;

/// Number of frames in the UMEM. Each frame holds exactly one packet.
pub const NUM_FRAMES: u32 = 4096;

/// Size of each UMEM frame in bytes (one page).
pub const FRAME_SIZE: u32 = libbpf_sys::XSK_UMEM__DEFAULT_FRAME_SIZE;

/// Sentinel for "no frame". Never a valid UMEM offset.
pub const INVALID_FRAME: u64 = u64::MAX;

pub const RX_RING_SIZE: u32 = libbpf_sys::XSK_RING_CONS__DEFAULT_NUM_DESCS;
pub const TX_RING_SIZE: u32 = libbpf_sys::XSK_RING_PROD__DEFAULT_NUM_DESCS;
pub const FILL_RING_SIZE: u32 = libbpf_sys::XSK_RING_PROD__DEFAULT_NUM_DESCS;
pub const COMP_RING_SIZE: u32 = libbpf_sys::XSK_RING_CONS__DEFAULT_NUM_DESCS;

/// Maximum packets consumed from the RX ring per batch iteration.
pub const RX_BATCH_SIZE: u32 = 64;

/// Fill-ring reservation attempts before the engine gives up on the current
/// iteration and proceeds with a partial refill.
pub const MAX_FQ_RETRIES: u32 = 1024;

/// Capacity of the kernel-side socket map; one slot per RX queue.
pub const MAX_SOCKETS: u32 = 64;

/// Seconds between stats reporter lines.
pub const STATS_INTERVAL_SECS: u64 = 2;

/// Readability wait in cooperative poll mode.
pub const POLL_TIMEOUT_MS: i32 = 1000;

/// How long shutdown waits for outstanding transmissions to complete before
/// leaking the remaining frames into the UMEM region.
pub const DRAIN_DEADLINE_MS: u64 = 100;

/// Any failure on the way from argument parsing to a running engine. Each
/// stage keeps its own error type; this is the rollup the binary maps to an
/// exit code.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("memlock rlimit: {0}")]
    Rlimit(io::Error),
    #[error("xdp loader: {0}")]
    Xdp(#[from] xdp::XdpError),
    #[error("umem mmap: {0}")]
    Mmap(#[from] mmap_area::MmapError),
    #[error("umem: {0}")]
    Umem(#[from] umem::UmemError),
    #[error("socket: {0}")]
    Socket(#[from] socket::SocketError),
}

impl InitError {
    /// Exit code for the process: the POSIX error number the kernel gave us
    /// where there is one, otherwise 1.
    pub fn exit_code(&self) -> i32 {
        match self.os_error() {
            Some(errno) if errno > 0 => errno,
            _ => 1,
        }
    }

    fn os_error(&self) -> Option<i32> {
        let io_err = match self {
            InitError::Config(config::ConfigError::UnknownInterface { err, .. }) => err,
            InitError::Rlimit(err) => err,
            InitError::Xdp(xdp::XdpError::Open { err, .. }) => err,
            InitError::Xdp(xdp::XdpError::Load { err, .. }) => err,
            InitError::Xdp(xdp::XdpError::Attach(err)) => err,
            InitError::Mmap(mmap_area::MmapError::Mmap(err)) => err,
            InitError::Umem(umem::UmemError::Create(err)) => err,
            InitError::Socket(socket::SocketError::Create(err)) => err,
            InitError::Socket(socket::SocketError::MapInsert(err)) => err,
            _ => return None,
        };
        io_err.raw_os_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_carries_errno() {
        let err = InitError::Umem(umem::UmemError::Create(io::Error::from_raw_os_error(
            libc::ENOMEM,
        )));
        assert_eq!(err.exit_code(), libc::ENOMEM);
    }

    #[test]
    fn exit_code_defaults_to_one() {
        let err = InitError::Umem(umem::UmemError::RingNotPowerOfTwo);
        assert_eq!(err.exit_code(), 1);
    }
}
