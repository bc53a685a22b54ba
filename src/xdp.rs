use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use libbpf_sys::{
    bpf_map__fd, bpf_object, bpf_object__close, bpf_object__find_map_by_name,
    bpf_object__find_program_by_name, bpf_object__load, bpf_object__open_file, bpf_program__fd,
    bpf_set_link_xdp_fd, libbpf_get_error, XDP_FLAGS_DRV_MODE, XDP_FLAGS_SKB_MODE,
    XDP_FLAGS_UPDATE_IF_NOEXIST,
};
use log::{info, warn};
use thiserror::Error;

/// Map the redirect program must define: keyed by RX queue index, valued by
/// AF_XDP socket descriptors. The loader treats the rest of the object as
/// opaque.
pub const XSK_MAP_NAME: &str = "xsks_map";

/// XDP hook attachment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Try native, fall back to generic.
    Auto,
    /// In-driver hook. Fails on drivers without XDP support.
    Native,
    /// Generic (SKB) hook in the core stack. Works everywhere, slower.
    Generic,
}

#[derive(Debug, Error)]
pub enum XdpError {
    #[error("failed to open {path}: {err}")]
    Open { path: String, err: io::Error },
    #[error("failed to load {path}: {err}")]
    Load { path: String, err: io::Error },
    #[error("program {0} not found in object")]
    ProgramNotFound(String),
    #[error("xdp attach failed: {0}")]
    Attach(io::Error),
    #[error("map {XSK_MAP_NAME} not found in object")]
    MapNotFound,
    #[error("object path contains an interior nul byte")]
    BadPath,
}

/// Owns the loaded redirect program and its attachment to the interface.
/// Detaches and releases on drop, so a failure later in initialization
/// rolls the attachment back automatically.
#[derive(Debug)]
pub struct XdpLoader {
    obj: *mut bpf_object,
    map_fd: RawFd,
    ifindex: i32,
    flags: u32,
    attached: bool,
}

unsafe impl Send for XdpLoader {}

impl XdpLoader {
    /// Load `obj_path`, attach the program named `prog_name` to `ifindex`,
    /// and resolve the socket map.
    ///
    /// With [`AttachMode::Auto`] a failed native attach is retried once in
    /// generic mode; an explicitly requested mode is never retried.
    pub fn load_and_attach(
        obj_path: &Path,
        prog_name: &str,
        ifindex: i32,
        mode: AttachMode,
    ) -> Result<XdpLoader, XdpError> {
        let path_str = obj_path.display().to_string();
        let path_c = CString::new(path_str.clone()).map_err(|_| XdpError::BadPath)?;
        let prog_c = CString::new(prog_name).map_err(|_| XdpError::BadPath)?;

        let obj = unsafe { bpf_object__open_file(path_c.as_ptr(), std::ptr::null()) };
        // libbpf encodes open failures as an error pointer, not NULL.
        let open_err = unsafe { libbpf_get_error(obj as *const libc::c_void) };
        if obj.is_null() || open_err != 0 {
            let err = if open_err != 0 {
                io::Error::from_raw_os_error(-open_err as i32)
            } else {
                io::Error::last_os_error()
            };
            return Err(XdpError::Open {
                path: path_str,
                err,
            });
        }

        let ret = unsafe { bpf_object__load(obj) };
        if ret != 0 {
            unsafe { bpf_object__close(obj) };
            return Err(XdpError::Load {
                path: path_str,
                err: io::Error::from_raw_os_error(-ret),
            });
        }

        let prog = unsafe { bpf_object__find_program_by_name(obj, prog_c.as_ptr()) };
        if prog.is_null() {
            unsafe { bpf_object__close(obj) };
            return Err(XdpError::ProgramNotFound(prog_name.to_string()));
        }
        let prog_fd = unsafe { bpf_program__fd(prog) };
        if prog_fd < 0 {
            unsafe { bpf_object__close(obj) };
            return Err(XdpError::ProgramNotFound(prog_name.to_string()));
        }

        let mut flags = XDP_FLAGS_UPDATE_IF_NOEXIST
            | match mode {
                AttachMode::Auto | AttachMode::Native => XDP_FLAGS_DRV_MODE,
                AttachMode::Generic => XDP_FLAGS_SKB_MODE,
            };

        let mut ret = unsafe { bpf_set_link_xdp_fd(ifindex, prog_fd, flags) };
        if ret != 0 && mode == AttachMode::Auto {
            warn!(
                "native xdp attach failed ({}), retrying in generic mode",
                io::Error::from_raw_os_error(-ret)
            );
            flags = XDP_FLAGS_UPDATE_IF_NOEXIST | XDP_FLAGS_SKB_MODE;
            ret = unsafe { bpf_set_link_xdp_fd(ifindex, prog_fd, flags) };
        }
        if ret != 0 {
            unsafe { bpf_object__close(obj) };
            return Err(XdpError::Attach(io::Error::from_raw_os_error(-ret)));
        }

        let mode_str = if (flags & XDP_FLAGS_DRV_MODE) != 0 {
            "native"
        } else {
            "generic"
        };
        info!("xdp program {} attached ({} mode)", prog_name, mode_str);

        let mut loader = XdpLoader {
            obj,
            map_fd: -1,
            ifindex,
            flags,
            attached: true,
        };

        let map_c = CString::new(XSK_MAP_NAME).map_err(|_| XdpError::BadPath)?;
        let map = unsafe { bpf_object__find_map_by_name(obj, map_c.as_ptr()) };
        let map_fd = if map.is_null() {
            -1
        } else {
            unsafe { bpf_map__fd(map) }
        };
        if map_fd < 0 {
            // Drop detaches and closes the half-built loader.
            return Err(XdpError::MapNotFound);
        }
        loader.map_fd = map_fd;

        Ok(loader)
    }

    /// Descriptor of the socket map, for [`crate::socket::XskSocket::register_in_map`].
    pub fn map_fd(&self) -> RawFd {
        self.map_fd
    }

    /// Remove the program from the interface. Idempotent; also runs on drop.
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }

        let ret = unsafe { bpf_set_link_xdp_fd(self.ifindex, -1, self.flags) };
        if ret != 0 {
            warn!(
                "xdp detach failed: {}",
                io::Error::from_raw_os_error(-ret)
            );
        } else {
            info!("xdp program detached");
        }
        self.attached = false;
    }
}

impl Drop for XdpLoader {
    fn drop(&mut self) {
        self.detach();
        unsafe {
            bpf_object__close(self.obj);
        }
    }
}
