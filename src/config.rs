use std::ffi::CString;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;
use thiserror::Error;

use crate::engine::PollMode;
use crate::socket::BindMode;
use crate::xdp::AttachMode;

pub const DEFAULT_IFNAME: &str = "eth0";
pub const DEFAULT_XDP_OBJ: &str = "bpf/xsk_redirect.o";
pub const DEFAULT_XDP_PROG: &str = "xsk_redirect_prog";

#[derive(StructOpt, Debug)]
#[structopt(
    name = "xskfwd",
    about = "Bounce packets arriving on one NIC queue straight back out via AF_XDP"
)]
pub struct Opt {
    /// Network interface to bind
    #[structopt(short = "d", long = "dev", default_value = "eth0")]
    pub ifname: String,

    /// RX queue index
    #[structopt(short = "Q", long = "queue", default_value = "0")]
    pub queue: u32,

    /// Attach in generic (SKB) mode; implies a copy-mode bind
    #[structopt(short = "S", long = "skb-mode", conflicts_with = "native-mode")]
    pub skb_mode: bool,

    /// Attach in native driver mode
    #[structopt(short = "N", long = "native-mode")]
    pub native_mode: bool,

    /// Force a copy-mode bind
    #[structopt(short = "c", long = "copy", conflicts_with = "zero-copy")]
    pub copy: bool,

    /// Force a zero-copy bind; fail if the driver cannot
    #[structopt(short = "z", long = "zero-copy")]
    pub zero_copy: bool,

    /// Sleep on socket readability instead of busy-waiting
    #[structopt(short = "p", long = "poll")]
    pub poll: bool,

    /// Redirect program object file
    #[structopt(short = "f", long = "xdp-obj", default_value = "bpf/xsk_redirect.o")]
    pub xdp_obj: PathBuf,

    /// Program name within the object file
    #[structopt(short = "P", long = "xdp-prog", default_value = "xsk_redirect_prog")]
    pub xdp_prog: String,

    /// Print periodic statistics
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Shut down after this many seconds
    #[structopt(short = "t", long = "ttl")]
    pub ttl: Option<u64>,

    /// Shut down after receiving this many packets
    #[structopt(short = "l", long = "pkt-limit")]
    pub pkt_limit: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot find interface {name}: {err}")]
    UnknownInterface { name: String, err: io::Error },
    #[error("interface name contains an interior nul byte")]
    BadInterfaceName,
}

/// Parsed and resolved runtime configuration.
#[derive(Debug)]
pub struct Config {
    pub ifname: String,
    pub ifindex: i32,
    pub queue: u32,
    pub attach_mode: AttachMode,
    pub bind_mode: BindMode,
    pub poll_mode: PollMode,
    pub xdp_obj: PathBuf,
    pub xdp_prog: String,
    pub verbose: bool,
    pub ttl: Option<Duration>,
    pub pkt_limit: Option<u64>,
}

impl Config {
    /// Resolve flag combinations and look up the interface index. Generic
    /// (SKB) attach implies a copy bind: the generic hook never supports
    /// zero copy.
    pub fn from_opt(opt: Opt) -> Result<Config, ConfigError> {
        let ifindex = resolve_ifindex(&opt.ifname)?;

        let attach_mode = if opt.skb_mode {
            AttachMode::Generic
        } else if opt.native_mode {
            AttachMode::Native
        } else {
            AttachMode::Auto
        };

        let bind_mode = if opt.zero_copy {
            BindMode::ZeroCopy
        } else if opt.copy || opt.skb_mode {
            BindMode::Copy
        } else {
            BindMode::Auto
        };

        let poll_mode = if opt.poll {
            PollMode::Cooperative
        } else {
            PollMode::BusyWait
        };

        Ok(Config {
            ifname: opt.ifname,
            ifindex,
            queue: opt.queue,
            attach_mode,
            bind_mode,
            poll_mode,
            xdp_obj: opt.xdp_obj,
            xdp_prog: opt.xdp_prog,
            verbose: opt.verbose,
            ttl: opt.ttl.map(Duration::from_secs),
            pkt_limit: opt.pkt_limit,
        })
    }
}

fn resolve_ifindex(name: &str) -> Result<i32, ConfigError> {
    let name_c = CString::new(name).map_err(|_| ConfigError::BadInterfaceName)?;

    let ifindex = unsafe { libc::if_nametoindex(name_c.as_ptr()) };
    if ifindex == 0 {
        return Err(ConfigError::UnknownInterface {
            name: name.to_string(),
            err: io::Error::last_os_error(),
        });
    }

    Ok(ifindex as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    // "lo" always exists on Linux, so flag-folding tests resolve against it.

    #[test]
    fn defaults() {
        let opt = Opt::from_iter(&["xskfwd", "-d", "lo"]);
        let cfg = Config::from_opt(opt).unwrap();

        assert_eq!(cfg.ifname, "lo");
        assert!(cfg.ifindex > 0);
        assert_eq!(cfg.queue, 0);
        assert_eq!(cfg.attach_mode, AttachMode::Auto);
        assert_eq!(cfg.bind_mode, BindMode::Auto);
        assert_eq!(cfg.poll_mode, PollMode::BusyWait);
        assert_eq!(cfg.xdp_obj, PathBuf::from(DEFAULT_XDP_OBJ));
        assert_eq!(cfg.xdp_prog, DEFAULT_XDP_PROG);
        assert!(!cfg.verbose);
        assert_eq!(cfg.ttl, None);
        assert_eq!(cfg.pkt_limit, None);
    }

    #[test]
    fn skb_mode_implies_copy_bind() {
        let opt = Opt::from_iter(&["xskfwd", "-d", "lo", "-S"]);
        let cfg = Config::from_opt(opt).unwrap();

        assert_eq!(cfg.attach_mode, AttachMode::Generic);
        assert_eq!(cfg.bind_mode, BindMode::Copy);
    }

    #[test]
    fn explicit_modes_and_limits() {
        let opt = Opt::from_iter(&[
            "xskfwd", "-d", "lo", "-N", "-z", "-p", "-v", "-t", "30", "-l", "100000", "-Q", "3",
        ]);
        let cfg = Config::from_opt(opt).unwrap();

        assert_eq!(cfg.queue, 3);
        assert_eq!(cfg.attach_mode, AttachMode::Native);
        assert_eq!(cfg.bind_mode, BindMode::ZeroCopy);
        assert_eq!(cfg.poll_mode, PollMode::Cooperative);
        assert!(cfg.verbose);
        assert_eq!(cfg.ttl, Some(Duration::from_secs(30)));
        assert_eq!(cfg.pkt_limit, Some(100000));
    }

    #[test]
    fn conflicting_flags_rejected() {
        assert!(Opt::from_iter_safe(&["xskfwd", "-S", "-N"]).is_err());
        assert!(Opt::from_iter_safe(&["xskfwd", "-c", "-z"]).is_err());
    }

    #[test]
    fn unknown_interface_fails() {
        let opt = Opt::from_iter(&["xskfwd", "-d", "definitely-not-a-nic0"]);
        match Config::from_opt(opt) {
            Err(ConfigError::UnknownInterface { name, .. }) => {
                assert_eq!(name, "definitely-not-a-nic0");
            }
            other => panic!("expected UnknownInterface, got {:?}", other),
        }
    }
}
