//
// Bounce every packet arriving on one (interface, queue) pair back out the
// same interface through an AF_XDP socket, with the kernel bypassed for the
// whole round trip. The redirect program is loaded from an on-disk object
// and removed again on shutdown.
//
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use rlimit::{setrlimit, Resource};
use structopt::StructOpt;

use xskfwd::config::{Config, Opt};
use xskfwd::engine::{Counters, Engine, EngineConfig};
use xskfwd::frame_pool::FramePool;
use xskfwd::mmap_area::{MmapArea, MmapAreaOptions};
use xskfwd::socket::XskSocket;
use xskfwd::stats::StatsReporter;
use xskfwd::umem::UmemRegion;
use xskfwd::xdp::XdpLoader;
use xskfwd::{
    InitError, COMP_RING_SIZE, FILL_RING_SIZE, FRAME_SIZE, NUM_FRAMES, RX_RING_SIZE,
    STATS_INTERVAL_SECS, TX_RING_SIZE,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Usage goes to stderr and exits nonzero, for -h as much as for a bad
    // flag.
    let opt = match Opt::from_iter_safe(std::env::args()) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{}", err.message);
            process::exit(1);
        }
    };

    if let Err(err) = run(opt) {
        error!("{}", err);
        process::exit(err.exit_code());
    }
}

fn run(opt: Opt) -> Result<(), InitError> {
    let cfg = Config::from_opt(opt)?;

    info!(
        "interface {} (index {}), queue {}, object {} prog {}",
        cfg.ifname,
        cfg.ifindex,
        cfg.queue,
        cfg.xdp_obj.display(),
        cfg.xdp_prog
    );
    if let Some(ttl) = cfg.ttl {
        info!("time to live: {:?}", ttl);
    }
    if let Some(limit) = cfg.pkt_limit {
        info!("packet limit: {}", limit);
    }

    // UMEM registration locks memory.
    setrlimit(Resource::MEMLOCK, rlimit::INFINITY, rlimit::INFINITY)
        .map_err(InitError::Rlimit)?;

    // The flag exists before the handler that writes it is installed, and
    // outlives the handler's last possible invocation.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .expect("failed to install signal handler");
    }

    // Resources build in dependency order; each one rolls back in its Drop,
    // so an error below unwinds everything acquired so far in reverse.
    let loader = XdpLoader::load_and_attach(&cfg.xdp_obj, &cfg.xdp_prog, cfg.ifindex, cfg.attach_mode)?;

    let area = MmapArea::new(
        (NUM_FRAMES * FRAME_SIZE) as usize,
        MmapAreaOptions::default(),
    )?;
    let (_region, fill, comp) = UmemRegion::new(area, FILL_RING_SIZE, COMP_RING_SIZE)?;

    let mut pool = FramePool::new(NUM_FRAMES, FRAME_SIZE);

    let umem = fill.umem().clone();
    let socket = XskSocket::new(
        umem,
        fill,
        comp,
        &cfg.ifname,
        cfg.queue,
        RX_RING_SIZE,
        TX_RING_SIZE,
        cfg.bind_mode,
        &mut pool,
    )?;
    socket.register_in_map(loader.map_fd())?;

    info!(
        "socket bound on {} queue {}, {} frames of {} bytes, {} primed into the fill ring",
        cfg.ifname, cfg.queue, NUM_FRAMES, FRAME_SIZE, FILL_RING_SIZE
    );

    let counters = Arc::new(Counters::default());
    let reporter = if cfg.verbose {
        Some(StatsReporter::spawn(
            counters.clone(),
            stop.clone(),
            Duration::from_secs(STATS_INTERVAL_SECS),
        ))
    } else {
        None
    };

    let engine_cfg = EngineConfig {
        poll_mode: cfg.poll_mode,
        ttl: cfg.ttl,
        pkt_limit: cfg.pkt_limit,
        ..Default::default()
    };
    let mut engine = Engine::new(socket, pool, engine_cfg, counters.clone(), stop.clone());

    engine.run();

    if let Some(handle) = reporter {
        let _ = handle.join();
    }

    let s = counters.snapshot();
    info!(
        "final: rx {} pkts / {} bytes, tx {} pkts / {} bytes, tx drops {}",
        s.rx_packets, s.rx_bytes, s.tx_packets, s.tx_bytes, s.tx_dropped
    );

    // Engine (and with it the socket and umem) drops before the loader, so
    // the interface is quiesced before the redirect program comes off.
    Ok(())
}
