use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::frame_pool::FramePool;
use crate::socket::{Datapath, FrameDesc};
use crate::{COMP_RING_SIZE, DRAIN_DEADLINE_MS, MAX_FQ_RETRIES, POLL_TIMEOUT_MS, RX_BATCH_SIZE};

/// Packet and byte counters, written by the engine task and read by the
/// stats reporter. All counters are monotonic.
#[derive(Debug, Default)]
pub struct Counters {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_dropped: AtomicU64,
}

/// A consistent-enough view of the counters: each field is loaded
/// atomically, so a reader never sees a torn 64-bit value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Spin on the rings with no syscalls between batches.
    BusyWait,
    /// Block on socket readability (1 s timeout) before each batch.
    Cooperative,
}

/// Where the engine is in its linear lifecycle. Transitions never go
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initialized,
    Running,
    Stopping,
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub poll_mode: PollMode,
    /// Stop after this long, measured from the start of `run`.
    pub ttl: Option<Duration>,
    /// Stop once this many packets have been received.
    pub pkt_limit: Option<u64>,
    pub rx_batch: u32,
    pub comp_batch: u32,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            poll_mode: PollMode::BusyWait,
            ttl: None,
            pkt_limit: None,
            rx_batch: RX_BATCH_SIZE,
            comp_batch: COMP_RING_SIZE,
        }
    }
}

/// The polling core: receives batches from the RX ring, bounces every frame
/// onto the TX ring, keeps the kernel's Fill ring stocked, and reclaims
/// transmitted frames from the Completion ring.
///
/// Owns its datapath and frame pool exclusively; the loop takes no locks.
/// Every frame is in exactly one place at any quiescent point: the pool, the
/// Fill ring, held between RX peek and release, or counted in
/// `outstanding_tx` (TX plus Completion ring). Phase D subtracts only the
/// completions it just observed, so an underflow there can only mean broken
/// accounting and panics instead of saturating.
pub struct Engine<D: Datapath> {
    dp: D,
    pool: FramePool,
    cfg: EngineConfig,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    outstanding_tx: u32,
    state: EngineState,
    started: Option<Instant>,
}

impl<D: Datapath> Engine<D> {
    pub fn new(
        dp: D,
        pool: FramePool,
        cfg: EngineConfig,
        counters: Arc<Counters>,
        stop: Arc<AtomicBool>,
    ) -> Engine<D> {
        Engine {
            dp,
            pool,
            cfg,
            counters,
            stop,
            outstanding_tx: 0,
            state: EngineState::Initialized,
            started: None,
        }
    }

    /// Run batch iterations until a stop is requested by signal, TTL, or
    /// packet limit, then drain outstanding transmissions.
    pub fn run(&mut self) {
        self.state = EngineState::Running;
        self.started = Some(Instant::now());

        info!(
            "entering main loop ({})",
            match self.cfg.poll_mode {
                PollMode::BusyWait => "busy-wait",
                PollMode::Cooperative => "poll",
            }
        );

        loop {
            if self.cfg.poll_mode == PollMode::Cooperative && !self.stop.load(Ordering::Relaxed) {
                // Timeout or not, the iteration still runs: completions
                // accumulate independently of RX traffic.
                self.dp.wait_rx(POLL_TIMEOUT_MS);
            }

            self.run_iteration();

            if self.should_stop() {
                break;
            }
        }

        self.state = EngineState::Stopping;
        self.drain();
        self.state = EngineState::Terminated;

        info!("main loop exited");
    }

    /// One batch: receive peek (A), fill replenish (B), bounce to TX (C),
    /// kick and completion drain (D). Public so a harness can single-step.
    pub fn run_iteration(&mut self) {
        // Phase A: how much did the kernel give us?
        let (rcvd, idx_rx) = self.dp.rx_peek(self.cfg.rx_batch);

        // Phase B: restock the kernel with empty frames before touching the
        // batch, so reception never stalls on our processing.
        self.replenish_fill();

        // Phase C: bounce each received frame back out. Ownership moves
        // RX→TX on success, RX→pool when the TX ring is full.
        if rcvd > 0 {
            let mut idx = idx_rx;
            let mut rx_bytes: u64 = 0;

            for _ in 0..rcvd {
                let desc = self.dp.rx_desc(idx);
                idx += 1;
                rx_bytes += u64::from(desc.len);

                match self.dp.tx_reserve(1) {
                    Some(tx_idx) => {
                        self.dp.tx_set(
                            tx_idx,
                            FrameDesc {
                                addr: desc.addr,
                                len: desc.len,
                            },
                        );
                        self.dp.tx_submit(1);
                        self.outstanding_tx += 1;
                        self.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
                        self.counters
                            .tx_bytes
                            .fetch_add(u64::from(desc.len), Ordering::Relaxed);
                    }
                    None => {
                        if let Err(err) = self.pool.free(desc.addr) {
                            panic!("frame pool corrupted recycling rx frame: {}", err);
                        }
                        self.counters.tx_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            self.dp.rx_release(rcvd);
            self.counters
                .rx_packets
                .fetch_add(u64::from(rcvd), Ordering::Relaxed);
            self.counters.rx_bytes.fetch_add(rx_bytes, Ordering::Relaxed);
        }

        // Phase D
        self.complete_tx();
    }

    /// Move free frames into the Fill ring: `min(pool free, ring slots)`.
    ///
    /// Reservation is attempted a bounded number of times; on exhaustion the
    /// iteration continues with whatever partial refill succeeded rather
    /// than hanging the loop. Frames are allocated only after the reserved
    /// count is known, so none need returning.
    fn replenish_fill(&mut self) {
        let mut need = self.pool.free_count().min(self.dp.fq_free_slots());
        if need == 0 {
            return;
        }

        let (mut got, mut idx) = self.dp.fq_reserve(need);
        let mut retries: u32 = 0;
        while got == 0 {
            retries += 1;
            if retries >= MAX_FQ_RETRIES {
                warn!(
                    "fill ring reservation stalled after {} attempts, continuing without refill",
                    retries
                );
                return;
            }
            std::hint::spin_loop();

            // The kernel may have drained slots in the meantime; re-clamp.
            need = self.pool.free_count().min(self.dp.fq_free_slots());
            if need == 0 {
                return;
            }
            let r = self.dp.fq_reserve(need);
            got = r.0;
            idx = r.1;
        }

        for _ in 0..got {
            let addr = match self.pool.alloc() {
                Some(addr) => addr,
                // got ≤ pool free count and nothing else drains the pool.
                None => panic!("frame pool emptied during fill replenish"),
            };
            self.dp.fq_set(idx, addr);
            idx += 1;
        }
        self.dp.fq_submit(got);
    }

    /// Kick the kernel if transmissions are pending, then reclaim every
    /// completed frame back into the pool.
    fn complete_tx(&mut self) {
        if self.outstanding_tx > 0 {
            self.dp.kick_tx();
        }

        let (completed, mut idx) = self.dp.cq_peek(self.cfg.comp_batch);
        if completed == 0 {
            return;
        }

        if completed > self.outstanding_tx {
            panic!(
                "completion ring returned {} entries with only {} transmissions outstanding",
                completed, self.outstanding_tx
            );
        }

        for _ in 0..completed {
            let addr = self.dp.cq_addr(idx);
            idx += 1;
            if let Err(err) = self.pool.free(addr) {
                panic!("frame pool corrupted reclaiming tx frame: {}", err);
            }
        }
        self.dp.cq_release(completed);

        self.outstanding_tx -= completed;
    }

    fn should_stop(&mut self) -> bool {
        if self.stop.load(Ordering::Relaxed) {
            return true;
        }

        if let Some(limit) = self.cfg.pkt_limit {
            if self.counters.rx_packets.load(Ordering::Relaxed) >= limit {
                info!("packet limit reached ({}), shutting down", limit);
                self.stop.store(true, Ordering::Release);
                return true;
            }
        }

        if let Some(ttl) = self.cfg.ttl {
            let elapsed = self
                .started
                .map(|t| t.elapsed())
                .unwrap_or_else(|| Duration::from_secs(0));
            if elapsed >= ttl {
                info!("time to live exceeded ({:?}), shutting down", ttl);
                self.stop.store(true, Ordering::Release);
                return true;
            }
        }

        false
    }

    /// Keep draining completions until everything outstanding is back in
    /// the pool or the deadline passes. Frames still in flight after the
    /// deadline stay in the UMEM and are released with the region.
    fn drain(&mut self) {
        let deadline = Instant::now() + Duration::from_millis(DRAIN_DEADLINE_MS);

        while self.outstanding_tx > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "{} transmissions still in flight at shutdown, frames stay in the umem",
                    self.outstanding_tx
                );
                break;
            }
            self.complete_tx();
            std::hint::spin_loop();
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn outstanding_tx(&self) -> u32 {
        self.outstanding_tx
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn datapath(&self) -> &D {
        &self.dp
    }

    pub fn datapath_mut(&mut self) -> &mut D {
        &mut self.dp
    }
}
