use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick};

use crate::engine::{Counters, CounterSnapshot};

/// Per-interval rates derived from two counter snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rates {
    pub rx_pps: f64,
    pub rx_mbps: f64,
    pub tx_pps: f64,
    pub tx_mbps: f64,
}

impl Rates {
    fn compute(prev: &CounterSnapshot, cur: &CounterSnapshot, mut secs: f64) -> Rates {
        if secs <= 0.0 {
            secs = 1.0;
        }

        Rates {
            rx_pps: (cur.rx_packets - prev.rx_packets) as f64 / secs,
            rx_mbps: ((cur.rx_bytes - prev.rx_bytes) * 8) as f64 / (secs * 1_000_000.0),
            tx_pps: (cur.tx_packets - prev.tx_packets) as f64 / secs,
            tx_mbps: ((cur.tx_bytes - prev.tx_bytes) * 8) as f64 / (secs * 1_000_000.0),
        }
    }
}

/// Periodic reader of the engine's counter block. Snapshots on every tick,
/// prints RX and TX rates, and exits once it observes the stop flag. It
/// never writes engine state; the counters are read with plain atomic
/// loads, so a snapshot is never torn.
pub struct StatsReporter;

impl StatsReporter {
    pub fn spawn(
        counters: Arc<Counters>,
        stop: Arc<AtomicBool>,
        interval: Duration,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let ticker = tick(interval);
            let mut prev = counters.snapshot();
            let mut prev_at = Instant::now();

            loop {
                select! {
                    recv(ticker) -> _ => {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }

                        let now = Instant::now();
                        let cur = counters.snapshot();
                        let rates = Rates::compute(&prev, &cur, (now - prev_at).as_secs_f64());

                        println!(
                            "AF_XDP RX: {:>11} pkts ({:>10.0} pps) {:>11} Kbytes ({:>6.0} Mbit/s)",
                            cur.rx_packets,
                            rates.rx_pps,
                            cur.rx_bytes / 1000,
                            rates.rx_mbps
                        );
                        println!(
                            "       TX: {:>11} pkts ({:>10.0} pps) {:>11} Kbytes ({:>6.0} Mbit/s) drops {}",
                            cur.tx_packets,
                            rates.tx_pps,
                            cur.tx_bytes / 1000,
                            rates.tx_mbps,
                            cur.tx_dropped
                        );

                        prev = cur;
                        prev_at = now;
                    }
                }
            }
        })
    }
}
