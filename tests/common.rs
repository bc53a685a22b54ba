//
// Mock kernel for driving the engine without an AF_XDP socket. The four
// rings are modelled as bounded queues with the same reserve/submit and
// peek/release discipline as the real cursor API, and the harness panics on
// any protocol violation (submitting more than reserved, releasing more
// than peeked), so every test doubles as a ring-discipline check.
//
use std::collections::VecDeque;

use xskfwd::socket::{Datapath, FrameDesc};

/// Producer-side ring: userspace reserves slots, writes them, submits.
pub struct MockProd<T: Copy + Default> {
    cap: usize,
    next_idx: u32,
    staged: VecDeque<(u32, T)>,
    pub queue: VecDeque<T>,
}

impl<T: Copy + Default> MockProd<T> {
    fn new(cap: usize) -> MockProd<T> {
        MockProd {
            cap,
            next_idx: 0,
            staged: VecDeque::new(),
            queue: VecDeque::new(),
        }
    }

    fn free_slots(&self) -> u32 {
        (self.cap - self.queue.len() - self.staged.len()) as u32
    }

    /// Partial reservations are allowed: fill-path callers must cope with
    /// getting fewer slots than they asked for.
    fn reserve(&mut self, n: u32) -> (u32, u32) {
        let got = n.min(self.free_slots());
        let idx = self.next_idx;
        for i in 0..got {
            self.staged.push_back((idx + i, T::default()));
        }
        self.next_idx += got;
        (got, idx)
    }

    fn set(&mut self, idx: u32, val: T) {
        let slot = self
            .staged
            .iter_mut()
            .find(|(i, _)| *i == idx)
            .expect("set outside an active reservation");
        slot.1 = val;
    }

    fn submit(&mut self, n: u32) {
        for _ in 0..n {
            let (_, val) = self.staged.pop_front().expect("submitted more than reserved");
            self.queue.push_back(val);
        }
    }
}

/// Consumer-side ring: userspace peeks entries, reads them, releases.
pub struct MockCons<T: Copy> {
    pub queue: VecDeque<T>,
    peeked: u32,
}

impl<T: Copy> MockCons<T> {
    fn new() -> MockCons<T> {
        MockCons {
            queue: VecDeque::new(),
            peeked: 0,
        }
    }

    fn peek(&mut self, max: u32) -> (u32, u32) {
        self.peeked = max.min(self.queue.len() as u32);
        (self.peeked, 0)
    }

    fn entry(&self, idx: u32) -> T {
        self.queue[idx as usize]
    }

    fn release(&mut self, n: u32) {
        assert!(n <= self.peeked, "released {} but peeked {}", n, self.peeked);
        for _ in 0..n {
            self.queue.pop_front().expect("released an empty ring");
        }
        self.peeked -= n;
    }
}

/// The kernel side of the four rings plus optional live behavior: with
/// `auto_rx` it moves fill frames onto the RX ring as arriving packets, and
/// with `auto_complete` a TX kick transmits everything pending.
pub struct MockKernel {
    pub fill: MockProd<u64>,
    pub tx: MockProd<FrameDesc>,
    pub rx: MockCons<FrameDesc>,
    pub comp: MockCons<u64>,

    pub auto_rx: bool,
    pub auto_rx_len: u32,
    pub auto_complete: bool,

    pub kicks: u64,
    pub waits: u64,
}

impl MockKernel {
    pub fn new(fill_cap: usize, tx_cap: usize) -> MockKernel {
        MockKernel {
            fill: MockProd::new(fill_cap),
            tx: MockProd::new(tx_cap),
            rx: MockCons::new(),
            comp: MockCons::new(),
            auto_rx: false,
            auto_rx_len: 64,
            auto_complete: false,
            kicks: 0,
            waits: 0,
        }
    }

    /// Simulate packet arrival into a specific frame, as if the kernel had
    /// written `len` bytes into it. The caller owns `addr` (it must not be
    /// in the pool or any other ring).
    pub fn feed_rx(&mut self, addr: u64, len: u32) {
        self.rx.queue.push_back(FrameDesc { addr, len });
    }

    /// Simulate arrival the way the real kernel does it: take the oldest
    /// fill-ring frame and present it on RX.
    pub fn deliver(&mut self, len: u32) -> Option<u64> {
        let addr = self.fill.queue.pop_front()?;
        self.rx.queue.push_back(FrameDesc { addr, len });
        Some(addr)
    }

    /// Finish up to `n` pending transmissions, moving their frames onto the
    /// Completion ring.
    pub fn complete_tx(&mut self, n: usize) -> usize {
        let mut done = 0;
        while done < n {
            match self.tx.queue.pop_front() {
                Some(desc) => {
                    self.comp.queue.push_back(desc.addr);
                    done += 1;
                }
                None => break,
            }
        }
        done
    }

    /// Every frame address currently owned by the mock kernel, over all four
    /// rings (including reservations in flight). Used for ownership audits.
    pub fn held_frames(&self) -> Vec<u64> {
        let mut all: Vec<u64> = Vec::new();
        all.extend(self.fill.queue.iter().copied());
        all.extend(self.fill.staged.iter().map(|(_, a)| *a));
        all.extend(self.rx.queue.iter().map(|d| d.addr));
        all.extend(self.tx.queue.iter().map(|d| d.addr));
        all.extend(self.tx.staged.iter().map(|(_, d)| d.addr));
        all.extend(self.comp.queue.iter().copied());
        all
    }

    /// Frames attributable to outstanding transmissions: on the TX ring or
    /// the Completion ring.
    pub fn in_flight_tx(&self) -> usize {
        self.tx.queue.len() + self.tx.staged.len() + self.comp.queue.len()
    }
}

impl Datapath for MockKernel {
    fn rx_peek(&mut self, max: u32) -> (u32, u32) {
        if self.auto_rx {
            let len = self.auto_rx_len;
            for _ in 0..max {
                if self.deliver(len).is_none() {
                    break;
                }
            }
        }
        self.rx.peek(max)
    }

    fn rx_desc(&mut self, idx: u32) -> FrameDesc {
        self.rx.entry(idx)
    }

    fn rx_release(&mut self, n: u32) {
        self.rx.release(n);
    }

    fn tx_reserve(&mut self, n: u32) -> Option<u32> {
        // TX reservations are all-or-nothing, like libbpf.
        if self.tx.free_slots() < n {
            return None;
        }
        let (got, idx) = self.tx.reserve(n);
        assert_eq!(got, n);
        Some(idx)
    }

    fn tx_set(&mut self, idx: u32, desc: FrameDesc) {
        self.tx.set(idx, desc);
    }

    fn tx_submit(&mut self, n: u32) {
        self.tx.submit(n);
    }

    fn fq_free_slots(&mut self) -> u32 {
        self.fill.free_slots()
    }

    fn fq_reserve(&mut self, n: u32) -> (u32, u32) {
        self.fill.reserve(n)
    }

    fn fq_set(&mut self, idx: u32, addr: u64) {
        self.fill.set(idx, addr);
    }

    fn fq_submit(&mut self, n: u32) {
        self.fill.submit(n);
    }

    fn cq_peek(&mut self, max: u32) -> (u32, u32) {
        self.comp.peek(max)
    }

    fn cq_addr(&mut self, idx: u32) -> u64 {
        self.comp.entry(idx)
    }

    fn cq_release(&mut self, n: u32) {
        self.comp.release(n);
    }

    fn kick_tx(&mut self) {
        self.kicks += 1;
        if self.auto_complete {
            let pending = self.tx.queue.len();
            self.complete_tx(pending);
        }
    }

    fn wait_rx(&mut self, _timeout_ms: i32) -> bool {
        self.waits += 1;
        !self.rx.queue.is_empty()
    }
}
