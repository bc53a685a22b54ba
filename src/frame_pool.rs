use thiserror::Error;

/// Stack-based free list of UMEM frame addresses.
///
/// Addresses are byte offsets into the UMEM buffer, always a multiple of the
/// frame size. The pool is owned by exactly one task so there is no locking;
/// alloc and free are plain Vec push/pop. LIFO keeps recently used frames
/// cache-warm, and the kernel attaches no meaning to frame order.
#[derive(Debug)]
pub struct FramePool {
    free: Vec<u64>,
    capacity: u32,
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Freeing would exceed capacity. A frame address was handed back twice,
    /// which means ownership tracking is broken somewhere upstream.
    #[error("pool overflow freeing frame {addr:#x}: all {capacity} frames already free")]
    Overflow { addr: u64, capacity: u32 },
}

impl FramePool {
    /// Pool over `n_frames` frames of `frame_size` bytes each, all free.
    pub fn new(n_frames: u32, frame_size: u32) -> FramePool {
        let mut free = Vec::with_capacity(n_frames as usize);
        for i in 0..n_frames {
            free.push(u64::from(i) * u64::from(frame_size));
        }

        FramePool {
            free,
            capacity: n_frames,
        }
    }

    /// Pop the most recently freed frame, or `None` when the pool is empty.
    #[inline]
    pub fn alloc(&mut self) -> Option<u64> {
        self.free.pop()
    }

    /// Return a frame to the pool. Only addresses previously handed out by
    /// the kernel (an RX descriptor or a completion entry) may be freed.
    #[inline]
    pub fn free(&mut self, addr: u64) -> Result<(), PoolError> {
        if self.free.len() == self.capacity as usize {
            return Err(PoolError::Overflow {
                addr,
                capacity: self.capacity,
            });
        }
        self.free.push(addr);

        Ok(())
    }

    #[inline]
    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The current free list, for ownership audits in tests and teardown
    /// diagnostics. Top of the stack is last.
    pub fn free_list(&self) -> &[u64] {
        &self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: u32 = 2048;

    #[test]
    fn starts_full_with_distinct_addresses() {
        let pool = FramePool::new(64, FRAME);
        assert_eq!(pool.free_count(), 64);
        assert_eq!(pool.capacity(), 64);

        let mut seen: Vec<u64> = pool.free_list().to_vec();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 64);
        assert_eq!(seen[0], 0);
        assert_eq!(seen[63], 63 * u64::from(FRAME));
    }

    #[test]
    fn lifo_order() {
        let mut pool = FramePool::new(4, FRAME);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);

        pool.free(a).unwrap();
        pool.free(b).unwrap();

        // Most recently freed comes back first.
        assert_eq!(pool.alloc().unwrap(), b);
        assert_eq!(pool.alloc().unwrap(), a);
    }

    #[test]
    fn conservation_over_mixed_sequences() {
        let mut pool = FramePool::new(32, FRAME);
        let mut held = Vec::new();

        // Deterministic but irregular walk over alloc/free.
        for step in 0..1000u32 {
            if step % 3 != 0 || held.is_empty() {
                if let Some(addr) = pool.alloc() {
                    assert!(!held.contains(&addr), "frame {:#x} handed out twice", addr);
                    held.push(addr);
                }
            } else {
                let addr = held.swap_remove((step as usize * 7) % held.len());
                pool.free(addr).unwrap();
            }
            assert_eq!(
                pool.free_count() as usize + held.len(),
                32,
                "frames leaked or duplicated at step {}",
                step
            );
        }
    }

    #[test]
    fn alloc_exhausted_returns_none() {
        let mut pool = FramePool::new(2, FRAME);
        assert!(pool.alloc().is_some());
        assert!(pool.alloc().is_some());
        assert!(pool.alloc().is_none());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut pool = FramePool::new(2, FRAME);
        let r = pool.free(0);
        match r {
            Err(PoolError::Overflow { addr: 0, capacity: 2 }) => {}
            other => panic!("expected overflow, got {:?}", other),
        }
        // The failed free must not have grown the list.
        assert_eq!(pool.free_count(), 2);
    }
}
