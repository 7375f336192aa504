use std::sync::{
    Arc, Weak,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

/// Fixed-size receive buffers shared between the read loop and flow
/// consumers. A buffer travels back here when its guard drops, wherever
/// that happens.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    block_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(block_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                block_size,
                free: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Takes a full-length buffer, reusing a returned one when available.
    pub fn get(&self) -> PooledBuf {
        let mut data = self.inner.free.lock().pop().unwrap_or_default();
        data.clear();
        data.resize(self.inner.block_size, 0);
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            data,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Buffers currently held outside the pool.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers parked and ready for reuse.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A pool-owned buffer; returns to its pool on drop.
#[derive(Debug)]
pub struct PooledBuf {
    data: Vec<u8>,
    pool: Weak<PoolInner>,
}

impl PooledBuf {
    /// Shrinks the readable window to the received length.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.outstanding.fetch_sub(1, Ordering::Relaxed);
            pool.free.lock().push(std::mem::take(&mut self.data));
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn buffers_are_handed_out_at_block_size() {
        let pool = BufferPool::new(1500);
        let buf = pool.get();
        assert_eq!(buf.len(), 1500);
    }

    #[test]
    fn dropped_buffer_is_reused() {
        let pool = BufferPool::new(64);
        let buf = pool.get();
        assert_eq!(pool.outstanding(), 1);
        drop(buf);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);

        // Reuse restores full length even after truncation.
        let mut buf = pool.get();
        buf.truncate(3);
        drop(buf);
        let buf = pool.get();
        assert_eq!(buf.len(), 64);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn late_drop_after_pool_is_gone_is_harmless() {
        let pool = BufferPool::new(16);
        let buf = pool.get();
        drop(pool);
        drop(buf);
    }

    proptest! {
        // Random hold/truncate/release traces never leak: every buffer
        // handed out is accounted for again once dropped.
        #[test]
        fn no_leaks_under_random_traces(ops in prop::collection::vec((any::<bool>(), 0usize..2000), 1..64)) {
            let pool = BufferPool::new(1500);
            let mut held = Vec::new();
            for (release, len) in ops {
                let mut buf = pool.get();
                buf.truncate(len.min(1500));
                if release {
                    drop(buf);
                } else {
                    held.push(buf);
                }
            }
            prop_assert_eq!(pool.outstanding(), held.len());
            held.clear();
            prop_assert_eq!(pool.outstanding(), 0);
        }
    }
}
