//! Explicit hand-out/return pools for frame storage.
//!
//! An item leaves the pool as a [`Lease`] and goes back exactly once, either through
//! [`Lease::release`] or when the lease is dropped. Items are created on demand and are
//! only destroyed when the pool itself goes away.

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Items ever created by this pool.
    pub created: usize,
    /// Items sitting in the free list.
    pub available: usize,
    /// Items currently leased out.
    pub outstanding: usize,
}

struct PoolInner<T> {
    name: &'static str,
    free_tx: Sender<(u64, T)>,
    free_rx: Receiver<(u64, T)>,
    created: AtomicUsize,
    outstanding: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

pub struct Pool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Pool<T> {
    pub fn new(name: &'static str) -> Self {
        let (free_tx, free_rx) = unbounded();
        Self {
            inner: Arc::new(PoolInner {
                name,
                free_tx,
                free_rx,
                created: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Hands out a free item, or builds a new one with `create` when none is available.
    pub fn acquire_with<E>(&self, create: impl FnOnce() -> Result<T, E>) -> Result<Lease<T>, E> {
        let (id, item) = match self.inner.free_rx.try_recv() {
            Ok(entry) => entry,
            Err(_) => {
                let item = create()?;
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let created = self.inner.created.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("{} pool grew to {} items", self.inner.name, created);
                (id, item)
            }
        };

        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(Lease {
            id,
            item: Some(item),
            pool: self.inner.clone(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            available: self.inner.free_rx.len(),
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
        }
    }
}

impl<T: Send + 'static> Drop for Pool<T> {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        let destroyed = self.inner.free_rx.try_iter().count();
        debug!("{} pool torn down, destroyed {} items", self.inner.name, destroyed);
    }
}

/// Exclusive ownership of one pooled item.
pub struct Lease<T: Send + 'static> {
    id: u64,
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Lease<T> {
    /// Stable identity of the pooled item, reused across leases of the same item.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.item.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.item.as_mut()
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.item.is_none()
    }

    /// Returns the item to its pool. Returns false if it was already returned.
    pub fn release(&mut self) -> bool {
        let Some(item) = self.item.take() else {
            return false;
        };

        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        if !self.pool.closed.load(Ordering::Acquire) {
            let _ = self.pool.free_tx.send((self.id, item));
        }
        true
    }
}

impl<T: Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// CPU-side recycling of BGRA frame buffers of one fixed size.
pub struct FrameBufferPool {
    width: u32,
    height: u32,
    pool: Pool<Vec<u8>>,
}

impl FrameBufferPool {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pool: Pool::new("frame buffer"),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn buffer_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    pub fn acquire(&self) -> Lease<Vec<u8>> {
        let len = self.buffer_len();
        match self.pool.acquire_with(|| Ok::<_, std::convert::Infallible>(vec![0u8; len])) {
            Ok(lease) => lease,
            Err(never) => match never {},
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_buffers_are_reused() {
        let pool = FrameBufferPool::new(4, 2);
        let mut first = pool.acquire();
        let id = first.id();
        assert_eq!(first.get().map(Vec::len), Some(32));
        assert!(first.release());

        let second = pool.acquire();
        assert_eq!(second.id(), id);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_double_release_is_noop() {
        let pool = FrameBufferPool::new(8, 8);
        let mut lease = pool.acquire();
        assert!(lease.release());
        assert!(!lease.release());
        drop(lease);

        let stats = pool.stats();
        assert_eq!(stats.available, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_release_after_pool_dropped() {
        let pool = FrameBufferPool::new(2, 2);
        let mut lease = pool.acquire();
        drop(pool);
        assert!(lease.release());
    }

    #[test]
    fn test_concurrent_release() {
        let pool = Arc::new(FrameBufferPool::new(16, 16));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let lease = pool.acquire();
                        drop(lease);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert!(stats.created <= 4);
        assert_eq!(stats.available, stats.created);
    }

    proptest! {
        #[test]
        fn test_outstanding_leases_never_share_a_buffer(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let pool = FrameBufferPool::new(2, 2);
            let mut held: Vec<Lease<Vec<u8>>> = Vec::new();

            for acquire in ops {
                if acquire || held.is_empty() {
                    held.push(pool.acquire());
                } else {
                    let mut lease = held.swap_remove(0);
                    prop_assert!(lease.release());
                }

                let ids: HashSet<u64> = held.iter().map(Lease::id).collect();
                prop_assert_eq!(ids.len(), held.len());
                prop_assert_eq!(pool.stats().outstanding, held.len());
            }
        }
    }
}
