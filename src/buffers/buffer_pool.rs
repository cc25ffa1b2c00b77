//! Process-wide pool of send buffers.
//!
//! Buffers are checked out for a single send operation and returned on
//!  completion. The total number of live buffers is capped: once the cap is
//!  reached and the pool is empty, `acquire` waits until another sender
//!  returns a buffer. This cap is the sole send-side backpressure mechanism.

use crate::buffers::wire::WireWriter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

pub struct SendBufferPool {
    buf_capacity: usize,
    buffers: Mutex<Vec<WireWriter>>,
    /// number of buffers currently in existence (pooled or checked out),
    ///  advanced via compare-and-swap up to `limit`
    allocated: AtomicUsize,
    limit: usize,
    returned: Notify,
}

impl SendBufferPool {
    pub fn new(buf_capacity: usize, limit: usize) -> SendBufferPool {
        assert!(limit > 0);
        SendBufferPool {
            buf_capacity,
            buffers: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            limit,
            returned: Notify::new(),
        }
    }

    pub fn num_allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub async fn acquire(&self) -> WireWriter {
        loop {
            {
                let mut buffers = self.buffers.lock().unwrap();
                if let Some(buffer) = buffers.pop() {
                    trace!("returning buffer from pool");
                    return buffer;
                }
            }

            if self.try_reserve_slot() {
                debug!("no buffer in pool: creating new buffer");
                return WireWriter::with_capacity(self.buf_capacity);
            }

            // the pool is exhausted and at its limit - wait for a buffer to come back.
            // NB: register for notification *before* re-checking to avoid losing a wakeup
            let notified = self.returned.notified();
            if self.buffers.lock().unwrap().is_empty() {
                debug!("send buffer pool exhausted at limit {} - waiting for a returned buffer", self.limit);
                notified.await;
            }
        }
    }

    fn try_reserve_slot(&self) -> bool {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < self.limit {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    pub fn release(&self, mut buffer: WireWriter) {
        buffer.clear();
        self.buffers.lock().unwrap().push(buffer);
        self.returned.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_release_reuses_buffer() {
        let pool = SendBufferPool::new(32, 4);

        let mut buf = pool.acquire().await;
        buf.put_slice(b"abc");
        assert_eq!(pool.num_allocated(), 1);

        pool.release(buf);
        let buf = pool.acquire().await;
        assert!(buf.is_empty());
        assert_eq!(pool.num_allocated(), 1);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_limit() {
        let pool = Arc::new(SendBufferPool::new(32, 1));

        let held = pool.acquire().await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(held);
        waiter.await.unwrap();
        assert_eq!(pool.num_allocated(), 1);
    }
}
