//! Connection plumbing shared by the stream and datagram transports: lifecycle
//!  states, the observer seam events are delivered through, the in-flight
//!  operation gate that serializes teardown, and the process-wide resources
//!  connections draw from.

use crate::buffers::buffer_pool::SendBufferPool;
use crate::config::TempestConfig;
use crate::messages::DisconnectReason;
use crate::protocol::{Message, MessageHeader};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
    Disconnected,
}

/// A received (or sent) message together with its connection context.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub connection_id: u32,
    pub peer_addr: SocketAddr,
    pub message: Arc<dyn Message>,
    pub header: MessageHeader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub connection_id: u32,
    pub peer_addr: SocketAddr,
    pub reason: DisconnectReason,
    pub custom_reason: Option<String>,
}

/// Capability object through which a connection reports what happens to it.
///
/// `on_message_sent` fires after the socket has taken the bytes, and never for
///  internal control messages. `on_disconnected` fires exactly once per
///  connection, with the first observed reason.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionObserver: Send + Sync + 'static {
    async fn on_message(&self, event: MessageEvent);

    async fn on_message_sent(&self, event: MessageEvent);

    async fn on_disconnected(&self, event: DisconnectEvent);
}

/// The user-facing surface both transports provide.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn connection_id(&self) -> u32;

    fn is_connected(&self) -> bool;

    fn remote_target(&self) -> SocketAddr;

    /// most recent Ping/Pong round trip, if one completed
    fn response_time(&self) -> Option<Duration>;

    async fn send(&self, message: Arc<dyn Message>) -> anyhow::Result<()>;

    async fn disconnect(&self, now: bool, reason: DisconnectReason, custom_reason: Option<String>);
}

/// Counts in-flight asynchronous operations of a connection.
///
/// Every submission acquires a guard before the operation starts, and the guard
///  release in its completion path is what allows teardown to proceed: `dispose`
///  waits here until nothing is in flight any more.
pub struct PendingOps {
    count: AtomicUsize,
    changed: Notify,
}

impl PendingOps {
    pub fn new() -> PendingOps {
        PendingOps {
            count: AtomicUsize::new(0),
            changed: Notify::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn acquire(self: &Arc<Self>) -> PendingOpGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        PendingOpGuard { ops: self.clone() }
    }

    pub async fn wait_until_at_most(&self, max: usize) {
        loop {
            // register interest before checking to avoid losing a wakeup
            let changed = self.changed.notified();
            if self.count() <= max {
                return;
            }
            changed.await;
        }
    }
}

impl Default for PendingOps {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PendingOpGuard {
    ops: Arc<PendingOps>,
}

impl Drop for PendingOpGuard {
    fn drop(&mut self) {
        self.ops.count.fetch_sub(1, Ordering::AcqRel);
        self.ops.changed.notify_waiters();
    }
}

/// Ping/Pong bookkeeping: the timestamp of the last ping sent, the measured
///  round trip, and how many pings are outstanding.
pub struct PingTracker {
    last_ping_sent: Option<Instant>,
    response_time: Option<Duration>,
    pings_out: u32,
}

impl PingTracker {
    pub fn new() -> PingTracker {
        PingTracker {
            last_ping_sent: None,
            response_time: None,
            pings_out: 0,
        }
    }

    pub fn on_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.pings_out += 1;
    }

    pub fn on_pong_received(&mut self) {
        if let Some(sent) = self.last_ping_sent {
            self.response_time = Some(sent.elapsed());
        }
        self.pings_out = 0;
    }

    pub fn response_time(&self) -> Option<Duration> {
        self.response_time
    }

    pub fn pings_out(&self) -> u32 {
        self.pings_out
    }
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide mutable state, passed explicitly to connection constructors so
///  tests can substitute a fresh instance: the send-buffer pool and the
///  connection id source.
pub struct SharedResources {
    pub buffer_pool: SendBufferPool,
    next_connection_id: AtomicU32,
}

impl SharedResources {
    pub fn new(config: &TempestConfig) -> Arc<SharedResources> {
        Arc::new(SharedResources {
            buffer_pool: SendBufferPool::new(config.send_buffer_capacity, config.buffer_limit),
            next_connection_id: AtomicU32::new(1),
        })
    }

    pub fn next_connection_id(&self) -> u32 {
        self.next_connection_id.fetch_add(1, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_ops_counts_guards() {
        let ops = Arc::new(PendingOps::new());
        assert_eq!(ops.count(), 0);

        let g1 = ops.acquire();
        let g2 = ops.acquire();
        assert_eq!(ops.count(), 2);

        drop(g1);
        assert_eq!(ops.count(), 1);
        drop(g2);
        assert_eq!(ops.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_until_at_most_blocks_until_released() {
        let ops = Arc::new(PendingOps::new());
        let guard = ops.acquire();

        let ops2 = ops.clone();
        let waiter = tokio::spawn(async move { ops2.wait_until_at_most(0).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[test]
    fn test_ping_tracker_measures_round_trip() {
        let mut tracker = PingTracker::new();
        assert_eq!(tracker.response_time(), None);

        tracker.on_ping_sent();
        assert_eq!(tracker.pings_out(), 1);

        tracker.on_pong_received();
        assert_eq!(tracker.pings_out(), 0);
        assert!(tracker.response_time().is_some());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let shared = SharedResources::new(&TempestConfig::default());
        let a = shared.next_connection_id();
        let b = shared.next_connection_id();
        assert_ne!(a, b);
    }
}
