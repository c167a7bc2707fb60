//! Fan-out of session events to N-1 connections with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Frames
//! are encoded once and shared behind an `Arc`; each frame carries the
//! connection that caused it so the gateway can skip echoing an event back
//! to its author. Each subscriber buffers up to `capacity` frames; a lagging
//! subscriber drops oldest frames rather than slowing the session down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::types::ConnectionId;

/// One pre-encoded server message on the fan-out channel.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Connection whose request produced this event. `None` for events the
    /// session generated itself (evictions, timer-driven leaves).
    pub origin: Option<ConnectionId>,
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn new(origin: Option<ConnectionId>, bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { origin, bytes })
    }
}

/// Snapshot of fan-out health for one session.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

struct AtomicStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Per-session broadcast channel. Send path is lock-free: tokio
/// broadcast::send plus atomic stats.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    capacity: usize,
    stats: Arc<AtomicStats>,
}

impl BroadcastGroup {
    /// `capacity` is the per-subscriber buffer before lag drops kick in.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicStats {
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }

    /// Send a frame to every subscriber. Returns the receiver count; zero
    /// (no subscribers) is not an error.
    pub fn send(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a subscriber lost to lag, reported by the gateway when
    /// its receiver returns `RecvError::Lagged`.
    pub fn record_lagged(&self, skipped: u64) {
        self.stats.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fan_out_reaches_all_subscribers() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        let origin = Uuid::new_v4();
        let count = group.send(Frame::new(Some(origin), vec![1, 2, 3]));
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.origin, Some(origin));
            assert_eq!(frame.bytes, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_send_without_subscribers() {
        let group = BroadcastGroup::new(16);
        assert_eq!(group.send(Frame::new(None, vec![9])), 0);
        assert_eq!(group.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_frames_are_shared_not_cloned() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();

        let frame = Frame::new(None, vec![7; 1024]);
        group.send(frame.clone());

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a, &frame));
        assert!(Arc::ptr_eq(&b, &frame));
    }

    #[tokio::test]
    async fn test_lag_stat() {
        let group = BroadcastGroup::new(16);
        group.record_lagged(3);
        group.record_lagged(2);
        assert_eq!(group.stats().frames_dropped, 5);
    }
}
