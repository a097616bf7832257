//! Per-connection send queue with watermarks.
//!
//! The producer (the transfer engine) enqueues plaintext records without
//! blocking and learns from the return value when the queue has hit the
//! high watermark — its cue to cork that peer. The consumer (the writer
//! task) dequeues in FIFO order and reports the moment the depth crosses
//! back below the low watermark, which uncorks the peer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Queue depth at which `enqueue` starts reporting "cork".
pub const HIGH_WATERMARK: usize = 100;

/// Depth whose downward crossing raises the queue-empty signal.
pub const LOW_WATERMARK: usize = 10;

/// Records written per writer wake before yielding to other connections.
pub const MAX_BUFFERS_TO_SEND: usize = 10;

/// Producer half. Cloned into every worker that may send to this peer.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<Bytes>,
    depth: Arc<AtomicUsize>,
}

impl SendQueue {
    pub fn new() -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                depth: depth.clone(),
            },
            QueueReceiver { rx, depth },
        )
    }

    /// Enqueue one plaintext record. Returns true when the queue is at or
    /// above the high watermark — the producer should cork until the
    /// queue-empty signal. A dead connection swallows the record; teardown
    /// is reported through the session events, not here.
    pub fn enqueue(&self, record: Bytes) -> bool {
        if self.tx.send(record).is_err() {
            return false;
        }
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        depth >= HIGH_WATERMARK
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Consumer half, owned by the connection's writer task.
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
    depth: Arc<AtomicUsize>,
}

impl QueueReceiver {
    /// Next record plus whether this dequeue crossed below the low
    /// watermark (the uncork edge, raised once per crossing).
    pub async fn recv(&mut self) -> Option<(Bytes, bool)> {
        let record = self.rx.recv().await?;
        let before = self.depth.fetch_sub(1, Ordering::Relaxed);
        Some((record, before == LOW_WATERMARK))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cork_at_high_watermark() {
        let (queue, _rx) = SendQueue::new();
        for i in 1..HIGH_WATERMARK {
            assert!(!queue.enqueue(Bytes::from(vec![0u8; 8])), "item {i}");
        }
        assert!(queue.enqueue(Bytes::from(vec![0u8; 8])));
        // Still corked while above the mark.
        assert!(queue.enqueue(Bytes::from(vec![0u8; 8])));
    }

    #[tokio::test]
    async fn uncork_signal_on_low_watermark_crossing() {
        let (queue, mut rx) = SendQueue::new();
        for _ in 0..HIGH_WATERMARK {
            queue.enqueue(Bytes::from_static(b"x"));
        }

        let mut crossings = 0;
        for expected_before in (1..=HIGH_WATERMARK).rev() {
            let (_, crossed) = rx.recv().await.unwrap();
            if crossed {
                crossings += 1;
                assert_eq!(expected_before, LOW_WATERMARK);
            }
        }
        assert_eq!(crossings, 1);
    }

    #[tokio::test]
    async fn fifo_order() {
        let (queue, mut rx) = SendQueue::new();
        for i in 0..5u8 {
            queue.enqueue(Bytes::from(vec![i]));
        }
        for i in 0..5u8 {
            let (record, _) = rx.recv().await.unwrap();
            assert_eq!(record[0], i);
        }
    }

    #[tokio::test]
    async fn shallow_queue_never_signals() {
        let (queue, mut rx) = SendQueue::new();
        for _ in 0..5 {
            queue.enqueue(Bytes::from_static(b"x"));
        }
        for _ in 0..5 {
            let (_, crossed) = rx.recv().await.unwrap();
            assert!(!crossed);
        }
        assert_eq!(queue.depth(), 0);
    }
}
