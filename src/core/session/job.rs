//! Outbound jobs and the bounded per-session queue that carries them.
//!
//! Each session owns one [`Outbox`]: many producers (its own reader's acks,
//! router fan-out, takeover disconnects) and exactly one consumer, the
//! session's writer task.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time;

use crate::core::error::EnqueueError;
use crate::core::packet::Packet;

/// One outbound packet, optionally paired with a completion signal.
#[derive(Debug)]
pub struct Job {
    pub packet: Packet,
    receipt: Option<oneshot::Sender<()>>,
}

impl Job {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            receipt: None,
        }
    }

    /// Creates a job whose [`Receipt`] resolves once the writer has tried to
    /// send it.
    pub fn with_receipt(packet: Packet) -> (Self, Receipt) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                packet,
                receipt: Some(tx),
            },
            Receipt(rx),
        )
    }

    /// Splits the job so the writer can signal the receipt after the write
    /// attempt, whatever its outcome.
    pub fn into_parts(self) -> (Packet, Option<oneshot::Sender<()>>) {
        (self.packet, self.receipt)
    }
}

/// Resolves when the paired job was written, failed to write, or was dropped
/// unsent because its writer went away.
#[derive(Debug)]
pub struct Receipt(oneshot::Receiver<()>);

impl Receipt {
    pub async fn wait(self) {
        let _ = self.0.await;
    }

    /// Waits at most `limit`. Returns `false` on timeout.
    pub async fn wait_timeout(self, limit: Duration) -> bool {
        time::timeout(limit, self.wait()).await.is_ok()
    }
}

/// Producer side of a session's bounded outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: flume::Sender<Job>,
}

impl Outbox {
    /// Creates a queue holding at most `capacity` jobs (minimum 1).
    pub fn channel(capacity: usize) -> (Self, flume::Receiver<Job>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Non-blocking enqueue. A full queue rejects the job instead of waiting.
    pub fn submit(&self, packet: Packet) -> Result<(), EnqueueError> {
        self.tx.try_send(Job::new(packet)).map_err(|e| match e {
            flume::TrySendError::Full(_) => EnqueueError::Full,
            flume::TrySendError::Disconnected(_) => EnqueueError::Closed,
        })
    }

    /// Enqueues `packet`, waiting for room if the queue is full, and returns a
    /// receipt for its delivery.
    pub async fn submit_sync(&self, packet: Packet) -> Result<Receipt, EnqueueError> {
        let (job, receipt) = Job::with_receipt(packet);
        self.tx
            .send_async(job)
            .await
            .map_err(|_| EnqueueError::Closed)?;
        Ok(receipt)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (outbox, rx) = Outbox::channel(2);
        outbox.submit(Packet::Pingresp).unwrap();
        outbox.submit(Packet::Pingresp).unwrap();
        assert!(matches!(
            outbox.submit(Packet::Pingresp),
            Err(EnqueueError::Full)
        ));
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn closed_queue_reports_closed() {
        let (outbox, rx) = Outbox::channel(2);
        drop(rx);
        assert!(matches!(
            outbox.submit(Packet::Pingresp),
            Err(EnqueueError::Closed)
        ));
    }

    #[test]
    fn zero_capacity_is_bumped_to_one() {
        let (outbox, _rx) = Outbox::channel(0);
        assert_eq!(outbox.capacity(), 1);
        outbox.submit(Packet::Pingresp).unwrap();
    }

    #[tokio::test]
    async fn receipt_resolves_after_signal() {
        let (outbox, rx) = Outbox::channel(1);
        let receipt = outbox.submit_sync(Packet::Disconnect).await.unwrap();

        let job = rx.recv_async().await.unwrap();
        let (packet, signal) = job.into_parts();
        assert_eq!(packet, Packet::Disconnect);
        signal.unwrap().send(()).unwrap();

        assert!(receipt.wait_timeout(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn receipt_resolves_when_job_is_dropped_unsent() {
        let (outbox, rx) = Outbox::channel(1);
        let receipt = outbox.submit_sync(Packet::Disconnect).await.unwrap();
        drop(rx.try_recv().unwrap());
        assert!(receipt.wait_timeout(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn receipt_times_out_when_nobody_writes() {
        let (outbox, _rx) = Outbox::channel(1);
        let receipt = outbox.submit_sync(Packet::Disconnect).await.unwrap();
        assert!(!receipt.wait_timeout(Duration::from_millis(20)).await);
    }
}
