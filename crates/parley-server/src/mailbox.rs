//! Bounded per-connection outbound queue.
//!
//! Producers (the hub, and the session itself for error replies) never wait:
//! [`Mailbox::try_push`] either enqueues or reports why it could not. Closing
//! is a latch separate from the channel so the hub can close a mailbox while
//! it still holds a sender; the receiver then drains what was already queued
//! and yields `None`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("mailbox full")]
    Full,
    #[error("mailbox closed")]
    Closed,
}

/// Sending half. Cheap to clone; all clones share one close latch.
#[derive(Clone, Debug)]
pub struct Mailbox {
    tx: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
}

/// Receiving half, owned by the connection's outbound loop.
#[derive(Debug)]
pub struct MailboxReceiver {
    rx: mpsc::Receiver<Arc<str>>,
    closed: CancellationToken,
}

/// Create a mailbox holding at most `capacity` pending frames.
pub fn channel(capacity: usize) -> (Mailbox, MailboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    (
        Mailbox {
            tx,
            closed: closed.clone(),
        },
        MailboxReceiver { rx, closed },
    )
}

impl Mailbox {
    pub fn try_push(&self, frame: Arc<str>) -> Result<(), PushError> {
        if self.closed.is_cancelled() {
            return Err(PushError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MailboxReceiver {
    /// Next frame, or `None` once the mailbox is closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }
}
