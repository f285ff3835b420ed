//! Watch stream support.
//!
//! Backends push ordered [`WatchBatch`]es through a [`WatchSender`]; callers
//! consume them as a `futures::Stream`. Dropping every sender ends the stream,
//! which is how a lost connection is reported.

use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::types::{Revision, WatchBatch};

pin_project! {
    /// Stream of change batches for a watched prefix.
    pub struct WatchStream {
        #[pin]
        receiver: mpsc::UnboundedReceiver<WatchBatch>,
        // Highest revision delivered so far
        last_revision: Option<Revision>,
        // Whether the backend side has gone away
        closed: bool,
    }
}

impl WatchStream {
    /// Create a new watch stream.
    pub fn new(receiver: mpsc::UnboundedReceiver<WatchBatch>) -> Self {
        Self {
            receiver,
            last_revision: None,
            closed: false,
        }
    }

    /// Create a sender/stream pair.
    pub fn channel() -> (WatchSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WatchSender { sender: tx }, Self::new(rx))
    }

    /// Highest revision delivered so far.
    pub fn last_revision(&self) -> Option<Revision> {
        self.last_revision
    }

    /// Whether the stream has ended.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Stream for WatchStream {
    type Item = WatchBatch;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(batch)) => {
                if let Some(rev) = batch.last_revision() {
                    *this.last_revision = Some(rev);
                }
                Poll::Ready(Some(batch))
            }
            Poll::Ready(None) => {
                *this.closed = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Backend-side handle for a watch stream.
#[derive(Debug, Clone)]
pub struct WatchSender {
    sender: mpsc::UnboundedSender<WatchBatch>,
}

impl WatchSender {
    /// Deliver a batch. Fails once the consumer has dropped the stream.
    pub fn send(&self, batch: WatchBatch) -> Result<(), WatchClosed> {
        self.sender.send(batch).map_err(|_| WatchClosed)
    }

    /// Whether the consumer has dropped the stream.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// The consumer side of a watch is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Watch stream closed")]
pub struct WatchClosed;
