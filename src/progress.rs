//! Hand-off of progress events from the copy worker to the foreground.
//!
//! The worker runs the blocking [`SyncRun`] on tokio's blocking pool and
//! pushes each event into an unbounded channel; sending never waits. The
//! foreground polls the receiving half with [`ProgressReceiver::try_next`]
//! on a short timer so it never blocks on disk I/O. Events are small and a
//! run is short, so the buffer is left unbounded.

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::{SyncError, SyncResult};
use crate::sync_engine::{ProgressEvent, SyncRun};

/// Result of one non-blocking poll of the channel.
#[derive(Debug)]
pub enum Received {
    Event(ProgressEvent),
    /// The run hit a fatal error. Nothing follows.
    Failed(SyncError),
    /// Nothing queued right now.
    Empty,
    /// The producer is gone and the queue is drained.
    Closed,
}

pub struct ProgressSender {
    tx: mpsc::UnboundedSender<SyncResult<ProgressEvent>>,
}

impl ProgressSender {
    /// Queues a message. Returns false once the receiver has been dropped.
    pub fn send(&self, message: SyncResult<ProgressEvent>) -> bool {
        self.tx.send(message).is_ok()
    }
}

pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<SyncResult<ProgressEvent>>,
}

impl ProgressReceiver {
    pub fn try_next(&mut self) -> Received {
        match self.rx.try_recv() {
            Ok(Ok(event)) => Received::Event(event),
            Ok(Err(e)) => Received::Failed(e),
            Err(TryRecvError::Empty) => Received::Empty,
            Err(TryRecvError::Disconnected) => Received::Closed,
        }
    }
}

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressReceiver { rx })
}

/// Drives `run` to the end on the blocking pool, forwarding every message.
/// The sender is dropped when the run ends, which the receiver observes as
/// [`Received::Closed`].
pub fn spawn_producer(run: SyncRun, sender: ProgressSender) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        for message in run {
            if !sender.send(message) {
                debug!("progress receiver dropped, stopping producer");
                break;
            }
        }
    })
}
