//! Per-thread message queue.
//!
//! Messages are delivered in FIFO order. "Version changed" signals are
//! coalesced: while one is queued and not yet received, further signals are
//! dropped. The flag is cleared when the receiver takes the signal, before
//! it acts on it, so a commit published after that point always produces a
//! new signal.

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A queued message.
#[derive(Debug)]
pub enum Envelope<P> {
    /// A newer version of some file was committed.
    VersionChanged,
    Payload(P),
}

/// Receiving end, owned by the destination thread.
pub struct Mailbox<P> {
    sender: Sender<Envelope<P>>,
    receiver: Receiver<Envelope<P>>,
    version_pending: Arc<AtomicBool>,
}

/// Sending end; cheap to clone and usable from any thread.
pub struct MailboxSender<P> {
    sender: Sender<Envelope<P>>,
    version_pending: Arc<AtomicBool>,
}

impl<P> Clone for MailboxSender<P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            version_pending: Arc::clone(&self.version_pending),
        }
    }
}

impl<P> Default for Mailbox<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Mailbox<P> {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender,
            receiver,
            version_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a sender for this mailbox.
    pub fn sender(&self) -> MailboxSender<P> {
        MailboxSender {
            sender: self.sender.clone(),
            version_pending: Arc::clone(&self.version_pending),
        }
    }

    fn received(&self, envelope: Envelope<P>) -> Envelope<P> {
        if matches!(envelope, Envelope::VersionChanged) {
            self.version_pending.store(false, Ordering::Release);
        }
        envelope
    }

    /// Takes the next message without blocking.
    pub fn try_recv(&self) -> Option<Envelope<P>> {
        match self.receiver.try_recv() {
            Ok(envelope) => Some(self.received(envelope)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for the next message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Envelope<P>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(envelope) => Some(self.received(envelope)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Returns the number of queued messages.
    #[inline]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl<P> MailboxSender<P> {
    /// Queues a "version changed" signal unless one is already pending.
    /// Returns true if a signal was queued.
    pub fn signal_version_changed(&self) -> bool {
        if self.version_pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.sender.send(Envelope::VersionChanged).is_err() {
            self.version_pending.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Queues a payload. Returns false if the mailbox is gone.
    pub fn post(&self, payload: P) -> bool {
        self.sender.send(Envelope::Payload(payload)).is_ok()
    }

    /// Returns true if both senders feed the same mailbox.
    pub fn same_mailbox(&self, other: &MailboxSender<P>) -> bool {
        Arc::ptr_eq(&self.version_pending, &other.version_pending)
    }
}
