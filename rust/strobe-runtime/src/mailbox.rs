//! Mailbox: MPSC queue funnelling work onto the loop thread.
//!
//! Core structures are single-threaded. Producers doing I/O on worker threads
//! hold a [`MailboxSender`] and post messages; the loop thread drains the
//! [`Mailbox`] at a point of its choosing and applies them.
//!
//! # Example
//!
//! ```rust
//! use strobe_runtime::mailbox::Mailbox;
//!
//! let (sender, mailbox) = Mailbox::<String>::unbounded();
//! std::thread::spawn(move || sender.send("hello".to_string()).unwrap())
//!     .join()
//!     .unwrap();
//! assert_eq!(mailbox.recv(), Some("hello".to_string()));
//! assert!(mailbox.is_empty());
//! ```

use crossbeam_channel::{self as cb};
use std::fmt;

/// Error returned when sending into a mailbox whose receiver was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxSendError<T>(pub T);

impl<T> fmt::Display for MailboxSendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mailbox send failed: receiver has been dropped")
    }
}

impl<T: fmt::Debug> std::error::Error for MailboxSendError<T> {}

/// The sending half of a mailbox. Cheap to clone and `Send` when `T` is.
pub struct MailboxSender<T> {
    inner: cb::Sender<T>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for MailboxSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxSender")
            .field("pending", &self.inner.len())
            .finish()
    }
}

impl<T> MailboxSender<T> {
    /// Non-blocking send.
    pub fn send(&self, msg: T) -> Result<(), MailboxSendError<T>> {
        self.inner.send(msg).map_err(|e| MailboxSendError(e.0))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// The receiving half, owned by the loop thread.
pub struct Mailbox<T> {
    inner: cb::Receiver<T>,
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &self.inner.len())
            .finish()
    }
}

impl<T> Mailbox<T> {
    pub fn unbounded() -> (MailboxSender<T>, Self) {
        let (tx, rx) = cb::unbounded();
        (MailboxSender { inner: tx }, Self { inner: rx })
    }

    /// Non-blocking receive.
    pub fn recv(&self) -> Option<T> {
        self.inner.try_recv().ok()
    }

    /// Take every message buffered right now, in send order. Messages sent
    /// while draining are left for the next call.
    pub fn drain(&self) -> Vec<T> {
        let available = self.inner.len();
        let mut out = Vec::with_capacity(available);
        for _ in 0..available {
            match self.inner.try_recv() {
                Ok(msg) => out.push(msg),
                Err(_) => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
