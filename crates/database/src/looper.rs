//! Per-thread event loop.
//!
//! A thread that wants automatic refresh or asynchronous queries prepares a
//! looper before opening instances. Commits on any thread then queue a
//! coalesced "version changed" signal in the looper's mailbox, and worker
//! results are queued as tasks. Nothing runs until the thread polls:
//! [`Looper::poll`] drains the mailbox and dispatches every message on the
//! calling thread, so listeners always run on the thread that owns the
//! instance.
//!
//! ```rust
//! use tessel_database::Looper;
//!
//! Looper::prepare().unwrap();
//! assert!(Looper::is_prepared());
//! assert_eq!(Looper::poll().unwrap(), 0);
//! Looper::release();
//! ```

use crate::realm::RealmInner;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tessel_core::{Error, Result};
use tessel_reactive::{Envelope, Mailbox, MailboxSender};
use tracing::{debug, warn};

/// Work posted to a looper from another thread.
pub(crate) type Task = Box<dyn FnOnce() -> Result<()> + Send>;

struct LooperState {
    mailbox: Mailbox<Task>,
    instances: RefCell<Vec<Weak<RealmInner>>>,
}

thread_local! {
    static LOOPER: RefCell<Option<Rc<LooperState>>> = const { RefCell::new(None) };
}

fn current() -> Option<Rc<LooperState>> {
    LOOPER.with(|l| l.borrow().clone())
}

/// Event loop of the current thread.
pub struct Looper;

impl Looper {
    /// Prepares a looper on the current thread. Preparing twice is a no-op.
    pub fn prepare() -> Result<()> {
        LOOPER.with(|l| {
            let mut slot = l.borrow_mut();
            if slot.is_none() {
                debug!(thread = ?std::thread::current().id(), "looper prepared");
                *slot = Some(Rc::new(LooperState {
                    mailbox: Mailbox::new(),
                    instances: RefCell::new(Vec::new()),
                }));
            }
        });
        Ok(())
    }

    /// Returns true if the current thread has a looper.
    pub fn is_prepared() -> bool {
        LOOPER.with(|l| l.borrow().is_some())
    }

    /// Removes the current thread's looper. Instances opened while it
    /// existed stop receiving automatic refreshes.
    pub fn release() {
        let state = LOOPER.with(|l| l.borrow_mut().take());
        if let Some(state) = state {
            let open = state
                .instances
                .borrow()
                .iter()
                .filter(|w| w.strong_count() > 0)
                .count();
            if open > 0 {
                warn!(open, "looper released while instances are still open");
            }
        }
    }

    /// Returns the number of queued messages.
    pub fn pending() -> usize {
        current().map(|s| s.mailbox.len()).unwrap_or(0)
    }

    /// Dispatches every queued message and returns how many were handled.
    /// The first failure (for example a background error with no error
    /// callback) is returned after the queue is drained.
    pub fn poll() -> Result<usize> {
        let state = current().ok_or_else(not_prepared)?;
        let mut handled = 0;
        let mut first_error = None;
        while let Some(envelope) = state.mailbox.try_recv() {
            handled += 1;
            if let Err(e) = dispatch(&state, envelope) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(handled),
        }
    }

    /// Waits up to `timeout` for a message, then dispatches everything
    /// queued.
    pub fn poll_timeout(timeout: Duration) -> Result<usize> {
        let state = current().ok_or_else(not_prepared)?;
        let Some(envelope) = state.mailbox.recv_timeout(timeout) else {
            return Ok(0);
        };
        let first = dispatch(&state, envelope);
        let rest = Self::poll();
        first?;
        Ok(rest? + 1)
    }

    /// Dispatches messages until `done` returns true or `timeout` elapses.
    /// Returns whether `done` was satisfied.
    pub fn run_until(mut done: impl FnMut() -> bool, timeout: Duration) -> Result<bool> {
        let state = current().ok_or_else(not_prepared)?;
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if let Some(envelope) = state.mailbox.recv_timeout(deadline - now) {
                dispatch(&state, envelope)?;
            }
        }
    }

    pub(crate) fn sender() -> Option<MailboxSender<Task>> {
        current().map(|s| s.mailbox.sender())
    }

    /// Routes version signals of the current thread to `inner`.
    pub(crate) fn attach(inner: &Arc<RealmInner>) {
        if let Some(state) = current() {
            let mut instances = state.instances.borrow_mut();
            instances.retain(|w| w.strong_count() > 0);
            instances.push(Arc::downgrade(inner));
        }
    }
}

fn not_prepared() -> Error {
    Error::illegal_state("no looper is prepared on this thread")
}

fn dispatch(state: &LooperState, envelope: Envelope<Task>) -> Result<()> {
    match envelope {
        Envelope::VersionChanged => {
            let instances: Vec<Arc<RealmInner>> = {
                let mut list = state.instances.borrow_mut();
                list.retain(|w| w.strong_count() > 0);
                list.iter().filter_map(Weak::upgrade).collect()
            };
            let mut first_error = None;
            for inner in instances {
                if let Err(e) = inner.on_version_changed() {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        }
        Envelope::Payload(task) => task(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_poll_requires_prepare() {
        std::thread::spawn(|| {
            assert!(!Looper::is_prepared());
            assert!(Looper::poll().is_err());
            Looper::prepare().unwrap();
            assert_eq!(Looper::poll().unwrap(), 0);
            Looper::release();
            assert!(!Looper::is_prepared());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_tasks_run_on_polling_thread() {
        std::thread::spawn(|| {
            Looper::prepare().unwrap();
            let sender = Looper::sender().unwrap();
            let ran = Arc::new(AtomicUsize::new(0));
            let owner = std::thread::current().id();

            let worker = {
                let ran = ran.clone();
                std::thread::spawn(move || {
                    for _ in 0..3 {
                        let ran = ran.clone();
                        sender.post(Box::new(move || {
                            assert_eq!(std::thread::current().id(), owner);
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }));
                    }
                })
            };
            worker.join().unwrap();

            assert_eq!(Looper::pending(), 3);
            assert_eq!(Looper::poll().unwrap(), 3);
            assert_eq!(ran.load(Ordering::SeqCst), 3);
            Looper::release();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_failed_task_surfaces_after_drain() {
        std::thread::spawn(|| {
            Looper::prepare().unwrap();
            let sender = Looper::sender().unwrap();
            let ran = Arc::new(AtomicUsize::new(0));
            sender.post(Box::new(|| Err(Error::background(Error::Cancelled))));
            let counter = ran.clone();
            sender.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            let err = Looper::poll().unwrap_err();
            assert!(matches!(err, Error::Background(_)));
            assert_eq!(ran.load(Ordering::SeqCst), 1);
            Looper::release();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_run_until_times_out() {
        std::thread::spawn(|| {
            Looper::prepare().unwrap();
            let done = Looper::run_until(|| false, Duration::from_millis(20)).unwrap();
            assert!(!done);
            Looper::release();
        })
        .join()
        .unwrap();
    }
}
