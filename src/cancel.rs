use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Select, Sender};

use crate::lock;

/// A cooperative cancellation signal shared by the background threads of one connection.
///
/// Tokens form a hierarchy: a token created with [`CancelToken::child`] is cancelled when
/// either it or any of its ancestors is cancelled, while cancelling the child leaves the
/// parent untouched. Cloning a token yields another handle to the same signal.
///
/// Besides the flag, every token owns a crossbeam channel that nobody ever sends on.
/// Cancelling drops the sending half, which wakes every thread parked in [`CancelToken::sleep`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
    parent: Option<Box<CancelToken>>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    /// creates a new, uncancelled root token
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                signal: rx,
            }),
            parent: None,
        }
    }

    /// creates a token that is cancelled together with `self`, but can also be cancelled on
    /// its own
    pub fn child(&self) -> Self {
        CancelToken {
            parent: Some(Box::new(self.clone())),
            ..CancelToken::new()
        }
    }

    /// requests cancellation. Returns `true` only for the call that actually flipped the
    /// token, later calls are no-ops.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        // dropping the sender disconnects `signal` and wakes all sleepers
        let trigger = lock(&self.inner.trigger).take();
        drop(trigger);
        true
    }

    /// returns `true` if this token or one of its ancestors was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.parent.as_ref().map_or(false, |p| p.is_cancelled())
    }

    /// sleeps for `duration` unless cancellation is requested first.
    ///
    /// Returns `true` if the full duration elapsed and the token is still live, `false` if
    /// the sleep was cut short (or never started) because of cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }

        let signals = self.signals();
        let mut select = Select::new();
        for signal in signals.iter().copied() {
            select.recv(signal);
        }
        match select.ready_timeout(duration) {
            Ok(_) => false,
            Err(_) => !self.is_cancelled(),
        }
    }

    fn signals(&self) -> Vec<&Receiver<()>> {
        let mut signals = vec![&self.inner.signal];
        let mut parent = self.parent.as_deref();
        while let Some(token) = parent {
            signals.push(&token.inner.signal);
            parent = token.parent.as_deref();
        }
        signals
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}
