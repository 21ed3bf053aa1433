//! Cancellation token shared between the peer-event surface and the loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// Values never flow through the channel; cancellation is signalled by
/// dropping the sender side so that every cloned receiver disconnects at once.
pub enum Never {}

/// A clonable one-shot cancellation token.
///
/// Any peer-state transition to a terminal state fires it, as does a
/// send-sample failure. Loops either poll [`CancelToken::is_fired`] or select
/// on [`CancelToken::channel`] alongside their tick source.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    keep_alive: Mutex<Option<Sender<Never>>>,
    rx: Receiver<Never>,
    fired: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        CancelToken {
            inner: Arc::new(Inner {
                keep_alive: Mutex::new(Some(tx)),
                rx,
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Fire the token. Idempotent.
    pub fn fire(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.inner.keep_alive.lock() {
            guard.take();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// The receiver side, for `select!` against a ticker. The channel never
    /// yields a value; it disconnects when the token fires.
    pub fn channel(&self) -> &Receiver<Never> {
        &self.inner.rx
    }

    /// Sleep for `timeout`, waking early if the token fires. Returns `true`
    /// when the token fired during (or before) the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_fired(),
            Err(RecvTimeoutError::Disconnected) => true,
            Ok(never) => match never {},
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
