//! Cancellation signal shared between the session layer and running commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use tracing::debug;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    pending: Vec<(u64, Callback)>,
}

/// A cloneable, fire-once cancellation signal.
///
/// Every clone observes the same state. Once cancelled it stays cancelled.
#[derive(Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        let weak = Arc::downgrade(&token.shared);
        thread::spawn(move || {
            thread::sleep(timeout);
            if let Some(shared) = weak.upgrade() {
                debug!("Cancellation timeout of {:?} elapsed", timeout);
                CancelToken { shared }.cancel();
            }
        });
        token
    }

    /// Fire the signal. Later calls are no-ops.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = match self.shared.callbacks.lock() {
            Ok(mut callbacks) => std::mem::take(&mut callbacks.pending),
            Err(poisoned) => std::mem::take(&mut poisoned.into_inner().pending),
        };
        for (_, callback) in pending {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Run `callback` once when the token fires, or right away if it already has.
    ///
    /// Dropping the returned registration removes a callback that has not run.
    pub(crate) fn on_cancel<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = match self.shared.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Checked under the lock so a concurrent cancel() cannot miss us
        if self.is_cancelled() {
            drop(callbacks);
            callback();
            return Registration { shared: Weak::new(), id: 0 };
        }
        let id = callbacks.next_id;
        callbacks.next_id += 1;
        callbacks.pending.push((id, Box::new(callback)));
        Registration { shared: Arc::downgrade(&self.shared), id }
    }
}

/// Keeps a cancellation callback registered.
pub(crate) struct Registration {
    shared: Weak<Shared>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if let Ok(mut callbacks) = shared.callbacks.lock() {
                callbacks.pending.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_cancel_is_shared_and_idempotent() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_callback_runs_once() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let _registration = token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_after_cancel_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let (tx, rx) = mpsc::channel();
        let _registration = token.on_cancel(move || {
            let _ = tx.send(());
        });
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_dropped_registration_is_removed() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let registration = token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(registration);

        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_with_timeout_fires() {
        let token = CancelToken::with_timeout(Duration::from_millis(20));
        let (tx, rx) = mpsc::channel();
        let _registration = token.on_cancel(move || {
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(token.is_cancelled());
    }
}
