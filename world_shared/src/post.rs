//! Post queue: deferred callbacks for the main loop.
//!
//! Background work (job runner, storage queue) never touches loop-owned
//! state directly. It posts a callback here; the owning loop drains the
//! queue on its own schedule, which preserves the single-mutator model.
//!
//! A panic inside one posted callback is caught at the dispatch boundary
//! and logged; it must not take down the loop or skip later callbacks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::error;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Thread-safe queue of callbacks drained by one loop.
#[derive(Clone, Default)]
pub struct PostQueue {
    pending: Arc<Mutex<Vec<Callback>>>,
}

impl PostQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a callback; callable from any thread.
    pub fn post(&self, cb: impl FnOnce() + Send + 'static) {
        self.pending
            .lock()
            .expect("post queue poisoned")
            .push(Box::new(cb));
    }

    /// Runs all queued callbacks on the calling thread. Returns how many ran.
    pub fn drain(&self) -> usize {
        let batch: Vec<Callback> = {
            let mut pending = self.pending.lock().expect("post queue poisoned");
            std::mem::take(&mut *pending)
        };
        let count = batch.len();
        for cb in batch {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(cb)) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic>".to_string());
                error!(panic = %msg, "posted callback panicked");
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().expect("post queue poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drain_runs_in_post_order() {
        let q = PostQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            q.post(move || log.lock().unwrap().push(i));
        }
        assert_eq!(q.drain(), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn panicking_callback_does_not_stop_drain() {
        let q = PostQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        q.post(|| panic!("boom"));
        let ran2 = Arc::clone(&ran);
        q.post(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(q.drain(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
