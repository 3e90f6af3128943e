use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use mea::{condvar::Condvar, mutex::Mutex};

/// Counts live sessions and gates admission at the worker-pool limit.
///
/// `acquire` parks the caller until a slot is free; the returned
/// [`SessionSlot`] gives it back on drop. `get` is a plain snapshot, and
/// `wait_idle` parks until every slot has been returned (the shutdown drain).
#[derive(Clone, Debug)]
pub struct SessionCounter {
    inner: Arc<CounterInner>,
}

#[derive(Debug)]
struct CounterInner {
    limit: u64,
    active: AtomicU64,
    gate: Mutex<()>,
    cv: Condvar,
}

#[derive(Debug)]
pub struct SessionSlot {
    inner: Arc<CounterInner>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
        self.inner.cv.notify_all();
    }
}

impl SessionCounter {
    pub fn new(limit: u64) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                limit,
                active: AtomicU64::new(0),
                gate: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    pub async fn acquire(&self) -> SessionSlot {
        let mut guard = self.inner.gate.lock().await;
        while self.inner.active.load(Ordering::Acquire) >= self.inner.limit {
            guard = self.inner.cv.wait(guard).await;
        }
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        drop(guard);
        SessionSlot {
            inner: self.inner.clone(),
        }
    }

    pub fn get(&self) -> u64 {
        self.inner.active.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        if self.inner.active.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.inner.gate.lock().await;
        while self.inner.active.load(Ordering::Acquire) > 0 {
            guard = self.inner.cv.wait(guard).await;
        }
    }
}
