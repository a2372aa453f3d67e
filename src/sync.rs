//! Blocking hand-off primitives used between worker threads and the serializer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

// =====================================================================
// BlockingQueue
// =====================================================================

struct QueueState<T> {
    items: VecDeque<T>,
    terminated: bool,
}

/// Multi-producer multi-consumer queue whose `pop` blocks until an item
/// arrives or the queue is terminated.
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    cv: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                terminated: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Returns false (dropping the item) once the queue is terminated.
    pub fn push(&self, item: T) -> bool {
        let mut s = self.state.lock();
        if s.terminated {
            return false;
        }
        s.items.push_back(item);
        drop(s);
        self.cv.notify_one();
        true
    }

    /// Blocks for the next item. `None` means the queue was terminated.
    pub fn pop(&self) -> Option<T> {
        let mut s = self.state.lock();
        loop {
            if s.terminated {
                return None;
            }
            if let Some(item) = s.items.pop_front() {
                return Some(item);
            }
            self.cv.wait(&mut s);
        }
    }

    /// Poisons the queue: every blocked and future `pop` returns `None`.
    pub fn terminate(&self) {
        let mut s = self.state.lock();
        s.terminated = true;
        s.items.clear();
        drop(s);
        self.cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =====================================================================
// Signal
// =====================================================================

/// Single-fire completion slot. The first `set` wins; later ones are ignored.
pub struct Signal<T> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// Returns true if this call fired the signal.
    pub fn set(&self, value: T) -> bool {
        let (slot, cv) = &*self.inner;
        let mut guard = slot.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        drop(guard);
        cv.notify_all();
        true
    }

    pub fn ptr_eq(&self, other: &Signal<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_set(&self) -> bool {
        self.inner.0.lock().is_some()
    }

    pub fn peek(&self) -> Option<T> {
        self.inner.0.lock().clone()
    }

    pub fn wait(&self) -> T {
        let (slot, cv) = &*self.inner;
        let mut guard = slot.lock();
        loop {
            if let Some(v) = guard.as_ref() {
                return v.clone();
            }
            cv.wait(&mut guard);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let (slot, cv) = &*self.inner;
        let mut guard = slot.lock();
        loop {
            if let Some(v) = guard.as_ref() {
                return Some(v.clone());
            }
            if cv.wait_until(&mut guard, deadline).timed_out() {
                return guard.clone();
            }
        }
    }
}
