//! Bounded queues whose readiness is a channel bit.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::Signal;

/// The queue was full; the rejected element is handed back.
#[derive(Debug, PartialEq, Eq)]
pub struct PushError<T>(pub T);

struct Inner<T> {
    deque: VecDeque<T>,
    capacity: usize,
}

/// The consuming end of a bounded queue bound to a channel bit.
///
/// The bit is raised whenever an element is enqueued and cleared when a pop
/// leaves the queue empty, so the owning channel's wait-set reflects queue
/// occupancy without a separate poll of the queue itself. Both transitions
/// happen under the queue lock, which rules out a lost wakeup between a
/// drain and a concurrent push.
pub struct Queue<T> {
    inner: Arc<Mutex<Inner<T>>>,
    signal: Signal,
}

impl<T> Queue<T> {
    pub(crate) fn new(signal: Signal, capacity: usize) -> Self {
        Queue {
            inner: Arc::new(Mutex::new(Inner {
                deque: VecDeque::with_capacity(capacity),
                capacity,
            })),
            signal,
        }
    }

    /// A cloneable producer handle for this queue.
    pub fn sender(&self) -> QueueSender<T> {
        QueueSender {
            inner: Arc::clone(&self.inner),
            signal: self.signal.clone(),
        }
    }

    /// Pops the front element, clearing the readiness bit if this empties
    /// the queue.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let element = inner.deque.pop_front();
        if inner.deque.is_empty() {
            self.signal.clear();
        }
        element
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").deque.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The channel bit this queue asserts.
    pub fn mask(&self) -> u32 {
        self.signal.mask()
    }
}

/// The producing end of a bounded queue; cheap to clone across threads.
pub struct QueueSender<T> {
    inner: Arc<Mutex<Inner<T>>>,
    signal: Signal,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        QueueSender {
            inner: Arc::clone(&self.inner),
            signal: self.signal.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueues `element` and raises the queue's bit.
    ///
    /// A full queue rejects the element rather than blocking or dropping;
    /// flow control is the caller's concern.
    pub fn push(&self, element: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if inner.deque.len() == inner.capacity {
            return Err(PushError(element));
        }
        inner.deque.push_back(element);
        self.signal.set();
        Ok(())
    }
}
