use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::{Handoff, Take};

struct Queue<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Blocking FIFO queue: one mutex, one condvar.
///
/// The simplest correct handoff and the baseline the other strategies are
/// measured against.
pub struct FifoQueue<T> {
    queue: Mutex<Queue<T>>,
    available: Condvar,
    waiters: AtomicUsize,
}

impl<T> FifoQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Handoff<T> for FifoQueue<T> {
    fn put(&self, item: T) -> Result<(), T> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(item);
        }
        queue.items.push_back(item);
        drop(queue);
        self.available.notify_one();
        Ok(())
    }

    fn take(&self, deadline: Option<Instant>) -> Take<T> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(item) = queue.items.pop_front() {
                return Take::Item(item);
            }
            if queue.closed {
                return Take::Closed;
            }
            self.waiters.fetch_add(1, Ordering::SeqCst);
            let timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut queue, deadline).timed_out(),
                None => {
                    self.available.wait(&mut queue);
                    false
                }
            };
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            if timed_out {
                return match queue.items.pop_front() {
                    Some(item) => Take::Item(item),
                    None if queue.closed => Take::Closed,
                    None => Take::TimedOut,
                };
            }
        }
    }

    fn try_take(&self) -> Option<T> {
        self.queue.lock().items.pop_front()
    }

    fn close(&self) -> Vec<T> {
        let mut queue = self.queue.lock();
        queue.closed = true;
        let drained = queue.items.drain(..).collect();
        drop(queue);
        self.available.notify_all();
        drained
    }

    fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }
}

impl<T> fmt::Debug for FifoQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("FifoQueue")
            .field("len", &queue.items.len())
            .field("closed", &queue.closed)
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}
