use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock};

use super::{Handoff, Take};

/// Dead registrations tolerated beyond the live waiter count before a taker
/// sweeps the waiter queue.
const PRUNE_SLACK: usize = 32;

struct Slot<T> {
    item: Option<T>,
    /// The waiter stopped listening; producers skip this slot.
    abandoned: bool,
    closed: bool,
}

/// A taker parked on a private one-shot slot.
struct Waiter<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Waiter<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                item: None,
                abandoned: false,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Deliver `item`, or hand it back if the waiter is gone.
    fn deliver(&self, item: T) -> Result<(), T> {
        let mut slot = self.slot.lock();
        if slot.abandoned || slot.closed || slot.item.is_some() {
            return Err(item);
        }
        slot.item = Some(item);
        drop(slot);
        self.ready.notify_one();
        Ok(())
    }

    /// Stop listening and collect anything delivered in the meantime.
    fn abandon(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        slot.abandoned = true;
        slot.item.take()
    }
}

/// Direct handoff between producers and parked takers.
///
/// Takers that find the shared queue empty register a [`Waiter`] in a
/// lock-free waiter queue and park on it. A producer that finds a live waiter
/// puts the item straight into its slot, bypassing the shared queue.
/// Waiters that timed out are skipped and dropped lazily by producers.
pub struct Rendezvous<T> {
    shared: SegQueue<T>,
    waiting: SegQueue<Arc<Waiter<T>>>,
    waiters: AtomicUsize,
    /// Puts hold this for reading and close holds it for writing, so no item
    /// slips into the shared queue after it was drained.
    gate: RwLock<()>,
    closed: AtomicBool,
}

impl<T> Rendezvous<T> {
    /// Create an empty rendezvous pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: SegQueue::new(),
            waiting: SegQueue::new(),
            waiters: AtomicUsize::new(0),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Hand `item` to the first live waiter, or queue it.
    fn offer(&self, mut item: T) {
        while let Some(waiter) = self.waiting.pop() {
            match waiter.deliver(item) {
                Ok(()) => return,
                Err(returned) => item = returned,
            }
        }
        self.shared.push(item);
    }

    /// Drop registrations of waiters that already gave up.
    fn prune(&self) {
        let registered = self.waiting.len();
        if registered <= 2 * self.waiters.load(Ordering::SeqCst) + PRUNE_SLACK {
            return;
        }
        for _ in 0..registered {
            let Some(waiter) = self.waiting.pop() else {
                break;
            };
            if !waiter.slot.lock().abandoned {
                self.waiting.push(waiter);
            }
        }
    }

    /// Park on `waiter` until it is served, closed or `deadline` passes.
    fn park(&self, waiter: &Waiter<T>, deadline: Option<Instant>) -> Take<T> {
        let mut slot = waiter.slot.lock();
        loop {
            if let Some(item) = slot.item.take() {
                slot.abandoned = true;
                return Take::Item(item);
            }
            if slot.closed {
                return Take::Closed;
            }
            match deadline {
                Some(deadline) => {
                    if waiter.ready.wait_until(&mut slot, deadline).timed_out() {
                        slot.abandoned = true;
                        // a producer that won the race keeps its delivery
                        return match slot.item.take() {
                            Some(item) => Take::Item(item),
                            None if slot.closed => Take::Closed,
                            None => Take::TimedOut,
                        };
                    }
                }
                None => waiter.ready.wait(&mut slot),
            }
        }
    }
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Handoff<T> for Rendezvous<T> {
    fn put(&self, item: T) -> Result<(), T> {
        let _gate = self.gate.read();
        if self.closed.load(Ordering::SeqCst) {
            return Err(item);
        }
        self.offer(item);
        Ok(())
    }

    fn take(&self, deadline: Option<Instant>) -> Take<T> {
        if let Some(item) = self.shared.pop() {
            return Take::Item(item);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Take::Closed;
        }

        self.prune();
        let waiter = Arc::new(Waiter::new());
        self.waiters.fetch_add(1, Ordering::SeqCst);
        self.waiting.push(Arc::clone(&waiter));

        // An item queued between the first check and registration would
        // otherwise sit unseen while we park.
        let outcome = if let Some(item) = self.shared.pop() {
            if let Some(delivered) = waiter.abandon() {
                let _gate = self.gate.read();
                if self.closed.load(Ordering::SeqCst) {
                    self.shared.push(delivered);
                } else {
                    self.offer(delivered);
                }
            }
            Take::Item(item)
        } else if self.closed.load(Ordering::SeqCst) {
            match waiter.abandon() {
                Some(item) => Take::Item(item),
                None => Take::Closed,
            }
        } else {
            self.park(&waiter, deadline)
        };

        self.waiters.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn try_take(&self) -> Option<T> {
        self.shared.pop()
    }

    fn close(&self) -> Vec<T> {
        let _gate = self.gate.write();
        self.closed.store(true, Ordering::SeqCst);
        while let Some(waiter) = self.waiting.pop() {
            waiter.slot.lock().closed = true;
            waiter.ready.notify_all();
        }
        std::iter::from_fn(|| self.shared.pop()).collect()
    }

    fn len(&self) -> usize {
        self.shared.len()
    }

    fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<T> fmt::Debug for Rendezvous<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rendezvous")
            .field("len", &self.shared.len())
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timed_out_waiters_are_skipped_by_producers() {
        let pool = Rendezvous::new();
        for _ in 0..3 {
            assert_eq!(pool.take(Some(Instant::now() + Duration::from_millis(5))), Take::TimedOut);
        }
        // three dead waiters are still registered; the put must pass them by
        pool.put(9).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.try_take(), Some(9));
    }

    #[test]
    fn dead_registrations_are_pruned() {
        let pool = Rendezvous::<u8>::new();
        for _ in 0..(PRUNE_SLACK * 2) {
            assert_eq!(pool.take(Some(Instant::now())), Take::TimedOut);
        }
        assert!(pool.waiting.len() <= PRUNE_SLACK + 1);
    }

    #[test]
    fn put_to_parked_waiter_bypasses_shared_queue() {
        let pool = Arc::new(Rendezvous::new());
        let taker = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.take(None))
        };
        while pool.waiters() == 0 {
            std::thread::yield_now();
        }
        pool.put("direct").unwrap();
        assert_eq!(taker.join().unwrap(), Take::Item("direct"));
        assert!(pool.is_empty());
    }

    #[test]
    fn abandoned_waiter_keeps_racing_delivery() {
        let waiter = Waiter::new();
        waiter.deliver(5).unwrap();
        assert_eq!(waiter.abandon(), Some(5));
        assert_eq!(waiter.deliver(6), Err(6));
    }
}
