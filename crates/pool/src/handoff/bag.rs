use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};

use super::{Handoff, Take};
use crate::local::LocalKey;

/// Entries each thread remembers from its own recent puts.
const LOCAL_CAPACITY: usize = 16;

/// One put, claimable exactly once.
struct Entry<T> {
    in_use: AtomicBool,
    item: Mutex<Option<T>>,
}

impl<T> Entry<T> {
    fn claim(&self) -> Option<T> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        self.item.lock().take()
    }

    fn is_claimed(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }
}

struct Shared<T> {
    entries: Vec<Arc<Entry<T>>>,
    closed: bool,
}

/// Thread-affine free list.
///
/// Every put lands in the shared list and is also remembered in the putting
/// thread's private list. A take first walks its own private list, newest
/// first, then scans the shared list; both paths race through the entry's
/// `in_use` flag, so an entry is claimed once no matter which list found it.
/// Takers that find nothing park on a sequence number bumped by every put and
/// re-scan when it moves.
pub struct Bag<T> {
    shared: RwLock<Shared<T>>,
    local: LocalKey,
    available: AtomicUsize,
    sequence: AtomicU64,
    /// Paired with `wake`; guards nothing but the park/notify handshake.
    parking: Mutex<()>,
    wake: Condvar,
    waiters: AtomicUsize,
}

impl<T: Send + 'static> Bag<T> {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: RwLock::new(Shared {
                entries: Vec::new(),
                closed: false,
            }),
            local: LocalKey::new(),
            available: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            parking: Mutex::new(()),
            wake: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    fn claimed(&self, entry: &Entry<T>) -> Option<T> {
        let item = entry.claim()?;
        self.available.fetch_sub(1, Ordering::SeqCst);
        Some(item)
    }

    fn take_local(&self) -> Option<T> {
        self.local
            .with(|list: &mut VecDeque<Weak<Entry<T>>>| {
                while let Some(weak) = list.pop_back() {
                    if let Some(entry) = weak.upgrade() {
                        if let Some(item) = self.claimed(&entry) {
                            return Some(item);
                        }
                    }
                }
                None
            })
            .flatten()
    }

    fn take_shared(&self) -> Option<T> {
        let shared = self.shared.read();
        shared
            .entries
            .iter()
            .filter(|entry| !entry.is_claimed())
            .find_map(|entry| self.claimed(entry))
    }

    fn scan(&self) -> Option<T> {
        self.take_local().or_else(|| self.take_shared())
    }
}

impl<T: Send + 'static> Default for Bag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Handoff<T> for Bag<T> {
    fn put(&self, item: T) -> Result<(), T> {
        let entry = {
            let mut shared = self.shared.write();
            if shared.closed {
                return Err(item);
            }
            shared.entries.retain(|e| !e.is_claimed());
            let entry = Arc::new(Entry {
                in_use: AtomicBool::new(false),
                item: Mutex::new(Some(item)),
            });
            shared.entries.push(Arc::clone(&entry));
            self.available.fetch_add(1, Ordering::SeqCst);
            entry
        };
        self.local.with(|list: &mut VecDeque<Weak<Entry<T>>>| {
            if list.len() >= LOCAL_CAPACITY {
                list.pop_front();
            }
            list.push_back(Arc::downgrade(&entry));
        });

        self.sequence.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _parking = self.parking.lock();
            self.wake.notify_one();
        }
        Ok(())
    }

    fn take(&self, deadline: Option<Instant>) -> Take<T> {
        loop {
            let seen = self.sequence.load(Ordering::SeqCst);
            if let Some(item) = self.scan() {
                return Take::Item(item);
            }
            if self.is_closed() {
                return Take::Closed;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Take::TimedOut;
            }

            let mut parking = self.parking.lock();
            // Count ourselves before re-reading the sequence so a concurrent
            // put either sees a waiter or we see its bump.
            self.waiters.fetch_add(1, Ordering::SeqCst);
            if self.sequence.load(Ordering::SeqCst) == seen {
                match deadline {
                    Some(deadline) => {
                        self.wake.wait_until(&mut parking, deadline);
                    }
                    None => self.wake.wait(&mut parking),
                }
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn try_take(&self) -> Option<T> {
        self.scan()
    }

    fn close(&self) -> Vec<T> {
        let drained = {
            let mut shared = self.shared.write();
            shared.closed = true;
            std::mem::take(&mut shared.entries)
                .iter()
                .filter_map(|entry| self.claimed(entry))
                .collect()
        };
        self.sequence.fetch_add(1, Ordering::SeqCst);
        let _parking = self.parking.lock();
        self.wake.notify_all();
        drained
    }

    fn len(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }

    fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.shared.read().closed
    }
}

impl<T> fmt::Debug for Bag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bag")
            .field("available", &self.available.load(Ordering::Relaxed))
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish()
    }
}
