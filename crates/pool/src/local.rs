//! Per-thread private lists.
//!
//! Both the [`Bag`](crate::handoff::Bag) and the pool's own fast path keep a
//! short list of recently released entries per thread. `thread_local!` cannot
//! be generic, so every owner gets a [`LocalKey`] and the lists live in one
//! per-thread map keyed by it. Entries belonging to owners that have been
//! dropped are pruned lazily.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Owners per thread before dead entries are swept out of the map.
const PRUNE_THRESHOLD: usize = 8;

struct LocalList {
    owner: Weak<()>,
    list: Box<dyn Any>,
}

thread_local! {
    static LISTS: RefCell<HashMap<u64, LocalList>> = RefCell::new(HashMap::new());
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Non-zero token identifying the calling thread.
///
/// Returns `0` while the thread is being torn down.
pub(crate) fn thread_token() -> u64 {
    THREAD_TOKEN.try_with(|token| *token).unwrap_or(0)
}

/// Identity of one owner of per-thread lists.
pub(crate) struct LocalKey {
    id: u64,
    alive: Arc<()>,
}

impl LocalKey {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
        }
    }

    /// Run `f` against the calling thread's list for this key.
    ///
    /// Returns `None` when thread-local storage is no longer accessible
    /// (thread shutdown). `f` must not call back into `with`.
    pub(crate) fn with<T, R>(&self, f: impl FnOnce(&mut VecDeque<T>) -> R) -> Option<R>
    where
        T: 'static,
    {
        LISTS
            .try_with(|cell| {
                let mut lists = cell.try_borrow_mut().ok()?;
                if lists.len() > PRUNE_THRESHOLD {
                    lists.retain(|_, entry| entry.owner.strong_count() > 0);
                }
                let entry = lists.entry(self.id).or_insert_with(|| LocalList {
                    owner: Arc::downgrade(&self.alive),
                    list: Box::new(VecDeque::<T>::new()),
                });
                if !entry.list.is::<VecDeque<T>>() {
                    entry.list = Box::new(VecDeque::<T>::new());
                }
                entry.list.downcast_mut::<VecDeque<T>>().map(f)
            })
            .ok()
            .flatten()
    }
}

impl std::fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKey").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_are_private_per_thread() {
        let key = Arc::new(LocalKey::new());
        key.with(|list: &mut VecDeque<u32>| list.push_back(1));

        let other = Arc::clone(&key);
        let seen = std::thread::spawn(move || other.with(|list: &mut VecDeque<u32>| list.len()))
            .join()
            .unwrap();
        assert_eq!(seen, Some(0));
        assert_eq!(key.with(|list: &mut VecDeque<u32>| list.len()), Some(1));
    }

    #[test]
    fn keys_do_not_share_lists() {
        let a = LocalKey::new();
        let b = LocalKey::new();
        a.with(|list: &mut VecDeque<&'static str>| list.push_back("a"));
        assert_eq!(b.with(|list: &mut VecDeque<&'static str>| list.len()), Some(0));
    }

    #[test]
    fn dropped_owners_are_pruned() {
        for _ in 0..(PRUNE_THRESHOLD * 2) {
            let key = LocalKey::new();
            key.with(|list: &mut VecDeque<u8>| list.push_back(0));
        }
        let key = LocalKey::new();
        key.with(|list: &mut VecDeque<u8>| list.push_back(0));
        let live = LISTS.with(|cell| cell.borrow().len());
        assert!(live <= PRUNE_THRESHOLD + 1, "{live} lists retained");
    }

    #[test]
    fn thread_tokens_differ() {
        let here = thread_token();
        let there = std::thread::spawn(thread_token).join().unwrap();
        assert_ne!(here, 0);
        assert_ne!(here, there);
    }
}
