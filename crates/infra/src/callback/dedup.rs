//! Process-local record of callbacks already handled.
//!
//! Best effort only: a restart forgets everything, and the instrument's own
//! status is what finally stops a second confirmation.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Entries {
    seen: HashSet<String>,
    /// Insertion order; front is oldest.
    order: VecDeque<String>,
}

/// Bounded set of callback keys with oldest-first eviction.
#[derive(Debug)]
pub struct CallbackDedup {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl CallbackDedup {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(Entries {
                seen: HashSet::with_capacity(capacity.min(1024)),
                order: VecDeque::with_capacity(capacity.min(1024)),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // The set stays consistent across a panic elsewhere; keep using it.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `key`. Returns `false` if it was already present.
    pub fn try_register(&self, key: &str) -> bool {
        let mut entries = self.lock();
        if entries.seen.contains(key) {
            return false;
        }
        while entries.seen.len() >= self.capacity {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.seen.remove(&oldest);
                }
                None => break,
            }
        }
        entries.seen.insert(key.to_owned());
        entries.order.push_back(key.to_owned());
        true
    }

    /// Forget `key` so the next delivery is handled as a first attempt.
    pub fn remove(&self, key: &str) {
        let mut entries = self.lock();
        if entries.seen.remove(key) {
            entries.order.retain(|k| k != key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
