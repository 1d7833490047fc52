//! Bounded ingress queue for asynchronous control events.
//!
//! One external producer pushes, the control side drains on its own
//! schedule. Continuous parameter updates go through
//! [`IngressQueue::enqueue_latest`] so only the newest value per target and
//! parameter survives; everything else is kept in order. Once the hard cap is
//! exceeded the oldest entries are evicted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Events that can replace an older queued event of the same identity.
pub trait Coalesce {
    /// Whether this queued event is an update made obsolete by `newer`.
    fn superseded_by(&self, newer: &Self) -> bool;
}

pub struct IngressQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    evicted: AtomicU64,
    coalesced: AtomicU64,
}

impl<T> IngressQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            evicted: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Total number of events dropped by the capacity cap.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Total number of updates replaced by a newer one.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Appends an event, keeping every earlier one.
    pub fn enqueue(&self, item: T) {
        let mut items = self.items.lock();
        items.push_back(item);
        self.enforce_cap(&mut items);
    }

    fn enforce_cap(&self, items: &mut VecDeque<T>) {
        let mut dropped = 0u64;
        while items.len() > self.capacity {
            items.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.evicted.fetch_add(dropped, Ordering::Relaxed);
            tracing::debug!(dropped, capacity = self.capacity, "ingress queue evicted oldest events");
        }
    }

    /// Takes everything queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock();
        items.drain(..).collect()
    }
}

impl<T: Coalesce> IngressQueue<T> {
    /// Appends an update after removing any queued update it supersedes.
    pub fn enqueue_latest(&self, item: T) {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|queued| !queued.superseded_by(&item));
        let removed = (before - items.len()) as u64;
        if removed > 0 {
            self.coalesced.fetch_add(removed, Ordering::Relaxed);
        }
        items.push_back(item);
        self.enforce_cap(&mut items);
    }
}
