use std::collections::VecDeque;

use defsmith_core::ObjectKey;
use rustc_hash::FxHashSet;

/// Reconcile queue: FIFO by first arrival, duplicates merged, fixed capacity.
/// When full the oldest key is dropped; the next watch event for it re-adds it.
pub struct KeyCoalescer {
    queued: FxHashSet<ObjectKey>,
    order: VecDeque<ObjectKey>,
    cap: usize,
    dropped: u64,
}

impl KeyCoalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { queued: FxHashSet::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, key: ObjectKey) {
        if self.queued.contains(&key) {
            return;
        }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.queued.remove(&old);
                self.dropped += 1;
            }
        }
        self.queued.insert(key.clone());
        self.order.push_back(key);
    }

    /// Take every queued key, oldest first. Keys in one batch are distinct.
    pub fn drain_ready(&mut self) -> Vec<ObjectKey> {
        self.queued.clear();
        self.order.drain(..).collect()
    }
}
