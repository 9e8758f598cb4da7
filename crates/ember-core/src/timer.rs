// src/timer.rs
//! Indexed min-heap of idle timers.
//!
//! The heap is ordered by expiry and paired with an id → slot map, so a
//! timer for an arbitrary connection can be extended or removed in
//! O(log n) without scanning.
//!
//! Callbacks receive a caller-supplied context (`&mut C`) when they fire.
//! The reactor passes its dispatch state here, which lets an expiring timer
//! close its connection without the timer owning any of that state.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub type TimeoutCallback<C> = Box<dyn FnOnce(&mut C) + Send>;

struct TimerNode<K, C> {
    id: K,
    expires: Instant,
    callback: TimeoutCallback<C>,
}

pub struct HeapTimer<K, C> {
    heap: Vec<TimerNode<K, C>>,
    slots: HashMap<K, usize>,
}

impl<K, C> HeapTimer<K, C>
where
    K: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            slots: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.slots.contains_key(&id)
    }

    /// Arm a timer for `id` that fires `timeout` from now.
    ///
    /// If `id` already has a timer, its expiry and callback are replaced.
    pub fn add(&mut self, id: K, timeout: Duration, callback: TimeoutCallback<C>) {
        self.add_at(id, Instant::now() + timeout, callback);
    }

    pub fn add_at(&mut self, id: K, expires: Instant, callback: TimeoutCallback<C>) {
        match self.slots.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.slots.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    callback,
                });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].callback = callback;
                self.resift(i);
            }
        }
    }

    /// Move the expiry of an existing timer to `timeout` from now.
    /// Returns `false` if `id` has no timer.
    pub fn adjust(&mut self, id: K, timeout: Duration) -> bool {
        self.adjust_at(id, Instant::now() + timeout)
    }

    pub fn adjust_at(&mut self, id: K, expires: Instant) -> bool {
        let Some(i) = self.slots.get(&id).copied() else {
            return false;
        };
        self.heap[i].expires = expires;
        self.resift(i);
        true
    }

    /// Fire and remove the timer for `id` regardless of its expiry.
    /// Returns `false` if `id` has no timer.
    pub fn do_work(&mut self, id: K, ctx: &mut C) -> bool {
        let Some(i) = self.slots.get(&id).copied() else {
            return false;
        };
        let node = self.remove_at(i);
        (node.callback)(ctx);
        true
    }

    /// Fire every timer whose expiry is at or before now.
    pub fn tick(&mut self, ctx: &mut C) -> usize {
        self.expire(Instant::now(), ctx)
    }

    /// Fire every timer whose expiry is at or before `now`, earliest first.
    pub fn expire(&mut self, now: Instant, ctx: &mut C) -> usize {
        let mut fired = 0;
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.remove_at(0);
            (node.callback)(ctx);
            fired += 1;
        }
        fired
    }

    /// Sweep expired timers, then report how long until the next one is due.
    ///
    /// `None` means no timer is pending and the caller may block indefinitely.
    pub fn next_deadline(&mut self, ctx: &mut C) -> Option<Duration> {
        self.tick(ctx);
        self.heap
            .first()
            .map(|root| root.expires.saturating_duration_since(Instant::now()))
    }

    /// Drop every timer without firing it.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
    }

    fn resift(&mut self, i: usize) {
        let len = self.heap.len();
        if !self.sift_down(i, len) {
            self.sift_up(i);
        }
    }

    fn remove_at(&mut self, index: usize) -> TimerNode<K, C> {
        assert!(index < self.heap.len(), "timer slot {} out of range", index);
        let last = self.heap.len() - 1;
        if index < last {
            self.swap_nodes(index, last);
        }
        let node = match self.heap.pop() {
            Some(node) => node,
            None => unreachable!("heap emptied during removal"),
        };
        self.slots.remove(&node.id);
        if index < self.heap.len() {
            self.resift(index);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns `true` if the node moved.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > index
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.slots.insert(self.heap[i].id, i);
        self.slots.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert_eq!(self.heap.len(), self.slots.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.slots[&node.id], i, "slot map out of sync for {:?}", node.id);
            if i > 0 {
                assert!(self.heap[(i - 1) / 2].expires <= node.expires);
            }
        }
    }
}

impl<K, C> Default for HeapTimer<K, C>
where
    K: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
