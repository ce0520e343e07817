//! Low-level sharing primitives used by the registries.
//!
//! * [`Snapshot`] -- an immutable, reference-counted value that is replaced
//!   wholesale with an atomic compare-and-swap on pointer identity. Readers
//!   load the current `Arc` without taking a lock and never observe a
//!   partially-built value; writers build a new value from the snapshot they
//!   read and retry if someone else won.
//! * [`FreeStack`] -- a lock-free LIFO of recycled entity indices, kept as a
//!   persistent vector inside a [`Snapshot`].
//! * [`FreeQueue`] -- an unbounded multi-producer/multi-consumer queue used
//!   for chunks with spare capacity and chunks awaiting deferred removals.

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use crossbeam_channel::{Receiver, Sender};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A copy-on-write cell holding an `Arc<T>`.
#[derive(Debug)]
pub struct Snapshot<T> {
    current: ArcSwap<T>,
}

impl<T> Snapshot<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            current: ArcSwap::from_pointee(value),
        }
    }

    /// The current snapshot.
    #[inline]
    pub fn load(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Replace the snapshot with `next` iff it is still `expected`.
    ///
    /// Returns the installed value on success, or the snapshot that won the
    /// race on failure.
    pub fn compare_and_swap(&self, expected: &Arc<T>, next: Arc<T>) -> Result<Arc<T>, Arc<T>> {
        let previous = self.current.compare_and_swap(expected, Arc::clone(&next));
        if Arc::ptr_eq(&previous, expected) {
            Ok(next)
        } else {
            Err(Guard::into_inner(previous))
        }
    }

    /// Retry loop around [`compare_and_swap`](Self::compare_and_swap).
    ///
    /// `update` receives the latest snapshot and returns `None` when no change
    /// is needed (the snapshot is returned as-is) or `Some(next)` to install.
    /// On a lost race `update` runs again against the winner's value.
    pub fn update<F>(&self, mut update: F) -> Arc<T>
    where
        F: FnMut(&T) -> Option<T>,
    {
        let mut current = self.load();
        loop {
            let Some(next) = update(&current) else {
                return current;
            };
            match self.compare_and_swap(&current, Arc::new(next)) {
                Ok(installed) => return installed,
                Err(winner) => current = winner,
            }
        }
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// ---------------------------------------------------------------------------
// FreeStack
// ---------------------------------------------------------------------------

/// A lock-free LIFO stack.
///
/// The most recently freed item is handed out first, so recycled entity
/// indices stay dense at the low end of the table.
#[derive(Debug)]
pub struct FreeStack<T: Clone> {
    items: Snapshot<im::Vector<T>>,
}

impl<T: Clone> FreeStack<T> {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self {
            items: Snapshot::new(im::Vector::new()),
        }
    }

    /// Push an item on top.
    pub fn push(&self, item: T) {
        self.items.update(|items| {
            let mut next = items.clone();
            next.push_back(item.clone());
            Some(next)
        });
    }

    /// Pop the top item if there is one.
    pub fn pop(&self) -> Option<T> {
        let mut popped = None;
        self.items.update(|items| {
            let mut next = items.clone();
            popped = next.pop_back();
            popped.as_ref().map(|_| next)
        });
        popped
    }

    /// Number of stacked items (racy, for diagnostics).
    #[inline]
    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    /// Whether the stack is currently empty (racy, for diagnostics).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }
}

impl<T: Clone> Default for FreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// FreeQueue
// ---------------------------------------------------------------------------

/// An unbounded lock-free FIFO queue.
#[derive(Debug)]
pub struct FreeQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> FreeQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    /// Enqueue an item.
    #[inline]
    pub fn push(&self, item: T) {
        // Both ends live in `self`, so the channel can never be disconnected.
        let _ = self.sender.send(item);
    }

    /// Dequeue an item if one is available.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Number of queued items (racy, for diagnostics).
    #[inline]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether the queue is currently empty (racy, for diagnostics).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl<T> Default for FreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
