//! Memoized values with an explicit "did it change" contract.
//!
//! A [`Cache<T>`] pairs a value with a [`Recompute`] capability. Every
//! [`get`](Cache::get) asks the capability whether the value is stale; it
//! answers `None` (keep the value, report unchanged) or `Some(next)` (replace,
//! report changed). Higher layers build on the changed flag to skip work:
//! the scheduler only regroups when a dependency cache reports a change.
//!
//! Caches that several owners read are wrapped in [`Shared`].

use std::sync::Arc;

use parking_lot::Mutex;

/// Decides whether a cached value must be replaced.
///
/// Implementors carry whatever state they need to detect staleness (a
/// segment count, a version, a set of upstream caches).
pub trait Recompute<T>: Send {
    /// Return `Some(next)` if `current` is stale.
    fn recompute(&mut self, current: &T) -> Option<T>;
}

impl<T, F> Recompute<T> for F
where
    F: FnMut(&T) -> Option<T> + Send,
{
    fn recompute(&mut self, current: &T) -> Option<T> {
        self(current)
    }
}

/// A cache that several owners can poll.
pub type Shared<T> = Arc<Mutex<Cache<T>>>;

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// A memoized value and the capability that refreshes it.
pub struct Cache<T> {
    value: T,
    update: Box<dyn Recompute<T>>,
}

impl<T: Send + 'static> Cache<T> {
    /// Wrap `value` with an update capability. The first [`get`](Self::get)
    /// may already report a change.
    pub fn new(value: T, update: impl Recompute<T> + 'static) -> Self {
        Self {
            value,
            update: Box::new(update),
        }
    }

    /// Start from `T::default()` and refresh once, so the value is current
    /// before anyone reads it.
    pub fn computed(update: impl Recompute<T> + 'static) -> Self
    where
        T: Default,
    {
        let mut cache = Self::new(T::default(), update);
        cache.get();
        cache
    }

    /// A value that never changes.
    pub fn constant(value: T) -> Self {
        Self::new(value, |_: &T| -> Option<T> { None })
    }

    /// Refresh and return the value together with whether it changed.
    pub fn get(&mut self) -> (&T, bool) {
        match self.update.recompute(&self.value) {
            Some(next) => {
                self.value = next;
                (&self.value, true)
            }
            None => (&self.value, false),
        }
    }

    /// The value as of the last refresh, without refreshing.
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Move into a [`Shared`] cell.
    pub fn shared(self) -> Shared<T> {
        Arc::new(Mutex::new(self))
    }

    /// A cache whose value is `project(source)`, recomputed only when
    /// `source` reports a change.
    pub fn map<S, F>(source: Shared<S>, project: F) -> Self
    where
        S: Send + 'static,
        F: Fn(&S) -> T + Send + 'static,
    {
        let value = project(source.lock().value());
        Self::new(value, move |_: &T| {
            let mut source = source.lock();
            match source.get() {
                (value, true) => Some(project(value)),
                (_, false) => None,
            }
        })
    }
}

impl<I: Clone + Send + 'static> Cache<Vec<I>> {
    /// Concatenate several caches.
    ///
    /// Every member is polled on each refresh so that none of them keeps a
    /// pending change; the concatenation is only rebuilt if at least one
    /// member changed.
    pub fn any(members: Vec<Shared<Vec<I>>>) -> Self {
        let value = concat(&members);
        Self::new(value, move |_: &Vec<I>| {
            let mut changed = false;
            for member in &members {
                changed |= member.lock().get().1;
            }
            changed.then(|| concat(&members))
        })
    }
}

fn concat<I: Clone + Send + 'static>(members: &[Shared<Vec<I>>]) -> Vec<I> {
    let mut all = Vec::new();
    for member in members {
        all.extend(member.lock().value().iter().cloned());
    }
    all
}

impl<T: std::fmt::Debug> std::fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("value", &self.value).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
