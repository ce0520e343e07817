//! The unit the scheduler works with.
//!
//! A [`Plan`] pairs the actions to run each tick with the dependencies they
//! declare. Both halves are [`Shared`] caches, so a plan stays cheap to clone
//! and every holder observes the same refreshes.

use std::sync::Arc;

use entia_ecs::cache::{Cache, Shared};
use entia_ecs::dependency::Dependency;

/// A unit of work. Actions run on any thread, possibly concurrently with
/// other actions of the same group.
pub type Action = Arc<dyn Fn() + Send + Sync>;

/// Memoized actions and dependencies.
#[derive(Clone)]
pub struct Plan {
    /// What to run each tick.
    pub runs: Shared<Vec<Action>>,
    /// What the runs touch.
    pub dependencies: Shared<Vec<Dependency>>,
}

impl Plan {
    /// Wrap two caches.
    pub fn new(runs: Cache<Vec<Action>>, dependencies: Cache<Vec<Dependency>>) -> Self {
        Self {
            runs: runs.shared(),
            dependencies: dependencies.shared(),
        }
    }

    /// A plan whose actions and dependencies never change.
    pub fn constant(runs: Vec<Action>, dependencies: Vec<Dependency>) -> Self {
        Self::new(Cache::constant(runs), Cache::constant(dependencies))
    }

    /// A single action with fixed dependencies.
    pub fn single(
        action: impl Fn() + Send + Sync + 'static,
        dependencies: Vec<Dependency>,
    ) -> Self {
        Self::constant(vec![Arc::new(action) as Action], dependencies)
    }

    /// Nothing to do.
    pub fn empty() -> Self {
        Self::constant(Vec::new(), Vec::new())
    }

    /// Keep the runs and replace the dependencies with `project` of them.
    pub fn map_dependencies<F>(self, project: F) -> Self
    where
        F: Fn(&Vec<Dependency>) -> Vec<Dependency> + Send + 'static,
    {
        Self {
            runs: self.runs,
            dependencies: Cache::map(self.dependencies, project).shared(),
        }
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("runs", &self.runs.lock().value().len())
            .field("dependencies", self.dependencies.lock().value())
            .finish()
    }
}
