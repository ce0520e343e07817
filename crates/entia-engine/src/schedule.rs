//! The compiled, steady-state form of a [`Node`].
//!
//! Building a [`Schedule`] does the expensive work once:
//!
//! 1. **Flatten** the node tree into plans, left to right.
//! 2. **Group** consecutive plans whose dependencies do not conflict with
//!    what is already in the group. A plan that conflicts starts a new group.
//! 3. **Merge** each group's runs and dependencies into one cache that is
//!    only rebuilt when one of its members changes.
//!
//! [`Schedule::tick`] then walks the groups in order. Actions inside a group
//! may run in parallel on the worker pool; groups never overlap. When a
//! group's dependencies change (typically because a new segment appeared),
//! that group runs sequentially for the tick and steps 2-3 are redone once
//! the whole tick has finished, so no batch is ever regrouped while it runs.
//! Rows released while a chunk was in use are removed between groups with
//! [`World::flush`].
//!
//! ```
//! use std::sync::Arc;
//! use entia_engine::prelude::*;
//!
//! #[derive(Debug, Clone, Default)]
//! struct Counter(u32);
//!
//! let world = Arc::new(World::new());
//! let node = Node::all([
//!     Node::create(Template::<()>::new().add_value(Counter(0)), 10),
//!     Node::each(|c: &mut Counter| c.0 += 1),
//! ]);
//! let mut schedule = node.schedule(Arc::clone(&world), ScheduleConfig::default()).unwrap();
//! schedule.tick();
//! assert_eq!(world.count(), 10);
//! ```

use std::ops::Range;
use std::sync::Arc;

use entia_ecs::cache::Cache;
use entia_ecs::dependency::{conflicts, Dependency};
use entia_ecs::world::World;

use crate::config::ScheduleConfig;
use crate::node::Node;
use crate::plan::{Action, Plan};
use crate::pool::WorkerPool;
use crate::EngineError;

/// How the most recent tick went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Every group ran with the dependencies it was built from.
    Stable,
    /// A group's dependencies changed during the tick. That group ran
    /// sequentially and the groups were rebuilt after the tick.
    Invalidated,
}

/// Consecutive plans that may run together.
struct Group {
    plans: Range<usize>,
    runs: Cache<Vec<Action>>,
    dependencies: Cache<Vec<Dependency>>,
}

/// A node compiled against one world.
pub struct Schedule {
    world: Arc<World>,
    config: ScheduleConfig,
    pool: WorkerPool,
    plans: Vec<Plan>,
    groups: Vec<Group>,
    state: State,
    regroups: usize,
    ticks: u64,
}

impl Schedule {
    /// Flatten `node` against `world` and group the resulting plans.
    pub fn new(
        node: &Node,
        world: Arc<World>,
        config: ScheduleConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let pool = WorkerPool::new(config.workers)?;
        let plans = node.flatten(&world);
        let mut schedule = Self {
            world,
            config,
            pool,
            plans,
            groups: Vec::new(),
            state: State::Stable,
            regroups: 0,
            ticks: 0,
        };
        schedule.group();
        tracing::debug!(
            plans = schedule.plans.len(),
            groups = schedule.groups.len(),
            workers = schedule.pool.threads(),
            "compiled schedule"
        );
        Ok(schedule)
    }

    /// Run every group once, in order.
    ///
    /// Deferred removals are flushed after each group, so a group never
    /// observes rows released by an earlier one.
    pub fn tick(&mut self) {
        self.state = State::Stable;
        let mut changed = false;
        for group in &mut self.groups {
            let dependencies_changed = group.dependencies.get().1;
            let (runs, runs_changed) = group.runs.get();
            changed |= dependencies_changed || runs_changed;

            if dependencies_changed {
                self.state = State::Invalidated;
                run_sequential(runs);
            } else if runs.len() > self.config.parallel_threshold {
                if !self.pool.run(runs) {
                    tracing::warn!(
                        actions = runs.len(),
                        "worker pool refused batch, running sequentially"
                    );
                    run_sequential(runs);
                }
            } else {
                run_sequential(runs);
            }

            let flushed = self.world.flush();
            if flushed > 0 {
                tracing::trace!(flushed, "flushed deferred removals");
            }
        }
        self.ticks += 1;
        tracing::trace!(
            tick = self.ticks,
            groups = self.groups.len(),
            state = ?self.state,
            "ticked"
        );

        if changed {
            self.regroup();
        }
    }

    /// Rebuild the groups from the plans' current dependencies.
    pub fn regroup(&mut self) {
        self.group();
        self.regroups += 1;
        tracing::debug!(
            regroups = self.regroups,
            groups = ?self.groups(),
            "regrouped schedule"
        );
    }

    fn group(&mut self) {
        let dependencies: Vec<Vec<Dependency>> = self
            .plans
            .iter()
            .map(|plan| plan.dependencies.lock().get().0.clone())
            .collect();
        self.groups = partition(&dependencies)
            .into_iter()
            .map(|range| {
                let members = &self.plans[range.clone()];
                Group {
                    runs: Cache::any(members.iter().map(|p| Arc::clone(&p.runs)).collect()),
                    dependencies: Cache::any(
                        members
                            .iter()
                            .map(|p| Arc::clone(&p.dependencies))
                            .collect(),
                    ),
                    plans: range,
                }
            })
            .collect();
    }

    /// How the most recent tick went. [`State::Stable`] before the first tick.
    pub fn state(&self) -> State {
        self.state
    }

    /// Number of plans in each group.
    pub fn groups(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.plans.len()).collect()
    }

    /// How many times the groups were rebuilt after compilation.
    pub fn regroups(&self) -> usize {
        self.regroups
    }

    /// Completed ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The world this schedule runs against.
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// The flattened plans, in order.
    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("groups", &self.groups())
            .field("state", &self.state)
            .field("regroups", &self.regroups)
            .field("ticks", &self.ticks)
            .finish()
    }
}

fn run_sequential(runs: &[Action]) {
    for action in runs {
        action();
    }
}

/// Split plans into consecutive groups.
///
/// A plan joins the current group unless its dependencies conflict with the
/// union of the group's dependencies so far. The first plan of a group is
/// never checked, so a plan that conflicts with everything still forms a
/// group on its own.
pub fn partition(dependencies: &[Vec<Dependency>]) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    let mut accumulated: Vec<Dependency> = Vec::new();
    for (index, current) in dependencies.iter().enumerate() {
        if index > start && conflicts(&accumulated, current) {
            groups.push(start..index);
            start = index;
            accumulated.clear();
        }
        accumulated.extend_from_slice(current);
    }
    if start < dependencies.len() {
        groups.push(start..dependencies.len());
    }
    groups
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
