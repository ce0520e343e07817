//! Composable descriptions of work.
//!
//! A [`Node`] is resolved against a world into a flat list of [`Plan`]s when
//! a [`Schedule`](crate::schedule::Schedule) is built. Leaves are
//! [`Node::Scheduler`]s; the other variants defer ([`Node::Lazy`]), group
//! ([`Node::All`]) or post-process ([`Node::Mapper`]) them.
//!
//! The constructors here cover the common leaves: iterating chunks
//! ([`Node::run`], [`Node::each`]), creating entities ([`Node::create`]) and
//! destroying them ([`Node::destroy`]). Leaves that select segments with a
//! [`Matcher`] keep watching the world and pick up segments created later;
//! their dependency caches report a change when that happens, which is what
//! triggers a regroup.

use std::sync::Arc;

use entia_ecs::cache::{Cache, Shared};
use entia_ecs::dependency::{Dependency, Kind};
use entia_ecs::entity::Entity;
use entia_ecs::matcher::Matcher;
use entia_ecs::meta::{Component, Meta};
use entia_ecs::segment::{ChunkView, Segment};
use entia_ecs::template::{Creator, Template};
use entia_ecs::world::World;

use crate::config::ScheduleConfig;
use crate::plan::{Action, Plan};
use crate::schedule::Schedule;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Access
// ---------------------------------------------------------------------------

/// Declared access to one component type by a [`Node::run`] body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    /// Read or write.
    pub kind: Kind,
    /// The accessed type.
    pub meta: Meta,
}

impl Access {
    /// Shared access to `T`.
    pub fn read<T: Component>() -> Self {
        Self {
            kind: Kind::Read,
            meta: Meta::of::<T>(),
        }
    }

    /// Exclusive access to `T`.
    pub fn write<T: Component>() -> Self {
        Self {
            kind: Kind::Write,
            meta: Meta::of::<T>(),
        }
    }

    fn on(&self, segment: &Segment) -> Dependency {
        Dependency {
            kind: self.kind,
            meta: Some(self.meta),
            segment: Some(segment.index()),
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Resolves a node against the world.
pub type LazyFn = Arc<dyn Fn(&World) -> Node + Send + Sync>;
/// Post-processes one plan.
pub type MapFn = Arc<dyn Fn(Plan) -> Plan + Send + Sync>;
/// Builds a leaf plan.
pub type SchedulerFn = Arc<dyn Fn(&Arc<World>) -> Plan + Send + Sync>;

/// A tree of work descriptions.
#[derive(Clone)]
pub enum Node {
    /// Built from the world when the schedule is compiled.
    Lazy(LazyFn),
    /// Children in order.
    All(Vec<Node>),
    /// Applies the function to every plan of the inner node.
    Mapper(Box<Node>, MapFn),
    /// One plan.
    Scheduler(SchedulerFn),
}

impl Node {
    // -- combinators --------------------------------------------------------

    /// Run `nodes` in order, parallelizing where they do not conflict.
    pub fn all(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self::All(nodes.into_iter().collect())
    }

    /// Defer construction until the world is known.
    pub fn lazy(build: impl Fn(&World) -> Node + Send + Sync + 'static) -> Self {
        Self::Lazy(Arc::new(build))
    }

    /// Transform every plan produced by `self`.
    pub fn map(self, map: impl Fn(Plan) -> Plan + Send + Sync + 'static) -> Self {
        Self::Mapper(Box::new(self), Arc::new(map))
    }

    /// A leaf built directly from the world.
    pub fn scheduler(build: impl Fn(&Arc<World>) -> Plan + Send + Sync + 'static) -> Self {
        Self::Scheduler(Arc::new(build))
    }

    /// Add `dependencies` to every plan of `self`.
    pub fn depend(self, dependencies: Vec<Dependency>) -> Self {
        let dependencies: Arc<[Dependency]> = dependencies.into();
        self.map(move |plan| {
            let extra = Arc::clone(&dependencies);
            plan.map_dependencies(move |current| {
                current.iter().chain(extra.iter()).copied().collect()
            })
        })
    }

    /// Make every plan of `self` run alone.
    pub fn synchronize(self) -> Self {
        self.depend(vec![Dependency::unknown()])
    }

    // -- leaves -------------------------------------------------------------

    /// Call `body` on every non-empty chunk of every segment that stores all
    /// `access` types and matches `filter`.
    ///
    /// One action is produced per matching segment; the body must only
    /// touch the columns it declared. The body may release entities of the
    /// chunk it is visiting. Their rows are removed once the group is done.
    pub fn run<F>(access: impl IntoIterator<Item = Access>, filter: Matcher, body: F) -> Self
    where
        F: Fn(&ChunkView<'_>) + Send + Sync + 'static,
    {
        let access: Arc<[Access]> = access.into_iter().collect();
        let matcher = Matcher::all(
            access
                .iter()
                .map(|a| Matcher::Has(a.meta.type_id()))
                .chain([filter]),
        );
        let body: Arc<dyn Fn(&ChunkView<'_>) + Send + Sync> = Arc::new(body);

        Self::scheduler(move |world| {
            let runs: Shared<Vec<Action>> = {
                let body = Arc::clone(&body);
                watch(world, matcher.clone(), move |_, segments| {
                    segments
                        .iter()
                        .map(|segment| {
                            let segment = Arc::clone(segment);
                            let body = Arc::clone(&body);
                            Arc::new(move || {
                                for chunk in segment.chunks().iter() {
                                    let view = chunk.view();
                                    if !view.is_empty() {
                                        body(&view);
                                    }
                                }
                            }) as Action
                        })
                        .collect()
                })
            };
            let dependencies: Shared<Vec<Dependency>> = {
                let access = Arc::clone(&access);
                watch(world, matcher.clone(), move |_, segments| {
                    segments
                        .iter()
                        .flat_map(|segment| access.iter().map(move |a| a.on(segment)))
                        .collect()
                })
            };
            Plan { runs, dependencies }
        })
    }

    /// Call `body` on every `T` in the world.
    pub fn each<T, F>(body: F) -> Self
    where
        T: Component,
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        Self::run([Access::write::<T>()], Matcher::True, move |view| {
            if let Some(mut column) = view.write::<T>() {
                column.iter_mut().for_each(&body);
            }
        })
    }

    /// Create `count` entities from `template` every tick.
    pub fn create<S>(template: Template<S>, count: usize) -> Self
    where
        S: Default + Send + Sync + 'static,
    {
        Self::create_with(template, move || (0..count).map(|_| S::default()).collect())
    }

    /// Create one entity per state returned by `states` every tick.
    ///
    /// The plan writes every type of every segment the template creates
    /// into, children included, plus the segment's entity list.
    pub fn create_with<S, F>(template: Template<S>, states: F) -> Self
    where
        S: Send + Sync + 'static,
        F: Fn() -> Vec<S> + Send + Sync + 'static,
    {
        let states = Arc::new(states);
        Self::scheduler(move |world| {
            let creator = Creator::new(world, &template);
            let dependencies = creator
                .segments()
                .iter()
                .flat_map(|segment| writes(segment))
                .collect();
            let world = Arc::clone(world);
            let states = Arc::clone(&states);
            Plan::single(
                move || {
                    creator.create(&world, &states());
                },
                dependencies,
            )
        })
    }

    /// Release every entity in segments matching `matcher` every tick.
    ///
    /// [`Matcher::True`] sweeps the whole world, including segments created
    /// by other plans of the same tick, and therefore declares
    /// [`Kind::Unknown`]. Any other matcher writes every type and the entity
    /// list of each matching segment.
    pub fn destroy(matcher: Matcher) -> Self {
        Self::scheduler(move |world| {
            if matcher == Matcher::True {
                let world = Arc::clone(world);
                return Plan::single(
                    move || {
                        for segment in world.segments().iter() {
                            release_all(&world, segment);
                        }
                    },
                    vec![Dependency::unknown()],
                );
            }
            let runs: Shared<Vec<Action>> = watch(world, matcher.clone(), |world, segments| {
                segments
                    .iter()
                    .map(|segment| {
                        let world = Arc::clone(world);
                        let segment = Arc::clone(segment);
                        Arc::new(move || release_all(&world, &segment)) as Action
                    })
                    .collect()
            });
            let dependencies: Shared<Vec<Dependency>> =
                watch(world, matcher.clone(), |_, segments| {
                    segments.iter().flat_map(|segment| writes(segment)).collect()
                });
            Plan { runs, dependencies }
        })
    }

    // -- compilation --------------------------------------------------------

    /// Compile into a [`Schedule`] bound to `world`.
    pub fn schedule(
        &self,
        world: Arc<World>,
        config: ScheduleConfig,
    ) -> Result<Schedule, EngineError> {
        Schedule::new(self, world, config)
    }

    /// Resolve into plans, left to right.
    pub fn flatten(&self, world: &Arc<World>) -> Vec<Plan> {
        let mut plans = Vec::new();
        self.flatten_into(world, &mut plans);
        plans
    }

    fn flatten_into(&self, world: &Arc<World>, plans: &mut Vec<Plan>) {
        match self {
            Self::Lazy(build) => build(world).flatten_into(world, plans),
            Self::All(nodes) => {
                for node in nodes {
                    node.flatten_into(world, plans);
                }
            }
            Self::Mapper(inner, map) => {
                plans.extend(inner.flatten(world).into_iter().map(|plan| map(plan)));
            }
            Self::Scheduler(build) => plans.push(build(world)),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lazy(_) => f.write_str("Lazy"),
            Self::All(nodes) => f.debug_tuple("All").field(nodes).finish(),
            Self::Mapper(inner, _) => f.debug_tuple("Mapper").field(inner).finish(),
            Self::Scheduler(_) => f.write_str("Scheduler"),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Write access to the entity list and every column of `segment`.
fn writes(segment: &Segment) -> Vec<Dependency> {
    std::iter::once(Meta::of::<Entity>())
        .chain(segment.metas().iter().copied())
        .map(|meta| Dependency::write(meta, segment.index()))
        .collect()
}

fn release_all(world: &World, segment: &Segment) {
    for chunk in segment.chunks().iter() {
        let entities = chunk.view().entities().to_vec();
        for entity in entities {
            world.release(entity);
        }
    }
}

/// A cache of `build(matching segments)`, refreshed when the set of segments
/// selected by `matcher` grows.
fn watch<T, F>(world: &Arc<World>, matcher: Matcher, build: F) -> Shared<T>
where
    T: Default + Send + 'static,
    F: Fn(&Arc<World>, &[Arc<Segment>]) -> T + Send + 'static,
{
    let world = Arc::clone(world);
    let mut seen = None;
    let mut selected: Option<Vec<u32>> = None;
    Cache::computed(move |_: &T| {
        let segments = world.segments();
        if seen == Some(segments.len()) {
            return None;
        }
        seen = Some(segments.len());

        let matching: Vec<Arc<Segment>> = segments
            .iter()
            .filter(|segment| matcher.matches(segment, &world))
            .cloned()
            .collect();
        let indices: Vec<u32> = matching.iter().map(|segment| segment.index()).collect();
        if selected.as_ref() == Some(&indices) {
            return None;
        }
        selected = Some(indices);
        Some(build(&world, &matching))
    })
    .shared()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
