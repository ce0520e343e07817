//! Declarative entity shapes.
//!
//! A [`Template<S>`] lists the component types of an entity together with an
//! initializer for each, computed from a caller state `S` and the row
//! [`Context`]. Templates can carry child templates to create hierarchies,
//! and can be merged ([`Template::all`]) or re-targeted to a different state
//! type ([`Template::adapt`]).
//!
//! A [`Creator`] compiles a template against a [`World`]: it resolves the
//! segment for the template's type set once and composes the initializers
//! into one per-row function.
//!
//! ```
//! use entia_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32 }
//! #[derive(Debug, Clone, PartialEq)]
//! struct Speed(f32);
//!
//! let world = World::new();
//! let template = Template::<f32>::new()
//!     .add(|_, speed: &f32| Speed(*speed))
//!     .add_value(Position { x: 0.0 });
//!
//! let creator = Creator::new(&world, &template);
//! let entities = creator.create(&world, &[1.0, 2.0]);
//! assert_eq!(world.read(entities[1], |s: &Speed| s.0), Some(2.0));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::entity::Entity;
use crate::meta::{Component, Meta};
use crate::segment::{Context, Segment};
use crate::store::Store;
use crate::world::World;

/// Pushes one value into a column.
type Initialize<S> = Arc<dyn Fn(&mut dyn Store, &Context, &S) + Send + Sync>;

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// The shape of an entity (and optionally its children).
pub struct Template<S> {
    initializers: BTreeMap<Meta, Initialize<S>>,
    children: Vec<Template<S>>,
    size: Option<usize>,
}

impl<S: 'static> Template<S> {
    /// An entity with no components.
    pub fn new() -> Self {
        Self {
            initializers: BTreeMap::new(),
            children: Vec::new(),
            size: None,
        }
    }

    /// Add a `T` computed per row. Replaces any earlier initializer for `T`.
    pub fn add<T, F>(mut self, init: F) -> Self
    where
        T: Component,
        F: Fn(&Context, &S) -> T + Send + Sync + 'static,
    {
        let initialize: Initialize<S> =
            Arc::new(move |store: &mut dyn Store, context: &Context, state: &S| {
                if let Some(column) = store.column_mut::<T>() {
                    column.push(init(context, state));
                }
            });
        self.initializers.insert(Meta::of::<T>(), initialize);
        self
    }

    /// Add a copy of `value` to every row.
    pub fn add_value<T: Component + Clone>(self, value: T) -> Self {
        self.add(move |_, _| value.clone())
    }

    /// Drop `T` from the shape.
    pub fn remove<T: Component>(mut self) -> Self {
        self.initializers.remove(&Meta::of::<T>());
        self
    }

    /// Append a child shape; every created entity gets one such child.
    pub fn adopt(mut self, child: Template<S>) -> Self {
        self.children.push(child);
        self
    }

    /// Rows per chunk for the segment, if this template creates it.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Merge templates. Later templates win per type, children are
    /// concatenated, and the size hint is the largest one given.
    pub fn all(templates: impl IntoIterator<Item = Template<S>>) -> Self {
        let mut merged = Self::new();
        for template in templates {
            merged.initializers.extend(template.initializers);
            merged.children.extend(template.children);
            merged.size = merged.size.max(template.size);
        }
        merged
    }

    /// Reuse this template under a state type `B`, projecting `B` to `S` for
    /// every initializer.
    pub fn adapt<B, P>(self, project: P) -> Template<B>
    where
        B: 'static,
        P: Fn(&B) -> S + Send + Sync + 'static,
    {
        self.adapt_shared(Arc::new(project))
    }

    fn adapt_shared<B: 'static>(self, project: Arc<dyn Fn(&B) -> S + Send + Sync>) -> Template<B> {
        let initializers = self
            .initializers
            .into_iter()
            .map(|(meta, init)| {
                let project = Arc::clone(&project);
                let adapted: Initialize<B> =
                    Arc::new(move |store: &mut dyn Store, context: &Context, state: &B| {
                        init(store, context, &project(state))
                    });
                (meta, adapted)
            })
            .collect();
        let children = self
            .children
            .into_iter()
            .map(|child| child.adapt_shared(Arc::clone(&project)))
            .collect();
        Template {
            initializers,
            children,
            size: self.size,
        }
    }

    /// The component types, sorted.
    pub fn metas(&self) -> Vec<Meta> {
        self.initializers.keys().copied().collect()
    }

    /// Child templates.
    pub fn children(&self) -> &[Template<S>] {
        &self.children
    }

    /// The size hint, if any.
    pub fn size_hint(&self) -> Option<usize> {
        self.size
    }
}

impl<S: 'static> Default for Template<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for Template<S> {
    fn clone(&self) -> Self {
        Self {
            initializers: self.initializers.clone(),
            children: self.children.clone(),
            size: self.size,
        }
    }
}

impl<S> std::fmt::Debug for Template<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("metas", &self.initializers.keys().collect::<Vec<_>>())
            .field("children", &self.children)
            .field("size", &self.size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Creator
// ---------------------------------------------------------------------------

/// A template compiled against one world.
pub struct Creator<S> {
    segment: Arc<Segment>,
    initializers: Vec<Initialize<S>>,
    children: Vec<Creator<S>>,
}

impl<S: 'static> Creator<S> {
    /// Resolve the segments of `template` and its children in `world`.
    pub fn new(world: &World, template: &Template<S>) -> Self {
        let segment = world.segment_with_capacity(&template.metas(), template.size);
        Self {
            segment,
            initializers: template.initializers.values().cloned().collect(),
            children: template
                .children
                .iter()
                .map(|child| Creator::new(world, child))
                .collect(),
        }
    }

    /// The segment root entities are created in.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Every segment this creator writes to, root first.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        let mut segments = vec![Arc::clone(&self.segment)];
        for child in &self.children {
            segments.extend(child.segments());
        }
        segments
    }

    /// Create one root entity per state, each with its child subtrees.
    ///
    /// `world` must be the world this creator was compiled against.
    pub fn create(&self, world: &World, states: &[S]) -> Vec<Entity> {
        self.create_under(world, states, &[])
    }

    fn create_under(&self, world: &World, states: &[S], parents: &[Entity]) -> Vec<Entity> {
        debug_assert!(
            world
                .segments()
                .get(self.segment.index() as usize)
                .is_some_and(|s| Arc::ptr_eq(s, &self.segment)),
            "creator used with a foreign world"
        );
        let entities = world.reserve(states.len());
        world.initialize(&entities, parents, &self.segment, |row| {
            let context = *row.context();
            let state = &states[context.index];
            for (slot, init) in self.initializers.iter().enumerate() {
                init(row.store(slot), &context, state);
            }
        });
        for child in &self.children {
            child.create_under(world, states, &entities);
        }
        entities
    }
}

impl World {
    /// Create a single entity from `template`.
    pub fn create<S: 'static>(&self, template: &Template<S>, state: S) -> Entity {
        Creator::new(self, template)
            .create(self, std::slice::from_ref(&state))
            .first()
            .copied()
            .unwrap_or(Entity::NULL)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Tag(&'static str);

    #[test]
    fn add_is_last_write_wins() {
        let world = World::new();
        let template = Template::<()>::new()
            .add_value(Health(1))
            .add_value(Health(2));
        assert_eq!(template.metas(), vec![Meta::of::<Health>()]);
        let e = world.create(&template, ());
        assert_eq!(world.get_cloned::<Health>(e).unwrap(), Health(2));
    }

    #[test]
    fn remove_drops_type() {
        let template = Template::<()>::new()
            .add_value(Health(1))
            .add_value(Position { x: 0.0 })
            .remove::<Health>();
        assert_eq!(template.metas(), vec![Meta::of::<Position>()]);
    }

    #[test]
    fn initializers_see_state_and_context() {
        let world = World::new();
        let template = Template::<u32>::new()
            .add(|_, hp: &u32| Health(*hp))
            .add(|context, _| Position {
                x: context.index as f32,
            });
        let entities = Creator::new(&world, &template).create(&world, &[10, 20, 30]);
        assert_eq!(world.get_cloned::<Health>(entities[2]).unwrap(), Health(30));
        assert_eq!(world.read(entities[1], |p: &Position| p.x), Some(1.0));
    }

    #[test]
    fn all_merges_with_later_templates_winning() {
        let first = Template::<()>::new()
            .add_value(Health(1))
            .size(4)
            .adopt(Template::new().add_value(Tag("a")));
        let second = Template::<()>::new()
            .add_value(Health(2))
            .add_value(Position { x: 0.0 })
            .size(16)
            .adopt(Template::new().add_value(Tag("b")));
        let merged = Template::all([first, second]);

        assert_eq!(merged.metas().len(), 2);
        assert_eq!(merged.children().len(), 2);
        assert_eq!(merged.size_hint(), Some(16));

        let world = World::new();
        let e = world.create(&merged, ());
        assert_eq!(world.get_cloned::<Health>(e).unwrap(), Health(2));
        assert_eq!(world.children(e).unwrap().len(), 2);
    }

    #[test]
    fn adapt_projects_state() {
        let health = Template::<u32>::new().add(|_, hp: &u32| Health(*hp));
        let adapted: Template<(u32, &'static str)> = Template::all([
            health.adapt(|state: &(u32, &'static str)| state.0),
            Template::new().add(|_, state: &(u32, &'static str)| Tag(state.1)),
        ]);
        let world = World::new();
        let e = world.create(&adapted, (7, "hero"));
        assert_eq!(world.get_cloned::<Health>(e).unwrap(), Health(7));
        assert_eq!(world.get_cloned::<Tag>(e).unwrap(), Tag("hero"));
    }

    #[test]
    fn children_are_parented_per_root() {
        let world = World::new();
        let template = Template::<()>::new()
            .add_value(Health(100))
            .adopt(Template::new().add_value(Tag("weapon")));
        let creator = Creator::new(&world, &template);
        let roots = creator.create(&world, &[(), ()]);

        for root in roots {
            let children = world.children(root).unwrap();
            assert_eq!(children.len(), 1);
            assert_eq!(world.parent(children[0]), Some(root));
            assert_eq!(world.get_cloned::<Tag>(children[0]).unwrap(), Tag("weapon"));
        }
        assert_eq!(creator.segments().len(), 2);
    }

    #[test]
    fn size_hint_sets_chunk_capacity() {
        let world = World::new();
        let template = Template::<()>::new().add_value(Tag("sized")).size(3);
        let creator = Creator::new(&world, &template);
        assert_eq!(creator.segment().chunk_capacity(), 3);
        creator.create(&world, &[(), (), (), ()]);
        assert_eq!(creator.segment().chunks().len(), 2);
    }

    #[test]
    fn same_type_set_shares_segment() {
        let world = World::new();
        let a = Template::<()>::new()
            .add_value(Health(1))
            .add_value(Position { x: 0.0 });
        let b = Template::<()>::new()
            .add_value(Position { x: 1.0 })
            .add_value(Health(2));
        assert!(Arc::ptr_eq(
            Creator::new(&world, &a).segment(),
            Creator::new(&world, &b).segment()
        ));
    }
}
