//! Entia ECS -- archetype storage shared by many threads.
//!
//! Entities live in [`Segment`](segment::Segment)s, one per exact set of
//! component types, split into fixed-capacity [`Chunk`](segment::Chunk)s of
//! parallel columns. The [`World`](world::World) hands out generational
//! [`Entity`](entity::Entity) identifiers, keeps the indirection table from
//! identifier to row, and exposes every operation through `&self` so one
//! world can be shared behind an `Arc`.
//!
//! On top of the storage sit the pieces a scheduler needs to reason about
//! work: [`Matcher`](matcher::Matcher)s select segments,
//! [`Template`](template::Template)s describe what to create, and
//! [`Dependency`](dependency::Dependency) lists declare what a unit of work
//! touches.
//!
//! # Quick Start
//!
//! ```
//! use entia_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let world = World::new();
//! let template = Template::<()>::new()
//!     .add_value(Position { x: 0.0, y: 0.0 })
//!     .add_value(Velocity { dx: 1.0, dy: 0.0 });
//! let entity = world.create(&template, ());
//!
//! assert_eq!(world.get_cloned::<Position>(entity).unwrap(), Position { x: 0.0, y: 0.0 });
//! assert!(world.release(entity));
//! assert!(!world.is_alive(entity));
//! ```

#![deny(unsafe_code)]

pub mod atomic;
pub mod cache;
pub mod dependency;
pub mod entity;
pub mod matcher;
pub mod meta;
pub mod segment;
pub mod store;
pub mod template;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity is not alive (released, reserved only, or never issued).
    #[error("entity {entity:?} is not alive")]
    StaleEntity { entity: entity::Entity },

    /// The entity is alive but its segment has no column of that type.
    #[error("entity {entity:?} has no component '{component}'")]
    MissingComponent {
        entity: entity::Entity,
        component: &'static str,
    },

    /// A configuration value is out of range.
    #[error("invalid world configuration '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::cache::{Cache, Recompute, Shared};
    pub use crate::dependency::{conflicts, Dependency, Kind};
    pub use crate::entity::{Entity, Family};
    pub use crate::matcher::Matcher;
    pub use crate::meta::{Component, Meta};
    pub use crate::segment::{Chunk, ChunkView, Context, Row, Segment};
    pub use crate::template::{Creator, Template};
    pub use crate::world::{Datum, World, WorldConfig};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
