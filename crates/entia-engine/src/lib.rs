//! Entia Engine -- conflict-scheduled execution over an Entia world.
//!
//! This crate builds on [`entia_ecs`] to turn a declarative tree of work
//! ([`Node`](node::Node)) into a [`Schedule`](schedule::Schedule): plans that
//! touch disjoint data are grouped and run in parallel on a
//! [`WorkerPool`](pool::WorkerPool), plans that conflict run one group after
//! another. The schedule notices when new segments change what a plan
//! touches and regroups itself.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use entia_engine::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Position { x: f32 }
//!
//! let world = Arc::new(World::new());
//! let node = Node::all([
//!     Node::create(Template::<()>::new().add_value(Position { x: 0.0 }), 100),
//!     Node::each(|p: &mut Position| p.x += 1.0),
//!     Node::destroy(Matcher::True),
//! ]);
//!
//! let mut schedule = node.schedule(Arc::clone(&world), ScheduleConfig::default()).unwrap();
//! schedule.tick();
//! assert_eq!(world.count(), 0);
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod node;
pub mod plan;
pub mod pool;
pub mod schedule;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use entia_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while building a schedule.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An error from the storage layer.
    #[error(transparent)]
    Ecs(#[from] entia_ecs::EcsError),

    /// A configuration value is out of range.
    #[error("invalid schedule configuration '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// The worker pool could not be built.
    #[error("failed to build worker pool: {0}")]
    Spawn(#[from] rayon::ThreadPoolBuildError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use entia_ecs::prelude::*;

    // Engine-specific exports.
    pub use crate::config::ScheduleConfig;
    pub use crate::node::{Access, Node};
    pub use crate::plan::{Action, Plan};
    pub use crate::pool::WorkerPool;
    pub use crate::schedule::{partition, Schedule, State};
    pub use crate::EngineError;
}
