//! Entity identifiers.
//!
//! An [`Entity`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. The index selects a slot in
//! the [`World`](crate::world::World)'s indirection table; the generation is
//! bumped every time that slot is recycled, which makes stale handles fail the
//! liveness check immediately.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity identifier.
///
/// Layout: `[generation: u32 | index: u32]`
///
/// Generations start at 1, so the all-zero value is never issued and serves as
/// the [`Entity::NULL`] sentinel (used for "no parent").
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Entity(u64);

impl Entity {
    /// The invalid entity. Never returned by [`World::reserve`](crate::world::World::reserve).
    pub const NULL: Self = Self(0);

    /// Construct an `Entity` from an index and generation.
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Whether this is the [`Entity::NULL`] sentinel.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw `u64` representation.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Entity(null)")
        } else {
            write!(f, "Entity({}v{})", self.index(), self.generation())
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// Family
// ---------------------------------------------------------------------------

/// An alive entity together with its hierarchy links, as yielded by
/// [`World::families`](crate::world::World::families).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Family {
    /// The entity itself.
    pub entity: Entity,
    /// Its parent, or [`Entity::NULL`] for roots.
    pub parent: Entity,
    /// Its direct children, in insertion order.
    pub children: Vec<Entity>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
