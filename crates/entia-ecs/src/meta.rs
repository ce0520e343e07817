//! Data type identity.
//!
//! Every type stored in a [`Chunk`](crate::segment::Chunk) is described by a
//! [`Meta`]: a process-wide interned record whose `index` is handed out by a
//! monotonically increasing counter and never changes. Metas are cheap to
//! copy, compare and sort, and double as column keys.
//!
//! Interning goes through a copy-on-write [`im::HashMap`] snapshot so readers
//! never take a lock longer than an `Arc` clone.

use std::any::TypeId;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::OnceLock;

use crate::atomic::Snapshot;
use crate::store::{Column, Store};

/// Anything that can live in a column.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

/// Interned identity of a component type.
///
/// Equality, ordering and hashing use `index` only; two metas with the same
/// index always describe the same Rust type.
#[derive(Clone, Copy)]
pub struct Meta {
    type_id: TypeId,
    index: u32,
    name: &'static str,
    new_store: fn(usize) -> Box<dyn Store>,
}

impl Meta {
    /// Intern `T`, returning its stable meta.
    pub fn of<T: Component>() -> Self {
        let type_id = TypeId::of::<T>();
        if let Some(meta) = Self::try_of(type_id) {
            return meta;
        }

        let mut reserved = None;
        let snapshot = registry().update(|metas| {
            if metas.contains_key(&type_id) {
                return None;
            }
            let index =
                *reserved.get_or_insert_with(|| NEXT_INDEX.fetch_add(1, AtomicOrdering::Relaxed));
            let meta = Meta {
                type_id,
                index,
                name: std::any::type_name::<T>(),
                new_store: new_column::<T>,
            };
            Some(metas.update(type_id, meta))
        });
        let meta = snapshot[&type_id];
        if reserved == Some(meta.index) {
            tracing::debug!(name = meta.name, index = meta.index, "interned component type");
        }
        meta
    }

    /// Look up an already interned type.
    pub fn try_of(type_id: TypeId) -> Option<Self> {
        registry().load().get(&type_id).copied()
    }

    /// The Rust type this meta describes.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Stable process-wide index.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// `std::any::type_name` of the described type.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this meta describes `T`.
    #[inline]
    pub fn is<T: Component>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Allocate an empty column with room for `capacity` rows.
    pub(crate) fn new_store(&self, capacity: usize) -> Box<dyn Store> {
        (self.new_store)(capacity)
    }
}

fn new_column<T: Component>(capacity: usize) -> Box<dyn Store> {
    Box::new(Column::<T>::with_capacity(capacity))
}

static NEXT_INDEX: AtomicU32 = AtomicU32::new(0);

fn registry() -> &'static Snapshot<im::HashMap<TypeId, Meta>> {
    static REGISTRY: OnceLock<Snapshot<im::HashMap<TypeId, Meta>>> = OnceLock::new();
    REGISTRY.get_or_init(Snapshot::default)
}

impl PartialEq for Meta {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Meta {}

impl PartialOrd for Meta {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Meta {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl Hash for Meta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl fmt::Debug for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Meta({}#{})", self.name, self.index)
    }
}

/// Sort and deduplicate a signature in place.
pub fn normalize(metas: &mut Vec<Meta>) {
    metas.sort_unstable();
    metas.dedup();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
