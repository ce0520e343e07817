//! The [`World`] owns the entity indirection table, the segment registry and
//! the allocation/release protocols.
//!
//! Creating an entity is two steps:
//!
//! 1. [`reserve`](World::reserve) hands out identifiers. Recycled indices come
//!    from a lock-free stack (with their generation bumped), fresh ones from
//!    an atomic counter. The indirection table grows by swapping in a larger
//!    block list; a thread that loses that race just drops its copy.
//! 2. [`initialize`](World::initialize) places reserved entities into a
//!    segment, filling chunk rows under that chunk's lock and publishing the
//!    new row count only after every column of every row is written.
//!
//! [`release`](World::release) claims the entity with one compare-and-swap
//! and then removes its row if the chunk can be locked without waiting.
//! Otherwise the row is left in place for [`flush`](World::flush) or the next
//! structural change of that chunk, so code iterating a chunk may release
//! entities it is looking at.
//!
//! Every method takes `&self`; a world is meant to be shared behind an `Arc`
//! by all worker threads.

use std::any::TypeId;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::atomic::{FreeQueue, FreeStack, Snapshot};
use crate::entity::{Entity, Family};
use crate::meta::{self, Component, Meta};
use crate::segment::{self, Chunk, ChunkMut, Context, Row, Segment};
use crate::EcsError;

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for a [`World`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Rows per chunk for segments created without an explicit size.
    pub chunk_capacity: usize,
    /// Number of datum slots added per indirection-table block.
    pub table_block_size: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: 128,
            table_block_size: 256,
        }
    }
}

impl WorldConfig {
    /// Reject zero sizes.
    pub fn validate(&self) -> Result<(), EcsError> {
        if self.chunk_capacity == 0 {
            return Err(EcsError::InvalidConfig {
                field: "chunk_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        if self.table_block_size == 0 {
            return Err(EcsError::InvalidConfig {
                field: "table_block_size",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Datum
// ---------------------------------------------------------------------------

/// Where an alive entity is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datum {
    /// Row within the chunk.
    pub index: u32,
    /// Parent entity, or [`Entity::NULL`].
    pub parent: Entity,
    /// Index of the segment in [`World::segments`].
    pub segment: u32,
    /// Index of the chunk within the segment.
    pub chunk: u32,
}

/// One entry of the indirection table.
///
/// `state` packs the generation of the index (high 32 bits) with the segment
/// index plus one (low 32 bits, zero when the index holds no live entity), so
/// that release can claim an entity with a single compare-and-swap.
///
/// Hierarchy links live here rather than in the chunk, so linking a child
/// never needs a chunk lock.
#[derive(Debug, Default)]
struct Slot {
    state: AtomicU64,
    chunk: AtomicU32,
    row: AtomicU32,
    parent: AtomicU64,
    children: Mutex<Vec<Entity>>,
}

#[inline]
fn pack(generation: u32, segment: Option<u32>) -> u64 {
    ((generation as u64) << 32) | segment.map_or(0, |s| s as u64 + 1)
}

#[inline]
fn unpack(state: u64) -> (u32, Option<u32>) {
    let low = state as u32;
    ((state >> 32) as u32, low.checked_sub(1))
}

#[inline]
fn next_generation(generation: u32) -> u32 {
    generation.wrapping_add(1).max(1)
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Grow-only indirection table made of fixed-size blocks.
#[derive(Debug)]
struct Table {
    blocks: Snapshot<Vec<Arc<[Slot]>>>,
    block_size: usize,
}

/// A slot kept alive by its block.
struct SlotRef {
    block: Arc<[Slot]>,
    offset: usize,
}

impl Deref for SlotRef {
    type Target = Slot;

    fn deref(&self) -> &Slot {
        &self.block[self.offset]
    }
}

impl Table {
    fn new(block_size: usize) -> Self {
        Self {
            blocks: Snapshot::default(),
            block_size,
        }
    }

    fn get(&self, index: u32) -> Option<SlotRef> {
        let index = index as usize;
        let block = self.blocks.load().get(index / self.block_size).cloned()?;
        Some(SlotRef {
            block,
            offset: index % self.block_size,
        })
    }

    /// Make sure `index` has a slot, doubling the block count as needed.
    fn ensure(&self, index: u32) -> SlotRef {
        let needed = index as usize / self.block_size + 1;
        let blocks = self.blocks.update(|blocks| {
            if blocks.len() >= needed {
                return None;
            }
            let target = needed.max(blocks.len() * 2);
            let mut grown = Vec::with_capacity(target);
            grown.extend(blocks.iter().cloned());
            grown.resize_with(target, || {
                (0..self.block_size).map(|_| Slot::default()).collect()
            });
            tracing::debug!(
                blocks = target,
                slots = target * self.block_size,
                "grew entity table"
            );
            Some(grown)
        });
        SlotRef {
            block: Arc::clone(&blocks[index as usize / self.block_size]),
            offset: index as usize % self.block_size,
        }
    }

    fn capacity(&self) -> usize {
        self.blocks.load().len() * self.block_size
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Entities, their storage, and the registries describing both.
#[derive(Debug)]
pub struct World {
    config: WorldConfig,
    table: Table,
    next: AtomicU32,
    free: FreeStack<u32>,
    deferred: FreeQueue<Arc<Chunk>>,
    segments: Snapshot<Vec<Arc<Segment>>>,
    metas: Snapshot<im::HashMap<TypeId, Meta>>,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create an empty world with [`WorldConfig::default`].
    pub fn new() -> Self {
        Self::build(WorldConfig::default())
    }

    /// Create an empty world with custom sizes.
    pub fn with_config(config: WorldConfig) -> Result<Self, EcsError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: WorldConfig) -> Self {
        Self {
            table: Table::new(config.table_block_size),
            config,
            next: AtomicU32::new(0),
            free: FreeStack::new(),
            deferred: FreeQueue::new(),
            segments: Snapshot::default(),
            metas: Snapshot::default(),
        }
    }

    /// The configuration this world was built with.
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // -- type registry ------------------------------------------------------

    /// Intern `T` and register it with this world.
    pub fn meta<T: Component>(&self) -> Meta {
        let meta = Meta::of::<T>();
        self.register(&[meta]);
        meta
    }

    /// The meta of a type registered with this world.
    pub fn try_meta(&self, type_id: TypeId) -> Option<Meta> {
        self.metas.load().get(&type_id).copied()
    }

    fn register(&self, metas: &[Meta]) {
        self.metas.update(|known| {
            let missing: Vec<&Meta> = metas
                .iter()
                .filter(|m| !known.contains_key(&m.type_id()))
                .collect();
            if missing.is_empty() {
                return None;
            }
            let mut next = known.clone();
            for meta in missing {
                next.insert(meta.type_id(), *meta);
            }
            Some(next)
        });
    }

    // -- segments -----------------------------------------------------------

    /// Snapshot of every segment, indexed by [`Segment::index`].
    pub fn segments(&self) -> Arc<Vec<Arc<Segment>>> {
        self.segments.load()
    }

    /// The segment for exactly `metas` (any order, duplicates ignored),
    /// created on first use with the configured chunk capacity.
    pub fn segment(&self, metas: &[Meta]) -> Arc<Segment> {
        self.segment_with_capacity(metas, None)
    }

    /// Like [`segment`](Self::segment); `capacity` only applies if the
    /// segment does not exist yet.
    pub fn segment_with_capacity(&self, metas: &[Meta], capacity: Option<usize>) -> Arc<Segment> {
        let mut metas = metas.to_vec();
        meta::normalize(&mut metas);

        loop {
            let current = self.segments.load();
            if let Some(found) = current.iter().find(|s| s.metas() == metas.as_slice()) {
                return Arc::clone(found);
            }

            let capacity = capacity.unwrap_or(self.config.chunk_capacity);
            let segment = Arc::new(Segment::new(
                current.len() as u32,
                metas.clone(),
                capacity,
            ));
            let mut grown = Vec::with_capacity(current.len() + 1);
            grown.extend(current.iter().cloned());
            grown.push(Arc::clone(&segment));

            if self.segments.compare_and_swap(&current, Arc::new(grown)).is_ok() {
                self.register(&metas);
                tracing::debug!(
                    segment = segment.index(),
                    metas = ?segment.metas(),
                    capacity = segment.chunk_capacity(),
                    "created segment"
                );
                return segment;
            }
        }
    }

    // -- allocation ---------------------------------------------------------

    /// Hand out `count` entities that are not yet stored anywhere.
    ///
    /// Reserved entities are not alive until [`initialize`](Self::initialize)
    /// places them in a segment.
    pub fn reserve(&self, count: usize) -> Vec<Entity> {
        let mut entities = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(index) = self.free.pop() {
                if let Some(slot) = self.table.get(index) {
                    let previous = slot
                        .state
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                            Some(pack(next_generation(unpack(state).0), None))
                        })
                        .unwrap_or_else(|state| state);
                    entities.push(Entity::new(index, next_generation(unpack(previous).0)));
                    continue;
                }
            }
            let index = self.next.fetch_add(1, Ordering::Relaxed);
            debug_assert!(index < u32::MAX, "entity indices exhausted");
            let slot = self.table.ensure(index);
            slot.state.store(pack(1, None), Ordering::Release);
            entities.push(Entity::new(index, 1));
        }
        tracing::trace!(count, "reserved entities");
        entities
    }

    /// Store reserved `entities` in `segment`.
    ///
    /// `parents` is either empty (all roots) or parallel to `entities`;
    /// parents that are not alive are recorded as [`Entity::NULL`]. `init` is
    /// called once per row, under the chunk lock, and must push one value
    /// into every column of the segment.
    pub fn initialize<F>(
        &self,
        entities: &[Entity],
        parents: &[Entity],
        segment: &Arc<Segment>,
        mut init: F,
    ) where
        F: FnMut(&mut Row<'_, '_>),
    {
        debug_assert!(parents.is_empty() || parents.len() == entities.len());
        let parents: Vec<Entity> = (0..entities.len())
            .map(|i| match parents.get(i) {
                Some(&parent) if self.is_alive(parent) => parent,
                _ => Entity::NULL,
            })
            .collect();

        let mut done = 0;
        while done < entities.len() {
            let chunk = segment.next();
            let filled = chunk.try_lock().map(|mut guard| {
                let swept = self.sweep(&mut guard);
                let taken = self.fill(
                    &mut guard,
                    segment,
                    &entities[done..],
                    &parents[done..],
                    done,
                    &mut init,
                );
                (swept, taken)
            });
            let (chunk, swept, taken) = match filled {
                Some((swept, taken)) => (chunk, swept, taken),
                None => {
                    // Busy, possibly with the calling thread iterating it.
                    // A fresh chunk is only ever held by other fills.
                    segment.put(&chunk);
                    let fresh = segment.grow();
                    let taken = {
                        let mut guard = fresh.lock();
                        self.fill(
                            &mut guard,
                            segment,
                            &entities[done..],
                            &parents[done..],
                            done,
                            &mut init,
                        )
                    };
                    (fresh, Vec::new(), taken)
                }
            };
            self.recycle(&swept);
            segment.put(&chunk);
            done += taken;
        }

        for (&entity, &parent) in entities.iter().zip(&parents) {
            if !parent.is_null() {
                self.attach(parent, entity);
            }
        }
    }

    /// Fill as many rows of a locked chunk as fit. Returns how many were
    /// written.
    fn fill<F>(
        &self,
        guard: &mut ChunkMut<'_>,
        segment: &Segment,
        entities: &[Entity],
        parents: &[Entity],
        offset: usize,
        init: &mut F,
    ) -> usize
    where
        F: FnMut(&mut Row<'_, '_>),
    {
        let chunk = guard.chunk();
        let take = (chunk.capacity() - guard.len()).min(entities.len());
        for (i, (&entity, &parent)) in entities.iter().zip(parents).take(take).enumerate() {
            let row = guard.len() as u32;
            if let Some(slot) = self.table.get(entity.index()) {
                slot.row.store(row, Ordering::Release);
                slot.chunk.store(chunk.index(), Ordering::Release);
                slot.parent.store(parent.to_raw(), Ordering::Release);
                slot.children.lock().clear();
                slot.state.store(
                    pack(entity.generation(), Some(segment.index())),
                    Ordering::Release,
                );
            }
            let context = Context {
                entity,
                parent,
                index: offset + i,
            };
            guard.push(context, &mut *init);
        }
        guard.publish();
        take
    }

    /// Destroy `entity`. Returns `false` if it was not alive or another
    /// thread released it first.
    ///
    /// The entity's children become roots; it is removed from its parent's
    /// children. The entity is dead as soon as this returns, but its row is
    /// only removed right away if its chunk is not in use.
    pub fn release(&self, entity: Entity) -> bool {
        let Some((slot, segment, chunk)) = self.locate(entity) else {
            return false;
        };
        let live = pack(entity.generation(), Some(segment.index()));
        let dead = pack(entity.generation(), None);
        if slot
            .state
            .compare_exchange(live, dead, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let parent = Entity::from_raw(
            slot.parent
                .swap(Entity::NULL.to_raw(), Ordering::AcqRel),
        );
        let children = std::mem::take(&mut *slot.children.lock());

        match chunk.try_lock() {
            Some(mut guard) => {
                let mut swept = self.sweep(&mut guard);
                if self.remove(&mut guard, entity) {
                    swept.push(entity);
                }
                drop(guard);
                self.recycle(&swept);
                segment.put(&chunk);
            }
            None => {
                if chunk.defer(entity) {
                    self.deferred.push(Arc::clone(&chunk));
                }
                tracing::trace!(%entity, chunk = chunk.index(), "deferred row removal");
            }
        }

        if !parent.is_null() {
            self.detach(parent, entity);
        }
        for child in children {
            self.orphan(child);
        }
        tracing::trace!(%entity, segment = segment.index(), "released entity");
        true
    }

    /// Remove every row whose release was deferred, waiting for busy chunks.
    ///
    /// Must not be called while the calling thread holds a
    /// [`ChunkView`](crate::segment::ChunkView) or a borrowed column.
    /// Returns the number of rows removed.
    pub fn flush(&self) -> usize {
        let mut removed = 0;
        while let Some(chunk) = self.deferred.pop() {
            let swept = {
                let mut guard = chunk.lock();
                self.sweep(&mut guard)
            };
            removed += swept.len();
            self.recycle(&swept);
            if let Some(segment) = self.segments.load().get(chunk.segment() as usize) {
                segment.put(&chunk);
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "flushed deferred removals");
        }
        removed
    }

    /// Remove deferred rows of `chunk` if it can be locked right away.
    fn settle(&self, segment: &Segment, chunk: &Arc<Chunk>) {
        if !chunk.has_pending() {
            return;
        }
        let Some(mut guard) = chunk.try_lock() else {
            return;
        };
        let swept = self.sweep(&mut guard);
        drop(guard);
        self.recycle(&swept);
        segment.put(chunk);
    }

    /// Swap-remove the rows of every deferred entity of a locked chunk.
    fn sweep(&self, guard: &mut ChunkMut<'_>) -> Vec<Entity> {
        let mut removed = Vec::new();
        for entity in guard.take_pending() {
            if self.remove(guard, entity) {
                removed.push(entity);
            }
        }
        removed
    }

    /// Swap-remove the row of a claimed `entity` and publish the new count.
    fn remove(&self, guard: &mut ChunkMut<'_>, entity: Entity) -> bool {
        let hint = self
            .table
            .get(entity.index())
            .map_or(usize::MAX, |slot| slot.row.load(Ordering::Acquire) as usize);
        let Some(row) = segment::find(guard.entities(), hint, entity)
            .or_else(|| guard.entities().iter().position(|&e| e == entity))
        else {
            debug_assert!(false, "claimed {entity:?} but its row is gone");
            return false;
        };
        if let Some(moved) = guard.swap_remove(row) {
            if let Some(slot) = self.table.get(moved.index()) {
                slot.row.store(row as u32, Ordering::Release);
            }
        }
        guard.publish();
        true
    }

    /// Hand the indices of removed rows back to [`reserve`](Self::reserve).
    fn recycle(&self, removed: &[Entity]) {
        for entity in removed {
            self.free.push(entity.index());
        }
    }

    // -- lookup -------------------------------------------------------------

    /// Slot, segment and chunk of an entity whose generation matches, without
    /// checking the chunk row.
    fn locate(&self, entity: Entity) -> Option<(SlotRef, Arc<Segment>, Arc<Chunk>)> {
        if entity.is_null() {
            return None;
        }
        let slot = self.table.get(entity.index())?;
        let (generation, segment) = unpack(slot.state.load(Ordering::Acquire));
        if generation != entity.generation() {
            return None;
        }
        let segment = self.segments.load().get(segment? as usize).cloned()?;
        let chunk = segment.chunk(slot.chunk.load(Ordering::Acquire))?;
        Some((slot, segment, chunk))
    }

    /// Where `entity` lives, or `None` if it is not alive.
    pub fn try_datum(&self, entity: Entity) -> Option<Datum> {
        let (slot, segment, chunk) = self.locate(entity)?;
        let row = chunk.row_of(slot.row.load(Ordering::Acquire) as usize, entity)?;
        Some(Datum {
            index: row as u32,
            parent: Entity::from_raw(slot.parent.load(Ordering::Acquire)),
            segment: segment.index(),
            chunk: chunk.index(),
        })
    }

    /// Whether `entity` is alive.
    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.try_datum(entity).is_some()
    }

    /// Parent of an alive entity ([`Entity::NULL`] for roots).
    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.try_datum(entity).map(|datum| datum.parent)
    }

    /// Children of an alive entity.
    pub fn children(&self, entity: Entity) -> Option<Vec<Entity>> {
        let slot = self.alive_slot(entity)?;
        let children = slot.children.lock().clone();
        Some(children)
    }

    /// Run `f` on the `T` of `entity`.
    ///
    /// Only the column of `T` stays locked while `f` runs, shared, so `f` may
    /// read other entities or release entities of the same chunk.
    pub fn read<T: Component, R>(&self, entity: Entity, f: impl FnOnce(&T) -> R) -> Option<R> {
        let (slot, segment, chunk) = self.locate(entity)?;
        let result = {
            let view = chunk.view();
            let row = view.find(slot.row.load(Ordering::Acquire) as usize, entity)?;
            let column = view.read::<T>()?;
            drop(view);
            f(&column[row])
        };
        self.settle(&segment, &chunk);
        Some(result)
    }

    /// Run `f` on the `T` of `entity`, mutably.
    ///
    /// Only the column of `T` stays locked while `f` runs.
    pub fn write<T: Component, R>(
        &self,
        entity: Entity,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let (slot, segment, chunk) = self.locate(entity)?;
        let result = {
            let view = chunk.view();
            let row = view.find(slot.row.load(Ordering::Acquire) as usize, entity)?;
            let mut column = view.write::<T>()?;
            drop(view);
            f(&mut column[row])
        };
        self.settle(&segment, &chunk);
        Some(result)
    }

    /// Clone the `T` of `entity`.
    pub fn get_cloned<T: Component + Clone>(&self, entity: Entity) -> Result<T, EcsError> {
        if !self.is_alive(entity) {
            return Err(EcsError::StaleEntity { entity });
        }
        self.read(entity, T::clone)
            .ok_or(EcsError::MissingComponent {
                entity,
                component: std::any::type_name::<T>(),
            })
    }

    // -- iteration ----------------------------------------------------------

    /// Every stored entity, in segment and chunk order.
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities = Vec::new();
        for segment in self.segments.load().iter() {
            for chunk in segment.chunks().iter() {
                entities.extend_from_slice(chunk.view().entities());
            }
        }
        entities
    }

    /// Every alive entity with its hierarchy links.
    pub fn families(&self) -> Vec<Family> {
        self.entities()
            .into_iter()
            .filter_map(|entity| {
                let slot = self.alive_slot(entity)?;
                let parent = Entity::from_raw(slot.parent.load(Ordering::Acquire));
                let children = slot.children.lock().clone();
                Some(Family {
                    entity,
                    parent,
                    children,
                })
            })
            .collect()
    }

    /// Number of stored rows. Released rows whose removal was deferred are
    /// counted until [`flush`](Self::flush) runs.
    pub fn count(&self) -> usize {
        self.segments.load().iter().map(|s| s.count()).sum()
    }

    /// Number of datum slots currently allocated.
    pub fn table_capacity(&self) -> usize {
        self.table.capacity()
    }

    // -- hierarchy ----------------------------------------------------------

    /// Slot of `entity` if its generation is current and it is stored.
    fn alive_slot(&self, entity: Entity) -> Option<SlotRef> {
        if entity.is_null() {
            return None;
        }
        let slot = self.table.get(entity.index())?;
        match unpack(slot.state.load(Ordering::Acquire)) {
            (generation, Some(_)) if generation == entity.generation() => Some(slot),
            _ => None,
        }
    }

    fn attach(&self, parent: Entity, child: Entity) {
        if let Some(slot) = self.alive_slot(parent) {
            slot.children.lock().push(child);
        }
    }

    fn detach(&self, parent: Entity, child: Entity) {
        if let Some(slot) = self.alive_slot(parent) {
            slot.children.lock().retain(|&c| c != child);
        }
    }

    fn orphan(&self, child: Entity) {
        if let Some(slot) = self.alive_slot(child) {
            slot.parent.store(Entity::NULL.to_raw(), Ordering::Release);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
    }

    fn spawn(world: &World, segment: &Arc<Segment>, count: usize) -> Vec<Entity> {
        let entities = world.reserve(count);
        world.initialize(&entities, &[], segment, |row| {
            let x = row.context().index as f32;
            row.set(Position { x });
        });
        entities
    }

    fn position_segment(world: &World) -> Arc<Segment> {
        world.segment(&[world.meta::<Position>()])
    }

    // -- reserve / initialize -----------------------------------------------

    #[test]
    fn reserved_entities_are_unique_and_not_null() {
        let world = World::new();
        let entities = world.reserve(1000);
        let unique: HashSet<Entity> = entities.iter().copied().collect();
        assert_eq!(unique.len(), 1000);
        assert!(entities.iter().all(|e| !e.is_null()));
        assert!(entities.iter().all(|e| !world.is_alive(*e)));
    }

    #[test]
    fn initialize_spills_into_new_chunks() {
        let world = World::with_config(WorldConfig {
            chunk_capacity: 8,
            table_block_size: 4,
        })
        .unwrap();
        let segment = position_segment(&world);
        let entities = spawn(&world, &segment, 20);

        assert_eq!(segment.chunks().len(), 3);
        assert_eq!(segment.count(), 20);
        assert_eq!(world.count(), 20);
        assert!(world.table_capacity() >= 20);
        for (i, &e) in entities.iter().enumerate() {
            assert_eq!(world.read(e, |p: &Position| p.x), Some(i as f32));
        }
    }

    #[test]
    fn try_datum_reports_location() {
        let world = World::new();
        let segment = position_segment(&world);
        let entities = spawn(&world, &segment, 3);
        let datum = world.try_datum(entities[2]).unwrap();
        assert_eq!(datum.index, 2);
        assert_eq!(datum.segment, segment.index());
        assert_eq!(datum.chunk, 0);
        assert_eq!(datum.parent, Entity::NULL);
    }

    // -- release ------------------------------------------------------------

    #[test]
    fn release_recycles_with_higher_generation() {
        let world = World::new();
        let segment = position_segment(&world);
        let old = spawn(&world, &segment, 1)[0];
        assert!(world.release(old));
        assert!(!world.is_alive(old));

        let new = world.reserve(1)[0];
        assert_eq!(new.index(), old.index());
        assert!(new.generation() > old.generation());
    }

    #[test]
    fn most_recently_released_index_is_reused_first() {
        let world = World::new();
        let segment = position_segment(&world);
        let entities = spawn(&world, &segment, 3);
        for &entity in &entities {
            assert!(world.release(entity));
        }

        let reused: Vec<u32> = world.reserve(3).iter().map(|e| e.index()).collect();
        let released: Vec<u32> = entities.iter().rev().map(|e| e.index()).collect();
        assert_eq!(reused, released);
    }

    #[test]
    fn double_release_is_rejected() {
        let world = World::new();
        let segment = position_segment(&world);
        let e = spawn(&world, &segment, 1)[0];
        assert!(world.release(e));
        assert!(!world.release(e));
        assert!(!world.release(Entity::NULL));
    }

    #[test]
    fn release_relocates_last_row() {
        let world = World::new();
        let segment = position_segment(&world);
        let entities = spawn(&world, &segment, 4);

        assert!(world.release(entities[1]));
        let moved = world.try_datum(entities[3]).unwrap();
        assert_eq!(moved.index, 1);
        assert_eq!(world.read(entities[3], |p: &Position| p.x), Some(3.0));
        // Untouched rows keep their place.
        assert_eq!(world.try_datum(entities[0]).unwrap().index, 0);
        assert_eq!(world.try_datum(entities[2]).unwrap().index, 2);
    }

    #[test]
    fn release_of_last_row_moves_nothing() {
        let world = World::new();
        let segment = position_segment(&world);
        let entities = spawn(&world, &segment, 3);
        assert!(world.release(entities[2]));
        assert_eq!(world.try_datum(entities[0]).unwrap().index, 0);
        assert_eq!(world.try_datum(entities[1]).unwrap().index, 1);
        assert_eq!(segment.count(), 2);
    }

    #[test]
    fn concurrent_release_has_one_winner() {
        let world = Arc::new(World::new());
        let segment = position_segment(&world);
        let entities = spawn(&world, &segment, 64);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let world = Arc::clone(&world);
                let entities = entities.clone();
                thread::spawn(move || entities.iter().filter(|&&e| world.release(e)).count())
            })
            .collect();
        let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(wins, 64);
        world.flush();
        assert_eq!(world.count(), 0);
    }

    // -- hierarchy ----------------------------------------------------------

    #[test]
    fn children_are_linked_and_orphaned() {
        let world = World::new();
        let segment = position_segment(&world);
        let parent = spawn(&world, &segment, 1)[0];

        let kids = world.reserve(2);
        world.initialize(&kids, &[parent, parent], &segment, |row| {
            row.set(Position { x: -1.0 });
        });
        assert_eq!(world.children(parent), Some(kids.clone()));
        assert_eq!(world.parent(kids[0]), Some(parent));

        assert!(world.release(kids[0]));
        assert_eq!(world.children(parent), Some(vec![kids[1]]));

        assert!(world.release(parent));
        assert_eq!(world.parent(kids[1]), Some(Entity::NULL));
    }

    #[test]
    fn dead_parent_is_recorded_as_null() {
        let world = World::new();
        let segment = position_segment(&world);
        let stale = spawn(&world, &segment, 1)[0];
        world.release(stale);
        let child = world.reserve(1);
        world.initialize(&child, &[stale], &segment, |row| {
            row.set(Position { x: 0.0 });
        });
        assert_eq!(world.parent(child[0]), Some(Entity::NULL));
    }

    // -- segments / metas ---------------------------------------------------

    #[test]
    fn segment_lookup_ignores_order() {
        let world = World::new();
        let a = world.segment(&[Meta::of::<Position>(), Meta::of::<Velocity>()]);
        let b = world.segment(&[Meta::of::<Velocity>(), Meta::of::<Position>()]);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(world.segments().len(), 1);
    }

    #[test]
    fn segment_creation_registers_metas() {
        let world = World::new();
        assert!(world.try_meta(TypeId::of::<Velocity>()).is_none());
        world.segment(&[Meta::of::<Velocity>()]);
        assert_eq!(
            world.try_meta(TypeId::of::<Velocity>()),
            Some(Meta::of::<Velocity>())
        );
    }

    #[test]
    fn concurrent_segment_creation_dedups() {
        let world = Arc::new(World::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let world = Arc::clone(&world);
                thread::spawn(move || world.segment(&[Meta::of::<Velocity>()]))
            })
            .collect();
        let segments: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(segments.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(world.segments().len(), 1);
    }

    // -- accessors ----------------------------------------------------------

    #[test]
    fn get_cloned_reports_errors() {
        let world = World::new();
        let segment = position_segment(&world);
        let e = spawn(&world, &segment, 1)[0];
        assert_eq!(world.get_cloned::<Position>(e).unwrap(), Position { x: 0.0 });
        assert!(matches!(
            world.get_cloned::<Velocity>(e),
            Err(EcsError::MissingComponent { .. })
        ));
        world.release(e);
        assert!(matches!(
            world.get_cloned::<Position>(e),
            Err(EcsError::StaleEntity { .. })
        ));
    }

    #[test]
    fn write_mutates_in_place() {
        let world = World::new();
        let segment = position_segment(&world);
        let e = spawn(&world, &segment, 1)[0];
        world.write(e, |p: &mut Position| p.x = 42.0);
        assert_eq!(world.read(e, |p: &Position| p.x), Some(42.0));
    }

    // -- re-entrant access ---------------------------------------------------

    #[test]
    fn release_inside_write_is_deferred_then_settled() {
        let world = Arc::new(World::new());
        let segment = position_segment(&world);
        let entities = spawn(&world, &segment, 3);

        let released = world.write(entities[0], |p: &mut Position| {
            p.x = 10.0;
            world.release(entities[1])
        });
        assert_eq!(released, Some(true));
        assert!(!world.is_alive(entities[1]));
        assert_eq!(world.count(), 2);
        assert_eq!(world.read(entities[0], |p: &Position| p.x), Some(10.0));
        assert_eq!(world.read(entities[2], |p: &Position| p.x), Some(2.0));
        assert_eq!(world.try_datum(entities[2]).unwrap().index, 1);
    }

    #[test]
    fn read_inside_read_of_same_chunk() {
        let world = World::new();
        let segment = position_segment(&world);
        let entities = spawn(&world, &segment, 2);
        let sum = world.read(entities[0], |a: &Position| {
            world.read(entities[1], |b: &Position| a.x + b.x)
        });
        assert_eq!(sum, Some(Some(1.0)));
    }

    #[test]
    fn release_while_viewing_waits_for_flush() {
        let world = World::new();
        let segment = position_segment(&world);
        let entities = spawn(&world, &segment, 4);

        {
            let chunk = segment.chunks()[0].clone();
            let view = chunk.view();
            let positions = view.read::<Position>().unwrap();
            for (&entity, p) in view.entities().iter().zip(positions.iter()) {
                if p.x < 2.0 {
                    assert!(world.release(entity));
                }
            }
            // Rows stay put while the chunk is in use.
            assert_eq!(view.len(), 4);
            assert!(chunk.has_pending());
        }
        assert!(!world.is_alive(entities[0]));
        assert!(!world.is_alive(entities[1]));
        assert_eq!(world.count(), 4);

        assert_eq!(world.flush(), 2);
        assert_eq!(world.count(), 2);
        assert_eq!(world.entities().len(), 2);
        for &e in &entities[2..] {
            assert!(world.is_alive(e));
        }
        // Indices of removed rows are recycled, most recent first.
        assert_eq!(world.reserve(1)[0].index(), entities[1].index());
    }

    #[test]
    fn create_while_viewing_uses_another_chunk() {
        let world = World::new();
        let segment = position_segment(&world);
        spawn(&world, &segment, 1);

        let chunk = segment.chunks()[0].clone();
        let view = chunk.view();
        let created = spawn(&world, &segment, 1)[0];
        drop(view);
        assert_eq!(world.try_datum(created).unwrap().chunk, 1);
        assert_eq!(world.count(), 2);
    }

    #[test]
    fn config_rejects_zero_sizes() {
        let config = WorldConfig {
            chunk_capacity: 0,
            ..Default::default()
        };
        assert!(World::with_config(config).is_err());
        let parsed: WorldConfig = serde_json::from_str(r#"{ "chunk_capacity": 16 }"#).unwrap();
        assert_eq!(parsed.chunk_capacity, 16);
        assert_eq!(parsed.table_block_size, 256);
    }
}
