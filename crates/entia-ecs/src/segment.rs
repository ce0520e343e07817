//! Archetype storage: segments and their chunks.
//!
//! A [`Segment`] holds every entity whose component set is exactly its
//! signature (`metas`, sorted by [`Meta`] index). Storage is split into
//! fixed-capacity [`Chunk`]s so that growing a segment never moves existing
//! rows: a full segment simply appends another chunk.
//!
//! # Locking
//!
//! Each chunk has one lock for its entity list and one lock per column. The
//! entity lock is always taken first.
//!
//! * Structural changes (filling rows, swap-removing a row) take the entity
//!   lock and every column lock exclusively, write all of a row, and only
//!   then publish the new `count`.
//! * Iteration takes the entity lock shared and then locks just the columns
//!   it touches, so work on disjoint columns of one chunk runs in parallel.
//!   Shared acquisitions are recursive: a thread that already views a chunk
//!   can view it again while a writer is queued.
//! * Releasing an entity only ever *tries* to lock its chunk. When the chunk
//!   is busy (for instance because the releasing code is iterating it), the
//!   entity is queued on the chunk and its row is removed the next time the
//!   chunk is locked or the world is flushed.
//!
//! No code path waits for a chunk lock while holding a lock of another chunk.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};

use crate::atomic::{FreeQueue, Snapshot};
use crate::entity::Entity;
use crate::meta::{Component, Meta};
use crate::store::{Column, Store};

/// Row of `entity`, checked against the stored identity.
#[inline]
pub(crate) fn find(entities: &[Entity], row: usize, entity: Entity) -> Option<usize> {
    (entities.get(row) == Some(&entity)).then_some(row)
}

// ---------------------------------------------------------------------------
// Context / Row
// ---------------------------------------------------------------------------

/// What an initializer knows about the row it is filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    /// The entity being initialized.
    pub entity: Entity,
    /// Its parent, or [`Entity::NULL`].
    pub parent: Entity,
    /// Position of the entity within the batch being initialized.
    pub index: usize,
}

/// Write access to the columns of one row under construction.
///
/// The initializer must push exactly one value into every column.
pub struct Row<'a, 'g> {
    context: Context,
    metas: &'a [Meta],
    stores: &'a mut [RwLockWriteGuard<'g, Box<dyn Store>>],
}

impl Row<'_, '_> {
    /// The row being filled.
    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The segment signature; `store(slot)` is the column of `metas()[slot]`.
    #[inline]
    pub fn metas(&self) -> &[Meta] {
        self.metas
    }

    /// The column at `slot`.
    #[inline]
    pub fn store(&mut self, slot: usize) -> &mut dyn Store {
        &mut **self.stores[slot]
    }

    /// Push `value` into the column of `T`. Returns `false` if the segment has
    /// no such column.
    pub fn set<T: Component>(&mut self, value: T) -> bool {
        let Ok(slot) = self.metas.binary_search(&Meta::of::<T>()) else {
            return false;
        };
        match self.stores[slot].column_mut::<T>() {
            Some(column) => {
                column.push(value);
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A fixed-capacity block of rows.
pub struct Chunk {
    index: u32,
    segment: u32,
    capacity: usize,
    count: AtomicUsize,
    queued: AtomicBool,
    deferred: AtomicBool,
    metas: Arc<[Meta]>,
    entities: RwLock<Vec<Entity>>,
    stores: Box<[RwLock<Box<dyn Store>>]>,
    pending: Mutex<Vec<Entity>>,
}

impl Chunk {
    fn new(segment: u32, index: u32, metas: Arc<[Meta]>, capacity: usize) -> Self {
        let stores = metas
            .iter()
            .map(|meta| RwLock::new(meta.new_store(capacity)))
            .collect();
        Self {
            index,
            segment,
            capacity,
            count: AtomicUsize::new(0),
            queued: AtomicBool::new(false),
            deferred: AtomicBool::new(false),
            metas,
            entities: RwLock::new(Vec::with_capacity(capacity)),
            stores,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Position of this chunk within its segment.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Index of the owning segment.
    #[inline]
    pub fn segment(&self) -> u32 {
        self.segment
    }

    /// Maximum number of rows.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of fully initialized rows, including released rows still
    /// waiting to be removed. Lock-free.
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether another row fits.
    #[inline]
    pub fn has_space(&self) -> bool {
        self.count() < self.capacity
    }

    /// Whether released rows are waiting to be removed.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }

    /// Shared access to the committed rows.
    pub fn view(&self) -> ChunkView<'_> {
        ChunkView {
            chunk: self,
            entities: self.entities.read_recursive(),
        }
    }

    /// Current row of `entity`, if `row` is where it is stored.
    pub(crate) fn row_of(&self, row: usize, entity: Entity) -> Option<usize> {
        find(&self.entities.read_recursive(), row, entity)
    }

    /// Exclusive access to rows and every column, waiting as needed.
    ///
    /// Only call this while holding no guard of this chunk.
    pub(crate) fn lock(&self) -> ChunkMut<'_> {
        let entities = self.entities.write();
        let stores = self.stores.iter().map(|store| store.write()).collect();
        ChunkMut {
            chunk: self,
            entities,
            stores,
        }
    }

    /// Exclusive access to rows and every column, or `None` if any of them
    /// is currently held.
    pub(crate) fn try_lock(&self) -> Option<ChunkMut<'_>> {
        let entities = self.entities.try_write()?;
        let mut stores = Vec::with_capacity(self.stores.len());
        for store in self.stores.iter() {
            stores.push(store.try_write()?);
        }
        Some(ChunkMut {
            chunk: self,
            entities,
            stores,
        })
    }

    /// Queue `entity` for removal by the next holder of the chunk lock.
    ///
    /// Returns `true` if the chunk had nothing pending before.
    pub(crate) fn defer(&self, entity: Entity) -> bool {
        self.pending.lock().push(entity);
        !self.deferred.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("segment", &self.segment)
            .field("index", &self.index)
            .field("count", &self.count())
            .field("capacity", &self.capacity)
            .field("pending", &self.has_pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChunkMut
// ---------------------------------------------------------------------------

/// Exclusive hold on a chunk for structural changes.
pub(crate) struct ChunkMut<'a> {
    chunk: &'a Chunk,
    entities: RwLockWriteGuard<'a, Vec<Entity>>,
    stores: Vec<RwLockWriteGuard<'a, Box<dyn Store>>>,
}

impl<'a> ChunkMut<'a> {
    /// The locked chunk.
    #[inline]
    pub(crate) fn chunk(&self) -> &'a Chunk {
        self.chunk
    }

    /// Rows written so far, published or not.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub(crate) fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Append a row. `init` must fill every column.
    pub(crate) fn push<F>(&mut self, context: Context, init: F)
    where
        F: FnOnce(&mut Row<'_, '_>),
    {
        debug_assert!(self.len() < self.chunk.capacity, "chunk overflow");
        let mut row = Row {
            context,
            metas: &self.chunk.metas,
            stores: &mut self.stores,
        };
        init(&mut row);
        self.entities.push(context.entity);
        debug_assert!(
            self.stores.iter().all(|s| s.len() == self.entities.len()),
            "initializer did not fill every column of {:?}",
            self.chunk.metas
        );
    }

    /// Move the last row into `row` and drop the old contents of `row`.
    ///
    /// Returns the entity that now occupies `row`, if one was moved.
    pub(crate) fn swap_remove(&mut self, row: usize) -> Option<Entity> {
        let last = self.len() - 1;
        for store in &mut self.stores {
            store.swap_remove(row);
        }
        self.entities.swap_remove(row);
        (row != last).then(|| self.entities[row])
    }

    /// Entities queued by [`Chunk::defer`] since the last call.
    pub(crate) fn take_pending(&mut self) -> Vec<Entity> {
        self.chunk.deferred.store(false, Ordering::Release);
        std::mem::take(&mut *self.chunk.pending.lock())
    }

    /// Make the rows written so far visible to [`Chunk::count`].
    #[inline]
    pub(crate) fn publish(&self) {
        self.chunk.count.store(self.len(), Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// ChunkView
// ---------------------------------------------------------------------------

/// Shared access to the committed rows of a chunk.
///
/// Rows cannot be added or removed while a view is alive; individual columns
/// are borrowed through [`read`](Self::read) and [`write`](Self::write).
/// Releasing an entity of a viewed chunk is allowed: its row stays in place
/// until the chunk is free again.
pub struct ChunkView<'a> {
    chunk: &'a Chunk,
    entities: RwLockReadGuard<'a, Vec<Entity>>,
}

impl<'a> ChunkView<'a> {
    /// The viewed chunk.
    #[inline]
    pub fn chunk(&self) -> &'a Chunk {
        self.chunk
    }

    /// Number of rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the chunk is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entity of every row.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    #[inline]
    pub(crate) fn find(&self, row: usize, entity: Entity) -> Option<usize> {
        find(&self.entities, row, entity)
    }

    /// Borrow the column of `T`, or `None` if the segment has no such column.
    ///
    /// The returned guard outlives the view itself.
    pub fn read<T: Component>(&self) -> Option<MappedRwLockReadGuard<'a, [T]>> {
        let slot = self.chunk.metas.binary_search(&Meta::of::<T>()).ok()?;
        RwLockReadGuard::try_map(self.chunk.stores[slot].read_recursive(), |store| {
            store.column::<T>().map(Column::as_slice)
        })
        .ok()
    }

    /// Mutably borrow the column of `T`, or `None` if the segment has no such
    /// column.
    pub fn write<T: Component>(&self) -> Option<MappedRwLockWriteGuard<'a, [T]>> {
        let slot = self.chunk.metas.binary_search(&Meta::of::<T>()).ok()?;
        RwLockWriteGuard::try_map(self.chunk.stores[slot].write(), |store| {
            store.column_mut::<T>().map(Column::as_mut_slice)
        })
        .ok()
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// Storage for all entities sharing one archetype.
pub struct Segment {
    index: u32,
    metas: Arc<[Meta]>,
    capacity: usize,
    chunks: Snapshot<Vec<Arc<Chunk>>>,
    free: FreeQueue<Arc<Chunk>>,
}

impl Segment {
    /// `metas` must already be sorted and deduplicated.
    pub(crate) fn new(index: u32, metas: Vec<Meta>, capacity: usize) -> Self {
        debug_assert!(metas.windows(2).all(|w| w[0] < w[1]), "unsorted signature");
        Self {
            index,
            metas: metas.into(),
            capacity: capacity.max(1),
            chunks: Snapshot::default(),
            free: FreeQueue::new(),
        }
    }

    /// Position in the world's segment registry.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The archetype signature, sorted.
    #[inline]
    pub fn metas(&self) -> &[Meta] {
        &self.metas
    }

    /// Whether the signature contains `meta`.
    #[inline]
    pub fn has(&self, meta: Meta) -> bool {
        self.metas.binary_search(&meta).is_ok()
    }

    /// Rows per chunk.
    #[inline]
    pub fn chunk_capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the chunk list. Chunks are never removed.
    #[inline]
    pub fn chunks(&self) -> Arc<Vec<Arc<Chunk>>> {
        self.chunks.load()
    }

    /// Chunk at `index`.
    #[inline]
    pub fn chunk(&self, index: u32) -> Option<Arc<Chunk>> {
        self.chunks.load().get(index as usize).cloned()
    }

    /// Total committed rows across all chunks.
    pub fn count(&self) -> usize {
        self.chunks.load().iter().map(|c| c.count()).sum()
    }

    /// A chunk with spare capacity.
    ///
    /// Reuses a queued chunk when possible, otherwise appends a new one.
    pub fn next(&self) -> Arc<Chunk> {
        while let Some(chunk) = self.free.pop() {
            chunk.queued.store(false, Ordering::Release);
            if chunk.has_space() {
                return chunk;
            }
        }
        self.grow()
    }

    /// Append a new chunk. It is queued before being returned so concurrent
    /// callers can share it.
    pub fn grow(&self) -> Arc<Chunk> {
        loop {
            let current = self.chunks.load();
            let index = current.len() as u32;
            let chunk = Arc::new(Chunk::new(
                self.index,
                index,
                Arc::clone(&self.metas),
                self.capacity,
            ));
            let mut grown = Vec::with_capacity(current.len() + 1);
            grown.extend(current.iter().cloned());
            grown.push(Arc::clone(&chunk));

            if self.chunks.compare_and_swap(&current, Arc::new(grown)).is_ok() {
                tracing::debug!(
                    segment = self.index,
                    chunk = index,
                    capacity = self.capacity,
                    "allocated chunk"
                );
                self.put(&chunk);
                return chunk;
            }
            // Another thread appended a chunk first; ours is discarded.
        }
    }

    /// Queue `chunk` for reuse if it has spare capacity.
    pub fn put(&self, chunk: &Arc<Chunk>) {
        if chunk.has_space() && !chunk.queued.swap(true, Ordering::AcqRel) {
            self.free.push(Arc::clone(chunk));
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("index", &self.index)
            .field("metas", &self.metas)
            .field("chunks", &self.chunks.load().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position(f32);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Mass(u32);

    fn segment(capacity: usize) -> Segment {
        let mut metas = vec![Meta::of::<Position>(), Meta::of::<Mass>()];
        crate::meta::normalize(&mut metas);
        Segment::new(0, metas, capacity)
    }

    fn fill(chunk: &Chunk, entities: &[Entity]) {
        let mut guard = chunk.lock();
        for (i, &entity) in entities.iter().enumerate() {
            let context = Context {
                entity,
                parent: Entity::NULL,
                index: i,
            };
            guard.push(context, |row| {
                assert!(row.set(Position(entity.index() as f32)));
                assert!(row.set(Mass(entity.index())));
            });
        }
        guard.publish();
    }

    #[test]
    fn next_reuses_chunk_with_space() {
        let seg = segment(4);
        let first = seg.next();
        fill(&first, &[Entity::new(1, 1)]);
        seg.put(&first);
        let again = seg.next();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(seg.chunks().len(), 1);
    }

    #[test]
    fn full_chunk_is_not_requeued() {
        let seg = segment(2);
        let first = seg.next();
        fill(&first, &[Entity::new(1, 1), Entity::new(2, 1)]);
        seg.put(&first);
        let second = seg.next();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.index(), 1);
        assert_eq!(seg.count(), 2);
    }

    #[test]
    fn swap_remove_relocates_last_row() {
        let seg = segment(4);
        let chunk = seg.next();
        let (a, b, c) = (Entity::new(1, 1), Entity::new(2, 1), Entity::new(3, 1));
        fill(&chunk, &[a, b, c]);

        let removed = {
            let mut guard = chunk.lock();
            let removed = guard.swap_remove(0);
            guard.publish();
            removed
        };
        assert_eq!(removed, Some(c));
        assert_eq!(chunk.count(), 2);

        let view = chunk.view();
        assert_eq!(view.entities(), &[c, b]);
        assert_eq!(&*view.read::<Mass>().unwrap(), &[Mass(3), Mass(2)]);
    }

    #[test]
    fn removing_last_row_moves_nothing() {
        let seg = segment(4);
        let chunk = seg.next();
        let (a, b) = (Entity::new(1, 1), Entity::new(2, 1));
        fill(&chunk, &[a, b]);
        let removed = chunk.lock().swap_remove(1);
        assert_eq!(removed, None);
        assert_eq!(chunk.view().entities(), &[a]);
    }

    #[test]
    fn view_borrows_disjoint_columns() {
        let seg = segment(4);
        let chunk = seg.next();
        fill(&chunk, &[Entity::new(1, 1), Entity::new(2, 1)]);

        let view = chunk.view();
        let masses = view.read::<Mass>().unwrap();
        let mut positions = view.write::<Position>().unwrap();
        for (p, m) in positions.iter_mut().zip(masses.iter()) {
            p.0 += m.0 as f32;
        }
        drop(positions);
        assert_eq!(&*view.read::<Position>().unwrap(), &[Position(2.0), Position(4.0)]);
        assert!(view.read::<u8>().is_none());
    }

    #[test]
    fn try_lock_fails_while_viewed() {
        let seg = segment(4);
        let chunk = seg.next();
        fill(&chunk, &[Entity::new(1, 1)]);

        let view = chunk.view();
        assert!(chunk.try_lock().is_none());
        let masses = view.read::<Mass>().unwrap();
        drop(view);
        // A borrowed column still blocks structural changes.
        assert!(chunk.try_lock().is_none());
        drop(masses);
        assert!(chunk.try_lock().is_some());
    }

    #[test]
    fn nested_view_does_not_wait_for_queued_writer() {
        let seg = segment(4);
        let chunk = seg.next();
        fill(&chunk, &[Entity::new(1, 1)]);

        let outer = chunk.view();
        let writer = {
            let chunk = Arc::clone(&chunk);
            std::thread::spawn(move || chunk.lock().len())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        let inner = chunk.view();
        assert_eq!(inner.len(), outer.len());
        assert_eq!(&*inner.read::<Mass>().unwrap(), &[Mass(1)]);
        drop(inner);
        drop(outer);
        assert_eq!(writer.join().unwrap(), 1);
    }

    #[test]
    fn deferred_entities_are_taken_once() {
        let seg = segment(4);
        let chunk = seg.next();
        let (a, b) = (Entity::new(1, 1), Entity::new(2, 1));
        fill(&chunk, &[a, b]);

        assert!(chunk.defer(a));
        assert!(!chunk.defer(b));
        assert!(chunk.has_pending());
        let mut guard = chunk.lock();
        assert_eq!(guard.take_pending(), vec![a, b]);
        assert!(guard.take_pending().is_empty());
        drop(guard);
        assert!(!chunk.has_pending());
    }

    #[test]
    fn set_rejects_foreign_type() {
        let seg = segment(1);
        let chunk = seg.next();
        let mut guard = chunk.lock();
        let context = Context {
            entity: Entity::new(1, 1),
            parent: Entity::NULL,
            index: 0,
        };
        guard.push(context, |row| {
            assert!(!row.set(7u8));
            row.set(Position(0.0));
            row.set(Mass(0));
        });
    }
}
