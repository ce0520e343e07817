//! Type-erased column storage.
//!
//! A chunk keeps one [`Store`] per component type of its segment. Each store is
//! a [`Column<T>`] -- a plain `Vec<T>` pre-sized to the chunk capacity -- behind
//! a trait object so the chunk can move and drop rows without knowing `T`.

use std::any::Any;

use crate::meta::{Component, Meta};

/// Row operations a chunk needs from a column, independent of its type.
pub trait Store: Send + Sync {
    /// The component type stored here.
    fn meta(&self) -> Meta;
    /// Number of initialized rows.
    fn len(&self) -> usize;
    /// Whether no row is initialized.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Move the last row into `row` and drop the value that was there.
    fn swap_remove(&mut self, row: usize);
    /// Upcast for typed access.
    fn as_any(&self) -> &dyn Any;
    /// Upcast for typed mutable access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<'a> dyn Store + 'a {
    /// Downcast to the typed column.
    #[inline]
    pub fn column<T: Component>(&self) -> Option<&Column<T>> {
        self.as_any().downcast_ref()
    }

    /// Downcast to the typed column, mutably.
    #[inline]
    pub fn column_mut<T: Component>(&mut self) -> Option<&mut Column<T>> {
        self.as_any_mut().downcast_mut()
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// Densely packed values of a single component type.
#[derive(Debug)]
pub struct Column<T> {
    values: Vec<T>,
}

impl<T: Component> Column<T> {
    /// Create an empty column that will not reallocate below `capacity` rows.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
        }
    }

    /// Append a value as the next row.
    #[inline]
    pub fn push(&mut self, value: T) {
        self.values.push(value);
    }

    /// The initialized rows.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    /// The initialized rows, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.values
    }
}

impl<T: Component> Store for Column<T> {
    fn meta(&self) -> Meta {
        Meta::of::<T>()
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn swap_remove(&mut self, row: usize) {
        self.values.swap_remove(row);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_remove_moves_last_row() {
        let mut store: Box<dyn Store> = Meta::of::<u64>().new_store(4);
        {
            let column = store.column_mut::<u64>().unwrap();
            column.push(10);
            column.push(20);
            column.push(30);
        }
        store.swap_remove(0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.column::<u64>().unwrap().as_slice(), &[30, 20]);
    }

    #[test]
    fn wrong_type_does_not_downcast() {
        let store: Box<dyn Store> = Meta::of::<u64>().new_store(1);
        assert!(store.column::<u32>().is_none());
        assert_eq!(store.meta(), Meta::of::<u64>());
        assert!(store.is_empty());
    }
}
