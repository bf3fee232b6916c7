// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Cell types for sharing state between contexts on a single core.
//!
//! Both types are thin wrappers around `Cell<Option<T>>`. They never panic:
//! an access that finds the cell empty (or already borrowed through `map`)
//! simply observes `None`.

use core::cell::Cell;

/// `OptionalCell` is a `Cell` that wraps an `Option`. This is helper type
/// that makes keeping types that can be `None` a little cleaner.
pub struct OptionalCell<T: Copy> {
    value: Cell<Option<T>>,
}

impl<T: Copy> OptionalCell<T> {
    /// Create a new OptionalCell.
    pub const fn new(val: T) -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(Some(val)),
        }
    }

    /// Create an empty `OptionalCell` (contains just `None`).
    pub const fn empty() -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(None),
        }
    }

    /// Update the stored value.
    pub fn set(&self, val: T) {
        self.value.set(Some(val));
    }

    /// Insert the value of the supplied `Option`.
    pub fn insert(&self, opt: Option<T>) {
        self.value.set(opt);
    }

    /// Replace the contents with the supplied value, returning the previous
    /// one.
    pub fn replace(&self, val: T) -> Option<T> {
        self.value.replace(Some(val))
    }

    /// Reset the stored value to `None`.
    pub fn clear(&self) {
        self.value.set(None);
    }

    pub fn is_some(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn is_none(&self) -> bool {
        self.value.get().is_none()
    }

    /// Return a copy of the contents.
    pub fn get(&self) -> Option<T> {
        self.value.get()
    }

    /// Return the contained value and leave the cell empty.
    pub fn take(&self) -> Option<T> {
        self.value.take()
    }

    pub fn unwrap_or(&self, default: T) -> T {
        self.value.get().unwrap_or(default)
    }

    /// Call a closure on the value if the value exists.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(T) -> R,
    {
        self.value.get().map(closure)
    }

    /// Call a closure on the value if the value exists, or return the
    /// default if the value is `None`.
    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(T) -> R,
    {
        self.value.get().map_or(default, closure)
    }
}

/// A mutable memory location that enforces borrow rules at runtime without
/// possible panics.
///
/// You can think of a `MapCell` as an `Option` wrapped in a `RefCell`. The
/// value is moved out for the duration of `map`, so a nested `map` on the
/// same cell (for example from a callback that re-enters the owner) sees an
/// empty cell and returns `None` instead of aliasing.
pub struct MapCell<T> {
    val: Cell<Option<T>>,
}

impl<T> MapCell<T> {
    pub const fn empty() -> MapCell<T> {
        MapCell {
            val: Cell::new(None),
        }
    }

    /// Creates a new `MapCell` containing `value`
    pub const fn new(value: T) -> MapCell<T> {
        MapCell {
            val: Cell::new(Some(value)),
        }
    }

    pub fn is_some(&self) -> bool {
        // Swap out and back: `Cell<Option<T>>` cannot be inspected in place
        // for non-`Copy` `T`.
        let val = self.val.take();
        let some = val.is_some();
        self.val.set(val);
        some
    }

    pub fn is_none(&self) -> bool {
        !self.is_some()
    }

    /// Takes the value out of the `MapCell` leaving it empty.
    pub fn take(&self) -> Option<T> {
        self.val.take()
    }

    /// Puts a value into the `MapCell`, dropping any previous value.
    pub fn put(&self, val: T) {
        self.val.set(Some(val));
    }

    /// Replaces the contents of the `MapCell` with `val`, returning the old
    /// contents if there were any.
    pub fn replace(&self, val: T) -> Option<T> {
        self.val.replace(Some(val))
    }

    /// Call a closure on the value if the value exists, returning its result.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut val = self.val.take()?;
        let res = closure(&mut val);
        self.val.set(Some(val));
        Some(res)
    }

    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.map(closure).unwrap_or(default)
    }
}

#[cfg(test)]
mod test {
    use super::{MapCell, OptionalCell};

    #[test]
    fn optional_cell_replace_and_take() {
        let cell = OptionalCell::empty();
        assert!(cell.is_none());
        assert_eq!(cell.replace(3u8), None);
        assert_eq!(cell.replace(4), Some(3));
        assert_eq!(cell.map_or(0, |v| v * 2), 8);
        assert_eq!(cell.take(), Some(4));
        assert!(cell.is_none());
    }

    #[test]
    fn map_cell_nested_map_sees_empty() {
        let cell = MapCell::new(10u32);
        let nested = cell.map(|v| {
            *v += 1;
            cell.map(|_| ()).is_none()
        });
        assert_eq!(nested, Some(true));
        assert_eq!(cell.take(), Some(11));
        assert!(cell.is_none());
        assert_eq!(cell.map(|v| *v), None);
    }
}
