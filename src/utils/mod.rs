//! Various utilities functions and types

use std::sync::{Mutex, MutexGuard, PoisonError};

mod geometry;

pub use self::geometry::{Buffer, Coordinate, Physical, Point, Rectangle, Size, Transform};

/// Lock `mutex`, recovering the data of a poisoned lock
///
/// Allocation state is rebuilt every frame, so a panic in the middle of a
/// previous frame leaves nothing behind that later frames rely on.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
