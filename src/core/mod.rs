//! Core types shared by every layer: constants, errors and the outbound
//! seam.

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;

/// A logical peer: address and port. Primary key for connection lookup.
pub type Endpoint = std::net::SocketAddr;

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Critical sections never panic while holding a guard, so a poisoned lock
// still protects consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
