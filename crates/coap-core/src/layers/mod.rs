// # Pipeline Layers
//
// This module provides the implementations of the collaborator traits the
// observe subsystem posts its notifications through.

pub mod blockwise;
pub mod matcher;
pub mod reliability;

pub use blockwise::Blockwise;
pub use matcher::Matcher;
pub use reliability::Reliability;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a layer's table, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
