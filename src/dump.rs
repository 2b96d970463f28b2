//! Textual snapshots of the allocation state for diagnostics
//!
//! Objects worth inspecting implement [`Dumpable`] and are registered with the
//! [`DumpRegistry`] of their [`DisplayCore`](crate::display::DisplayCore). The
//! registry only keeps weak references, an object leaves it once dropped.
//!
//! Dumping never waits: state that is locked by a running frame is reported as
//! busy instead.

use std::{
    fmt,
    sync::{Arc, Mutex, TryLockError, Weak},
};

use indexmap::IndexMap;

use crate::utils::lock;

/// An object that can describe its state
pub trait Dumpable: fmt::Debug + Send + Sync {
    /// Append a description of the current state to `out`
    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

/// Run `f` on the content of `mutex` if it can be locked without waiting
pub(crate) fn try_dump<T>(
    mutex: &Mutex<T>,
    out: &mut dyn fmt::Write,
    f: impl FnOnce(&T, &mut dyn fmt::Write) -> fmt::Result,
) -> fmt::Result {
    match mutex.try_lock() {
        Ok(guard) => f(&guard, out),
        Err(TryLockError::Poisoned(poisoned)) => f(&poisoned.into_inner(), out),
        Err(TryLockError::WouldBlock) => writeln!(out, "  busy"),
    }
}

/// Named set of [`Dumpable`] objects, dumped in registration order
#[derive(Debug, Default)]
pub struct DumpRegistry {
    entries: Mutex<IndexMap<String, Weak<dyn Dumpable>>>,
}

impl DumpRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        DumpRegistry::default()
    }

    /// Register `entry` under `name`, replacing a previous entry of that name
    pub fn register<T: Dumpable + 'static>(&self, name: impl Into<String>, entry: &Arc<T>) {
        let weak: Weak<T> = Arc::downgrade(entry);
        let weak: Weak<dyn Dumpable> = weak;
        let mut entries = lock(&self.entries);
        entries.retain(|_, entry| entry.strong_count() > 0);
        entries.insert(name.into(), weak);
    }

    /// Remove the entry registered under `name`
    pub fn unregister(&self, name: &str) {
        lock(&self.entries).shift_remove(name);
    }

    /// Names of the live entries
    pub fn names(&self) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter(|(_, entry)| entry.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Append the state of every live entry to `out`
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let entries = match self.entries.try_lock() {
            Ok(entries) => entries,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return writeln!(out, "dump registry busy"),
        };
        for (name, entry) in entries.iter() {
            if let Some(entry) = entry.upgrade() {
                writeln!(out, "{name}:")?;
                entry.dump(out)?;
            }
        }
        Ok(())
    }
}
