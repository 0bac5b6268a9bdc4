//! The unlocked-account table.
//!
//! Presence of an address in the table is the only authority for "may this
//! address sign right now". Every read and write goes through a single mutex.
//!
//! Each entry carries a generation number that is unique for the lifetime of
//! the table. An expiry timer remembers the generation it was armed for and
//! only removes the entry if that generation is still the one installed, so a
//! timer belonging to a superseded unlock can never lock out a newer one.
//! Replacing or removing an entry also aborts its timer task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::address::Address;

/// Identity of one unlock entry.
pub(crate) type Generation = u64;

/// Per-address unlock record.
#[derive(Debug)]
struct UnlockEntry {
    generation: Generation,

    /// Expiry task, `None` for indefinite unlocks.
    timer: Option<JoinHandle<()>>,
}

impl UnlockEntry {
    fn cancel(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Address, UnlockEntry>,
    next_generation: Generation,
}

impl Inner {
    fn next_generation(&mut self) -> Generation {
        self.next_generation += 1;
        self.next_generation
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.cancel();
        }
    }
}

/// Mutex-guarded map from address to unlock entry.
#[derive(Debug, Default)]
pub(crate) struct UnlockTable {
    inner: Arc<Mutex<Inner>>,
}

impl UnlockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }

    /// Installs a new entry for `address`, superseding any existing one.
    ///
    /// A zero `duration` unlocks indefinitely. Otherwise an expiry task is
    /// spawned on `runtime`.
    pub(crate) fn install(
        &self,
        address: Address,
        duration: Duration,
        runtime: &Handle,
    ) -> Generation {
        let mut inner = self.lock();
        let generation = inner.next_generation();

        let timer = (!duration.is_zero()).then(|| {
            spawn_expiry(runtime, Arc::downgrade(&self.inner), address, generation, duration)
        });

        if let Some(previous) = inner.entries.insert(address, UnlockEntry { generation, timer }) {
            debug!(%address, superseded = previous.generation, generation, "replaced unlock entry");
            previous.cancel();
        }

        generation
    }

    /// Installs an indefinite entry only if `address` is not already unlocked.
    ///
    /// Returns the generation installed, or `None` if an entry already existed.
    pub(crate) fn install_if_absent(&self, address: Address) -> Option<Generation> {
        let mut inner = self.lock();
        if inner.entries.contains_key(&address) {
            return None;
        }

        let generation = inner.next_generation();
        inner.entries.insert(address, UnlockEntry { generation, timer: None });
        Some(generation)
    }

    /// Removes the entry for `address` if it is still `generation`.
    pub(crate) fn expire(&self, address: &Address, generation: Generation) -> bool {
        let entry = take_current(&mut self.lock(), address, generation);
        entry.map(UnlockEntry::cancel).is_some()
    }

    /// Removes the entry for `address` whatever its generation.
    pub(crate) fn remove(&self, address: &Address) -> bool {
        let entry = self.lock().entries.remove(address);
        entry.map(UnlockEntry::cancel).is_some()
    }

    pub(crate) fn contains(&self, address: &Address) -> bool {
        self.lock().entries.contains_key(address)
    }

    /// Returns the unlocked addresses in ascending order.
    pub(crate) fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.lock().entries.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Takes the entry for `address` out of the table if it is still `generation`.
fn take_current(inner: &mut Inner, address: &Address, generation: Generation) -> Option<UnlockEntry> {
    match inner.entries.get(address) {
        Some(entry) if entry.generation == generation => inner.entries.remove(address),
        _ => None,
    }
}

fn spawn_expiry(
    runtime: &Handle,
    table: Weak<Mutex<Inner>>,
    address: Address,
    generation: Generation,
    duration: Duration,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        tokio::time::sleep(duration).await;

        let Some(table) = table.upgrade() else {
            return;
        };
        // Dropping our own handle detaches it; no abort needed.
        let expired = take_current(&mut lock_inner(&table), &address, generation);
        if expired.is_some() {
            debug!(%address, generation, "unlock expired");
        }
    })
}
