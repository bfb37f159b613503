//! Slot arena backing the registry.
//!
//! Entries are never shifted or renumbered. A removed subscription becomes a
//! tombstone in place; compaction turns tombstones into vacant entries and
//! feeds their indices to a lowest-first free pool. Trailing vacant entries
//! are truncated so storage still shrinks.

use crate::registry::SubscriberCallback;
use crate::subscriber::{HookId, Subscriber};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Stable handle returned by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(usize);

impl SlotIndex {
    /// Wrap a raw index, e.g. one the caller stored as an integer.
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub fn get(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Index plus the generation of the subscription occupying it.
///
/// Deferred work (destroy hooks, initial delivery) holds a key rather than a
/// bare index so it can never act on a later occupant of the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotKey {
    pub index: usize,
    pub generation: u64,
}

struct Slot<T> {
    generation: u64,
    subscriber: Arc<dyn Subscriber>,
    callback: SubscriberCallback<T>,
    destroy_hook: Option<HookId>,
}

struct Tombstone {
    generation: u64,
    subscriber: Weak<dyn Subscriber>,
    destroy_hook: Option<HookId>,
}

enum Entry<T> {
    Occupied(Slot<T>),
    Tombstone(Tombstone),
    Vacant,
}

/// A destroy hook that still has to be disconnected from its subscriber.
pub(crate) struct PendingDetach {
    subscriber: Weak<dyn Subscriber>,
    hook: HookId,
}

impl PendingDetach {
    /// Disconnect the hook. The subscriber may already be gone; failures are ignored.
    pub fn run(self) {
        let Some(subscriber) = self.subscriber.upgrade() else {
            return;
        };
        if let Err(e) = subscriber.disconnect_destroy(self.hook) {
            debug!(
                subscriber = %subscriber.label(),
                hook = self.hook.get(),
                error = %e,
                "destroy hook detach failed"
            );
        }
    }
}

/// Live entry handed out for dispatch.
pub(crate) struct LiveSlot<T> {
    pub key: SlotKey,
    pub subscriber: Arc<dyn Subscriber>,
    pub callback: SubscriberCallback<T>,
}

/// Per-state entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SlotCounts {
    pub live: usize,
    pub tombstoned: usize,
    pub vacant: usize,
}

pub(crate) struct SlotTable<T> {
    entries: Vec<Entry<T>>,
    free: BTreeSet<usize>,
    next_generation: u64,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: BTreeSet::new(),
            next_generation: 0,
        }
    }

    /// Number of entries, including tombstones and vacant holes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn counts(&self) -> SlotCounts {
        let mut counts = SlotCounts::default();
        for entry in &self.entries {
            match entry {
                Entry::Occupied(_) => counts.live += 1,
                Entry::Tombstone(_) => counts.tombstoned += 1,
                Entry::Vacant => counts.vacant += 1,
            }
        }
        counts
    }

    /// Occupy the lowest reclaimed index, or append.
    pub fn insert(
        &mut self,
        subscriber: Arc<dyn Subscriber>,
        callback: SubscriberCallback<T>,
    ) -> SlotKey {
        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = Entry::Occupied(Slot {
            generation,
            subscriber,
            callback,
            destroy_hook: None,
        });

        let index = match self.free.pop_first() {
            Some(index) => {
                self.entries[index] = slot;
                index
            }
            None => {
                self.entries.push(slot);
                self.entries.len() - 1
            }
        };
        SlotKey { index, generation }
    }

    /// Undo an [`insert`](Self::insert) whose registration could not complete.
    pub fn rollback(&mut self, key: SlotKey) {
        if self.occupied(key).is_some() {
            self.entries[key.index] = Entry::Vacant;
            self.free.insert(key.index);
            self.shrink();
        }
    }

    /// Record the destroy hook connected for `key`.
    ///
    /// Returns `false` if the slot was tombstoned in the meantime.
    pub fn set_destroy_hook(&mut self, key: SlotKey, hook: HookId) -> bool {
        match self.occupied_mut(key) {
            Some(slot) => {
                slot.destroy_hook = Some(hook);
                true
            }
            None => false,
        }
    }

    /// Whether `key` still names an occupied slot.
    pub fn is_current(&self, key: SlotKey) -> bool {
        self.occupied(key).is_some()
    }

    /// Live entry at `index`, if the slot is occupied.
    pub fn live(&self, index: usize) -> Option<LiveSlot<T>> {
        match self.entries.get(index)? {
            Entry::Occupied(slot) => Some(LiveSlot {
                key: SlotKey {
                    index,
                    generation: slot.generation,
                },
                subscriber: Arc::clone(&slot.subscriber),
                callback: Arc::clone(&slot.callback),
            }),
            _ => None,
        }
    }

    /// Live entry for `key`, if that exact subscription still occupies its slot.
    pub fn live_for(&self, key: SlotKey) -> Option<LiveSlot<T>> {
        self.occupied(key).map(|slot| LiveSlot {
            key,
            subscriber: Arc::clone(&slot.subscriber),
            callback: Arc::clone(&slot.callback),
        })
    }

    /// Tombstone an occupied slot, keeping its destroy hook for compaction to detach.
    pub fn tombstone(&mut self, key: SlotKey) -> bool {
        self.tombstone_with(key, |slot| slot.destroy_hook).is_some()
    }

    /// Tombstone a slot whose subscriber just fired its (one-shot) destroy hook.
    pub fn tombstone_destroyed(&mut self, key: SlotKey) -> bool {
        self.tombstone_with(key, |_| None).is_some()
    }

    /// Tombstone the slot at `index` on explicit unregistration.
    ///
    /// Returns the hook to detach, if one was connected. `None` when the
    /// index is out of range or not occupied.
    pub fn unregister(&mut self, index: usize) -> Option<Option<PendingDetach>> {
        let generation = match self.entries.get(index)? {
            Entry::Occupied(slot) => slot.generation,
            _ => return None,
        };
        let key = SlotKey { index, generation };
        let slot = self.tombstone_with(key, |_| None)?;
        Some(slot.destroy_hook.map(|hook| PendingDetach {
            subscriber: Arc::downgrade(&slot.subscriber),
            hook,
        }))
    }

    /// Everything compaction needs to look at: tombstones (no subscriber) and
    /// occupied slots (with their subscriber for a fresh liveness check).
    pub fn compaction_candidates(&self) -> Vec<(SlotKey, Option<Arc<dyn Subscriber>>)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied(slot) => Some((
                    SlotKey {
                        index,
                        generation: slot.generation,
                    },
                    Some(Arc::clone(&slot.subscriber)),
                )),
                Entry::Tombstone(tomb) => Some((
                    SlotKey {
                        index,
                        generation: tomb.generation,
                    },
                    None,
                )),
                Entry::Vacant => None,
            })
            .collect()
    }

    /// Finalize a tombstoned or dead slot: make it vacant and free its index.
    ///
    /// Returns `None` if `key` is stale. The inner option is the hook that
    /// still has to be detached.
    pub fn reclaim(&mut self, key: SlotKey) -> Option<Option<PendingDetach>> {
        let detach = match self.entries.get(key.index)? {
            Entry::Occupied(slot) if slot.generation == key.generation => {
                slot.destroy_hook.map(|hook| PendingDetach {
                    subscriber: Arc::downgrade(&slot.subscriber),
                    hook,
                })
            }
            Entry::Tombstone(tomb) if tomb.generation == key.generation => {
                tomb.destroy_hook.map(|hook| PendingDetach {
                    subscriber: Weak::clone(&tomb.subscriber),
                    hook,
                })
            }
            _ => return None,
        };
        self.entries[key.index] = Entry::Vacant;
        self.free.insert(key.index);
        Some(detach)
    }

    /// Drop trailing vacant entries. Returns how many were removed.
    pub fn shrink(&mut self) -> usize {
        let mut trimmed = 0;
        while matches!(self.entries.last(), Some(Entry::Vacant)) {
            self.entries.pop();
            self.free.remove(&self.entries.len());
            trimmed += 1;
        }
        if self.entries.is_empty() {
            self.entries.shrink_to_fit();
        }
        trimmed
    }

    /// Empty the table, returning every hook still connected.
    pub fn drain(&mut self) -> Vec<PendingDetach> {
        self.free.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Occupied(slot) => slot.destroy_hook.map(|hook| PendingDetach {
                    subscriber: Arc::downgrade(&slot.subscriber),
                    hook,
                }),
                Entry::Tombstone(tomb) => tomb.destroy_hook.map(|hook| PendingDetach {
                    subscriber: tomb.subscriber,
                    hook,
                }),
                Entry::Vacant => None,
            })
            .collect()
    }

    fn occupied(&self, key: SlotKey) -> Option<&Slot<T>> {
        match self.entries.get(key.index)? {
            Entry::Occupied(slot) if slot.generation == key.generation => Some(slot),
            _ => None,
        }
    }

    fn occupied_mut(&mut self, key: SlotKey) -> Option<&mut Slot<T>> {
        match self.entries.get_mut(key.index)? {
            Entry::Occupied(slot) if slot.generation == key.generation => Some(slot),
            _ => None,
        }
    }

    /// Replace an occupied slot with a tombstone, returning the old slot.
    fn tombstone_with(
        &mut self,
        key: SlotKey,
        keep_hook: impl FnOnce(&Slot<T>) -> Option<HookId>,
    ) -> Option<Slot<T>> {
        let slot = self.occupied(key)?;
        let tomb = Tombstone {
            generation: slot.generation,
            subscriber: Arc::downgrade(&slot.subscriber),
            destroy_hook: keep_hook(slot),
        };
        match std::mem::replace(&mut self.entries[key.index], Entry::Tombstone(tomb)) {
            Entry::Occupied(slot) => Some(slot),
            _ => None,
        }
    }
}
