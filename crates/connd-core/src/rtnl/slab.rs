//! Generation-checked slot storage for watch registrations

use std::fmt;

/// Handle returned by [`RouteWatcher::add_newlink_watch`]
///
/// A token names one registration for the lifetime of the process: when
/// a slot is reused its generation advances, so an old token can never
/// remove a newer watch.
///
/// [`RouteWatcher::add_newlink_watch`]: super::RouteWatcher::add_newlink_watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken {
    slot: u32,
    generation: u64,
}

impl fmt::Display for WatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slot, self.generation)
    }
}

struct Slot<T> {
    generation: u64,
    value: Option<T>,
}

pub(crate) struct WatchSlab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for WatchSlab<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> WatchSlab<T> {
    pub(crate) fn insert(&mut self, value: T) -> WatchToken {
        self.len += 1;

        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.generation += 1;
            entry.value = Some(value);
            return WatchToken {
                slot,
                generation: entry.generation,
            };
        }

        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        WatchToken {
            slot,
            generation: 0,
        }
    }

    pub(crate) fn remove(&mut self, token: WatchToken) -> Option<T> {
        let entry = self.slots.get_mut(token.slot as usize)?;
        if entry.generation != token.generation {
            return None;
        }

        let value = entry.value.take()?;
        self.free.push(token.slot);
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn contains(&self, token: WatchToken) -> bool {
        self.slots
            .get(token.slot as usize)
            .is_some_and(|entry| entry.generation == token.generation && entry.value.is_some())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (WatchToken, &T)> {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    WatchToken {
                        slot: slot as u32,
                        generation: entry.generation,
                    },
                    value,
                )
            })
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}
