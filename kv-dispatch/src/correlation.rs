//! Correlation id allocation and lookup for one pipeline.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Anything stored in a [`CorrelationTable`] exposes the moment it expires.
pub trait Tracked {
    fn deadline(&self) -> Instant;
}

/// Maps correlation ids to outstanding entries.
///
/// Ids come from a wrapping 32-bit counter. An id stays reserved from
/// [`reserve`](Self::reserve) until it is [`released`](Self::release) or its
/// entry is [`removed`](Self::remove), and the counter skips ids that are still
/// reserved, so an id is never handed out twice while outstanding.
#[derive(Debug)]
pub struct CorrelationTable<T> {
    next: u32,
    reserved: HashSet<u32>,
    entries: HashMap<u32, T>,
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(next: u32) -> Self {
        Self {
            next,
            reserved: HashSet::new(),
            entries: HashMap::new(),
        }
    }

    pub fn reserve(&mut self) -> u32 {
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if !self.reserved.contains(&id) {
                self.reserved.insert(id);
                return id;
            }
        }
    }

    /// Returns a reserved id that never made it into the table.
    pub fn release(&mut self, id: u32) {
        if !self.entries.contains_key(&id) {
            self.reserved.remove(&id);
        }
    }

    /// Records `entry` under a previously reserved `id`.
    pub fn insert(&mut self, id: u32, entry: T) {
        self.reserved.insert(id);
        self.entries.insert(id, entry);
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        let entry = self.entries.remove(&id)?;
        self.reserved.remove(&id);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    /// Removes every entry, ordered by id.
    pub fn drain(&mut self) -> Vec<T> {
        let mut entries: Vec<(u32, T)> = self.entries.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        for (id, _) in &entries {
            self.reserved.remove(id);
        }
        entries.into_iter().map(|(_, entry)| entry).collect()
    }
}

impl<T: Tracked> CorrelationTable<T> {
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(Tracked::deadline).min()
    }

    /// Removes and returns entries whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<T> {
        let mut expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline() <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        expired.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}
