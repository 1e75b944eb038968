use std::{collections::HashMap, hash::Hash, time::Instant};

/// Table of single-shot deferred actions, at most one pending per key.
#[derive(Debug)]
pub struct DeferredTasks<K> {
    pending: Vec<Pending<K>>,
    generations: HashMap<K, u64>,
}

#[derive(Debug, Clone, Copy)]
struct Pending<K> {
    key: K,
    due: Instant,
    generation: u64,
}

impl<K> Default for DeferredTasks<K> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            generations: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> DeferredTasks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: K, due: Instant) -> u64 {
        let generation = self.bump(key);
        self.pending.retain(|entry| entry.key != key);
        self.pending.push(Pending {
            key,
            due,
            generation,
        });
        generation
    }

    pub fn cancel(&mut self, key: K) {
        self.bump(key);
        self.pending.retain(|entry| entry.key != key);
    }

    pub fn due_at(&self, key: K) -> Option<Instant> {
        self.pending
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.due)
    }

    pub fn generation(&self, key: K) -> u64 {
        self.generations.get(&key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.pending.iter().map(|entry| entry.key)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.iter().map(|entry| entry.due).min()
    }

    /// Removes and returns the earliest entry due at or before `now`, if its
    /// generation is still current.
    pub fn pop_due(&mut self, now: Instant) -> Option<K> {
        loop {
            let idx = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.due <= now)
                .min_by_key(|(_, entry)| entry.due)
                .map(|(idx, _)| idx)?;
            let entry = self.pending.swap_remove(idx);
            if self.generation(entry.key) == entry.generation {
                return Some(entry.key);
            }
        }
    }

    fn bump(&mut self, key: K) -> u64 {
        let generation = self.generations.entry(key).or_insert(0);
        *generation = generation.wrapping_add(1);
        *generation
    }
}
