//! Time-ordered rotation work queue
//!
//! A min-heap on `due_at` with at most one live entry per [`RotationKey`].
//! Re-pushing a key supersedes its previous entry; superseded and removed
//! entries stay in the heap and are skipped when they surface.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};

/// What a queue entry rotates
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RotationKey {
    /// The admin credential
    Admin,
    /// A static role, by name
    StaticRole(String),
}

impl fmt::Display for RotationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationKey::Admin => write!(f, "admin"),
            RotationKey::StaticRole(name) => write!(f, "static-role/{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    due_at: DateTime<Utc>,
    seq: u64,
    key: RotationKey,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due_at
            .cmp(&other.due_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Rotation queue owned by the scheduler task
#[derive(Debug, Default)]
pub struct RotationQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<RotationKey, (DateTime<Utc>, u64)>,
    next_seq: u64,
}

impl RotationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` at `due_at`, replacing any earlier schedule for it
    pub fn push(&mut self, key: RotationKey, due_at: DateTime<Utc>) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.live.insert(key.clone(), (due_at, seq));
        self.heap.push(Reverse(Entry { due_at, seq, key }));
    }

    /// Forget `key`; returns whether it was scheduled
    pub fn remove(&mut self, key: &RotationKey) -> bool {
        self.live.remove(key).is_some()
    }

    /// Pop the earliest entry if it is due at `now`
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<(RotationKey, DateTime<Utc>)> {
        loop {
            let Reverse(head) = self.heap.peek()?;
            let is_live = self
                .live
                .get(&head.key)
                .is_some_and(|&(_, seq)| seq == head.seq);

            if !is_live {
                self.heap.pop();
                continue;
            }
            if head.due_at > now {
                return None;
            }

            let Reverse(entry) = self.heap.pop()?;
            self.live.remove(&entry.key);
            return Some((entry.key, entry.due_at));
        }
    }

    /// Due time of `key`, if scheduled
    pub fn due_at(&self, key: &RotationKey) -> Option<DateTime<Utc>> {
        self.live.get(key).map(|&(due_at, _)| due_at)
    }

    /// Live entries in due order
    pub fn snapshot(&self) -> Vec<(RotationKey, DateTime<Utc>)> {
        let mut entries: Vec<_> = self
            .live
            .iter()
            .map(|(key, &(due_at, seq))| (due_at, seq, key.clone()))
            .collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(due_at, _, key)| (key, due_at))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
