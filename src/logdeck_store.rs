//! Capacity-bounded FIFO store for received log entries.

use std::collections::VecDeque;

use crate::logdeck_core::LogEntry;

/// Buffer sizes selectable from the dashboard.
pub const CAPACITY_PRESETS: [usize; 5] = [100, 500, 1000, 2500, 5000];
pub const DEFAULT_CAPACITY: usize = 1000;

/// Ordered, capacity-bounded collection of log entries. Ids are assigned
/// here at append time and are strictly increasing until `clear`.
#[derive(Debug)]
pub struct LogStore {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_id: u64,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::new(), capacity: capacity.max(1), next_id: 1 }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn get(&self, id: u64) -> Option<&LogEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    /// Marks every retained entry as no longer new. Called on full rebuilds
    /// so the appearance animation fires at most once per entry.
    pub fn clear_new_flags(&mut self) {
        for entry in &mut self.entries {
            entry.is_new = false;
        }
    }

    /// Assigns the next id, appends at the tail and enforces capacity.
    /// Returns the assigned id and the ids evicted from the head, oldest
    /// first, so the owner can cascade cache purges and display removal.
    pub fn append(&mut self, mut entry: LogEntry) -> (u64, Vec<u64>) {
        let id = self.next_id;
        self.next_id += 1;
        entry.id = id;
        self.entries.push_back(entry);
        (id, self.enforce_capacity())
    }

    /// Applies a new capacity immediately; a smaller capacity evicts from
    /// the head right away.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<u64> {
        self.capacity = capacity.max(1);
        self.enforce_capacity()
    }

    fn enforce_capacity(&mut self) -> Vec<u64> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some(old) = self.entries.pop_front() {
                evicted.push(old.id);
            }
        }
        evicted
    }

    /// Empties the store and resets the id counter.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_id = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::{fixture, rstest};

    use crate::logdeck_core::Level;

    fn entry(tag: &str) -> LogEntry {
        LogEntry {
            id: 0,
            level: Level::Info,
            timestamp: Utc::now(),
            origin: None,
            args: vec![serde_json::json!(tag)],
            bound_data: serde_json::Map::new(),
            is_new: true,
        }
    }

    #[fixture]
    fn store() -> LogStore {
        LogStore::new(3)
    }

    #[rstest]
    fn append_assigns_strictly_increasing_ids(mut store: LogStore) {
        let (first, _) = store.append(entry("a"));
        let (second, _) = store.append(entry("b"));
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(store.ids(), vec![1, 2]);
    }

    #[rstest]
    fn overflow_evicts_oldest_first(mut store: LogStore) {
        for tag in ["a", "b", "c"] {
            store.append(entry(tag));
        }
        let (id, evicted) = store.append(entry("d"));
        assert_eq!(id, 4);
        assert_eq!(evicted, vec![1]);
        assert_eq!(store.ids(), vec![2, 3, 4]);
        assert_eq!(store.len(), 3);
    }

    #[rstest]
    fn survivors_keep_arrival_order_across_many_appends(mut store: LogStore) {
        for idx in 0..10 {
            store.append(entry(&format!("e{idx}")));
        }
        assert_eq!(store.ids(), vec![8, 9, 10]);
        let args: Vec<String> = store
            .iter()
            .map(|entry| entry.args[0].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(args, vec!["e7", "e8", "e9"]);
    }

    #[rstest]
    fn shrinking_capacity_evicts_immediately(mut store: LogStore) {
        for tag in ["a", "b", "c"] {
            store.append(entry(tag));
        }
        let evicted = store.set_capacity(1);
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(store.ids(), vec![3]);
    }

    #[rstest]
    fn clear_resets_the_id_counter(mut store: LogStore) {
        store.append(entry("a"));
        store.append(entry("b"));
        store.clear();
        assert!(store.is_empty());
        let (id, _) = store.append(entry("c"));
        assert_eq!(id, 1);
    }

    #[rstest]
    fn clear_new_flags_is_total(mut store: LogStore) {
        store.append(entry("a"));
        store.append(entry("b"));
        store.clear_new_flags();
        assert!(store.iter().all(|entry| !entry.is_new));
    }
}
