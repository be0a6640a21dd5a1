//! Recently used plugins, per client host.

use fxgrid_protocol::PluginDescription;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Process-wide recents lists shared by all session workers.
///
/// Most recently used first, unique by [`PluginDescription::is_duplicate_of`],
/// at most `capacity` entries per host.
#[derive(Debug)]
pub struct RecentsCache {
    lists: Mutex<HashMap<String, VecDeque<PluginDescription>>>,
    capacity: usize,
}

impl RecentsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn recents(&self, host: &str) -> Vec<PluginDescription> {
        self.lists
            .lock()
            .get(host)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add(&self, host: &str, desc: PluginDescription) {
        let mut lists = self.lists.lock();
        let list = lists.entry(host.to_string()).or_default();
        list.retain(|existing| !existing.is_duplicate_of(&desc));
        list.push_front(desc);
        list.truncate(self.capacity);
    }
}

impl Default for RecentsCache {
    fn default() -> Self {
        Self::new(10)
    }
}
