//! Tunnel tasks owned by one SSH connection

use std::collections::HashMap;
use std::hash::Hash;
use tokio::task::JoinHandle;

/// Broker session tasks keyed by channel.
///
/// Aborting a task drops the broker session, which takes its pending tunnel
/// out of the registry. Everything still running is aborted when the set is
/// dropped, i.e. when the connection goes away.
pub struct SessionTasks<K> {
    tasks: HashMap<K, JoinHandle<()>>,
}

impl<K: Hash + Eq> SessionTasks<K> {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Track `task` under `key`, aborting whatever ran there before
    pub fn insert(&mut self, key: K, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(key, task) {
            previous.abort();
        }
    }

    /// Abort the task under `key`; returns false if there was none
    pub fn abort(&mut self, key: &K) -> bool {
        match self.tasks.remove(key) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Number of tasks still running
    pub fn running(&mut self) -> usize {
        self.tasks.retain(|_, task| !task.is_finished());
        self.tasks.len()
    }
}

impl<K: Hash + Eq> Default for SessionTasks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for SessionTasks<K> {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}
