use std::collections::{BTreeMap, HashMap};

use protocol::{JobId, NodeId, TaskKey};

/// Which node currently holds which task.
///
/// Nodes and jobs never reference each other directly; this table is the
/// only link, kept consistent in both directions.
#[derive(Default, Debug)]
pub struct Assignments {
    by_task: HashMap<TaskKey, NodeId>,
    /// value: the task is a video task
    by_node: HashMap<NodeId, BTreeMap<TaskKey, bool>>,
}

impl Assignments {
    pub fn assign(&mut self, node: &NodeId, key: TaskKey, video: bool) {
        if let Some(previous) = self.by_task.insert(key, node.clone()) {
            if &previous != node {
                self.detach(&previous, key);
            }
        }
        self.by_node
            .entry(node.clone())
            .or_default()
            .insert(key, video);
    }

    pub fn release(&mut self, key: TaskKey) -> Option<NodeId> {
        let node = self.by_task.remove(&key)?;
        self.detach(&node, key);
        Some(node)
    }

    fn detach(&mut self, node: &NodeId, key: TaskKey) {
        if let Some(tasks) = self.by_node.get_mut(node) {
            tasks.remove(&key);
            if tasks.is_empty() {
                self.by_node.remove(node);
            }
        }
    }

    /// Releases every task of a node.
    pub fn release_node(&mut self, node: &NodeId) -> Vec<TaskKey> {
        let keys: Vec<TaskKey> = self
            .by_node
            .remove(node)
            .map(|tasks| tasks.into_keys().collect())
            .unwrap_or_default();
        for key in &keys {
            self.by_task.remove(key);
        }
        keys
    }

    /// Releases every task of a job, returns who held them.
    pub fn release_job(&mut self, job_id: JobId) -> Vec<(TaskKey, NodeId)> {
        let keys: Vec<TaskKey> = self
            .by_task
            .keys()
            .filter(|k| k.job_id == job_id)
            .copied()
            .collect();
        let mut released: Vec<_> = keys
            .into_iter()
            .filter_map(|k| self.release(k).map(|node| (k, node)))
            .collect();
        released.sort_by_key(|(k, _)| *k);
        released
    }

    pub fn node_of(&self, key: TaskKey) -> Option<&NodeId> {
        self.by_task.get(&key)
    }

    pub fn holds(&self, node: &NodeId, key: TaskKey) -> bool {
        self.by_task.get(&key) == Some(node)
    }

    pub fn tasks_of(&self, node: &NodeId) -> Vec<TaskKey> {
        self.by_node
            .get(node)
            .map(|tasks| tasks.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, node: &NodeId) -> usize {
        self.by_node.get(node).map_or(0, |tasks| tasks.len())
    }

    pub fn runs_video(&self, node: &NodeId) -> bool {
        self.by_node
            .get(node)
            .is_some_and(|tasks| tasks.values().any(|video| *video))
    }

    pub fn clear(&mut self) {
        self.by_task.clear();
        self.by_node.clear();
    }
}
