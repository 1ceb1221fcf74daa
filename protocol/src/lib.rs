use std::fmt;

use derive_more::Display;
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod handshake;
pub mod job_msg;
pub mod master_msg;
pub mod node_msg;
pub mod task;

utils::id_new_type!(JobId);

/// Task ids are dense indexes, unique within their job only.
pub type TaskId = u32;

/// Globally unique reference to a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub job_id: JobId,
    pub task_id: TaskId,
}

impl TaskKey {
    pub fn new(job_id: JobId, task_id: TaskId) -> Self {
        Self { job_id, task_id }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.task_id)
    }
}

/// Node identifier assigned by the master. Never empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[serde(try_from = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Returns `None` for blank input: a node sending an empty id is a new node.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NodeId::new(value).ok_or_else(|| "node id must not be empty".to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
pub enum NodeState {
    NotConnected,
    Free,
    /// A task offer is in flight.
    Locked,
    Working,
    Paused,
    Crashed,
}

impl NodeState {
    /// Connected and not paused.
    pub fn is_online(&self) -> bool {
        !matches!(self, NodeState::NotConnected | NodeState::Paused)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
pub enum TaskState {
    Todo,
    Computing,
    Completed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Canceled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
pub enum JobState {
    Todo,
    Computing,
    Encoded,
    Muxing,
    Completed,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blank_node_id_is_rejected() {
        assert!(NodeId::new("").is_none());
        assert!(NodeId::new("  ").is_none());
        assert_eq!(NodeId::new("abc").unwrap().as_str(), "abc");

        let raw = bincode::serialize(&String::new()).unwrap();
        assert!(bincode::deserialize::<NodeId>(&raw).is_err());
    }

    #[test]
    fn job_ids_follow_creation_order() {
        let first = JobId::next_id();
        let second = JobId::next_id();
        assert!(first < second);
    }
}
