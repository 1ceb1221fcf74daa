use serde::{Deserialize, Serialize};

use crate::{task::Task, TaskKey};

/// Master to node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MasterCmd {
    Offer(Task),
    AbortTask(TaskKey),
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeReply {
    Accepted,
    Refused(String),
    Ack,
}
