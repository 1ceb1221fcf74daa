use serde::{Deserialize, Serialize};

use crate::{
    handshake::{HandShakeReq, HandShakeResp},
    task::TaskProgress,
    JobId, NodeId, NodeState, TaskId, TaskKey,
};

/// Node to master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeMsg {
    Connect(HandShakeReq),
    Status(StatusReport),
    TaskReports(Vec<TaskReport>),
    Crash(CrashReport),
    Disconnect(NodeId),
}

/// Master answer to a [`NodeMsg`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MasterReply {
    Connected(HandShakeResp),
    Ack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub unid: NodeId,
    pub status: NodeState,
    pub task_reports: Vec<TaskReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub unid: NodeId,
    pub task: ReportedTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedTask {
    pub id: TaskId,
    pub job_id: JobId,
    pub progress: TaskProgress,
}

impl ReportedTask {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.job_id, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    pub unid: NodeId,
    pub cause: CrashCause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashCause {
    pub fatal: bool,
    pub message: String,
}
