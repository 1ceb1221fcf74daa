use std::net::IpAddr;

use anyhow::Result;
use protocol::{handshake::HandShakeReq, JobId, JobState, NodeId, NodeState, TaskState};
use tracing::{info, warn};

use super::{
    job::Job,
    node::NodeProfile,
    port::Snapshot,
    Effects, MasterInner,
};

impl MasterInner {
    /// Registers a node and completes its handshake, returning its id.
    pub(super) fn connect(
        &mut self,
        req: HandShakeReq,
        peer: IpAddr,
        fx: &mut Effects,
    ) -> Result<NodeId> {
        let profile = NodeProfile {
            name: req.name,
            address: req.address.unwrap_or(peer),
            port: req.listen_port,
            threads: req.threads,
            codecs: req.codecs,
        };
        let unid = req.unid.and_then(|raw| NodeId::new(raw));
        let id = self.registry.add_node(unid, profile.clone())?;

        // a reconnecting node starts over
        self.reset_tasks_of(&id);
        self.registry.complete_handshake(&id, profile);
        info!(node_id = %id, "node connected");

        self.update_nodes_work(fx);
        Ok(id)
    }

    /// Marks a node disconnected and puts its tasks back in the todo pool.
    /// Calling it again changes nothing.
    pub(super) fn remove_node(&mut self, id: &NodeId, fx: &mut Effects) {
        if self.registry.get(id).is_none() {
            warn!(node_id = %id, "could not mark node as disconnected, not found");
            return;
        }
        self.reset_tasks_of(id);
        if let Some(node) = self.registry.get_mut(id) {
            if node.status != NodeState::NotConnected {
                info!(node_id = %id, name = %node.name, "node disconnected");
            }
            node.status = NodeState::NotConnected;
        }
        self.update_nodes_work(fx);
    }

    /// Tells the node it is disconnected, then removes it.
    pub(super) fn disconnect_node(&mut self, id: &NodeId, fx: &mut Effects) {
        let Some(node) = self.registry.identify(id) else {
            return;
        };
        fx.notify_disconnect.push(node.endpoint());
        self.remove_node(id, fx);
    }

    fn reset_tasks_of(&mut self, id: &NodeId) {
        for key in self.assignments.release_node(id) {
            if let Some(task) = self.jobs.task_mut(key) {
                if !task.state().is_terminal() {
                    task.progress.reset();
                }
            }
        }
    }

    pub(super) fn pause_node(&mut self, id: &NodeId, fx: &mut Effects) -> bool {
        let Some(node) = self.registry.identify_mut(id) else {
            return false;
        };
        if !matches!(
            node.status,
            NodeState::Free | NodeState::Working | NodeState::Locked
        ) {
            warn!(node_id = %id, status = %node.status, "node cannot be paused");
            return false;
        }
        info!(node_id = %id, "node paused");
        node.status = NodeState::Paused;
        fx.persist = true;
        true
    }

    pub(super) fn resume_node(&mut self, id: &NodeId, fx: &mut Effects) -> bool {
        let busy = self.assignments.count(id) > 0;
        let Some(node) = self.registry.identify_mut(id) else {
            return false;
        };
        if node.status != NodeState::Paused {
            return false;
        }
        node.status = if busy {
            NodeState::Working
        } else {
            NodeState::Free
        };
        info!(node_id = %id, status = %node.status, "node resumed");
        self.update_nodes_work(fx);
        true
    }

    pub(super) fn add_job(&mut self, job: Job, fx: &mut Effects) -> bool {
        let (id, name, tasks) = (job.id, job.name.clone(), job.tasks.len());
        if !self.jobs.insert(job) {
            warn!(job_id = %id, "job already exists");
            return false;
        }
        info!(job_id = %id, %name, tasks, "job added");
        self.update_nodes_work(fx);
        true
    }

    /// Cancels the tasks of a job, asks the nodes running them to stop and
    /// forgets the job.
    pub(super) fn delete_job(&mut self, id: JobId, fx: &mut Effects) -> bool {
        if !self.jobs.contains(id) {
            warn!(job_id = %id, "could not retrieve job");
            return false;
        }

        for (key, node_id) in self.assignments.release_job(id) {
            let idle = self.assignments.count(&node_id) == 0;
            if let Some(node) = self.registry.get_mut(&node_id) {
                fx.abort.push((node.endpoint(), key));
                if idle && matches!(node.status, NodeState::Working | NodeState::Locked) {
                    node.status = NodeState::Free;
                }
            }
        }

        if let Some(mut job) = self.jobs.remove(id) {
            for task in job.tasks.iter_mut().filter(|t| !t.state().is_terminal()) {
                task.progress.cancel();
            }
            info!(job_id = %id, name = %job.name, "job deleted");
        }
        self.update_nodes_work(fx);
        true
    }

    /// Loads a previous snapshot. Nodes come back disconnected and running
    /// tasks go back to todo.
    pub(super) fn restore(&mut self, snapshot: Snapshot, fx: &mut Effects) {
        let (nodes, jobs) = (snapshot.nodes.len(), snapshot.jobs.len());
        for node in snapshot.nodes {
            self.registry.restore(node);
        }

        let mut encoded = vec![];
        for mut job in snapshot.jobs {
            for task in job
                .tasks
                .iter_mut()
                .filter(|t| t.state() == TaskState::Computing)
            {
                task.progress.reset();
            }
            if job.all_completed() && matches!(job.status, JobState::Encoded | JobState::Muxing) {
                encoded.push(job.id);
            }
            self.jobs.insert(job);
        }
        info!(nodes, jobs, "master state restored");

        for id in encoded {
            self.job_encoding_completed(id, fx);
        }
        self.update_nodes_work(fx);
    }

    /// Disconnects every known node, releasing all of their tasks.
    pub(super) fn release_everything(&mut self, fx: &mut Effects) {
        for id in self.registry.online_nodes() {
            if let Some(node) = self.registry.get(&id) {
                fx.notify_disconnect.push(node.endpoint());
            }
        }
        let ids: Vec<NodeId> = self.registry.iter().map(|n| n.id.clone()).collect();
        for id in ids {
            self.reset_tasks_of(&id);
            if let Some(node) = self.registry.get_mut(&id) {
                node.status = NodeState::NotConnected;
            }
        }
        self.assignments.clear();
        fx.persist = true;
    }
}
