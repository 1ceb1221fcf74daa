use protocol::{JobState, NodeId, NodeState, TaskKey};
use tracing::{debug, info};

use super::{dispatch::DispatchItem, Effects, MasterInner};

impl MasterInner {
    /// Hands todo tasks to nodes with spare capacity.
    ///
    /// Greedy first fit: every eligible node takes the first task it can
    /// handle, jobs in priority order then tasks in task order, at most one
    /// new task per node and pass. Audio goes first, so video only lands on
    /// nodes still free afterwards.
    pub(super) fn update_nodes_work(&mut self, fx: &mut Effects) {
        self.dispatch_pass(false, fx);
        self.dispatch_pass(true, fx);
        fx.persist = true;
    }

    fn dispatch_pass(&mut self, video: bool, fx: &mut Effects) {
        let candidates = if video {
            self.registry.free_video_nodes(&self.assignments)
        } else {
            self.registry.free_audio_nodes(&self.assignments)
        };

        for node_id in candidates {
            let Some(node) = self.registry.get(&node_id) else {
                continue;
            };
            let found = self
                .jobs
                .ordered()
                .into_iter()
                .flat_map(|job| job.todo_tasks(video))
                .find(|task| node.can_handle(task))
                .map(|task| task.key());

            if let Some(key) = found {
                self.dispatch(&node_id, key, fx);
            }
        }
    }

    /// Commits `key` to `node_id` and queues the offer.
    fn dispatch(&mut self, node_id: &NodeId, key: TaskKey, fx: &mut Effects) {
        let Some(job) = self.jobs.get_mut(key.job_id) else {
            return;
        };
        if job.status == JobState::Todo {
            job.status = JobState::Computing;
        }
        let Some(task) = job.task_mut(key.task_id) else {
            return;
        };
        let Some(node) = self.registry.get_mut(node_id) else {
            return;
        };

        task.progress.start();
        node.status = NodeState::Locked;
        self.assignments.assign(node_id, key, task.is_video());
        info!(node = %node.name, %node_id, task = %key, video = task.is_video(), "dispatching task");

        fx.dispatch.push(DispatchItem {
            node_id: node_id.clone(),
            endpoint: node.endpoint(),
            task: task.clone(),
        });
        debug!(pending = fx.dispatch.len(), "dispatch queued");
    }
}
