use protocol::{
    node_msg::{CrashReport, StatusReport, TaskReport},
    JobId, JobState, NodeId, NodeState, TaskKey, TaskState,
};
use tracing::{debug, error, info, warn};

use super::{dispatch::DispatchItem, port::MuxRequest, Effects, MasterInner, MuxOutcome};

impl MasterInner {
    pub(super) fn task_accepted(&mut self, item: &DispatchItem, fx: &mut Effects) {
        let key = item.key();
        if !self.assignments.holds(&item.node_id, key) {
            debug!(node_id = %item.node_id, task = %key, "stale acceptance ignored");
            self.unlock_if_idle(&item.node_id, fx);
            return;
        }
        let Some(node) = self.registry.identify_mut(&item.node_id) else {
            return;
        };
        if node.status == NodeState::Locked {
            node.status = NodeState::Working;
        }
        info!(node = %node.name, task = %key, "node accepted task");
        self.update_nodes_work(fx);
    }

    pub(super) fn task_refused(&mut self, item: &DispatchItem, fx: &mut Effects) {
        let key = item.key();
        if !self.assignments.holds(&item.node_id, key) {
            debug!(node_id = %item.node_id, task = %key, "stale refusal ignored");
            self.unlock_if_idle(&item.node_id, fx);
            return;
        }
        warn!(node_id = %item.node_id, task = %key, "node refused task");

        if let Some(task) = self.jobs.task_mut(key) {
            task.progress.reset();
        }
        self.assignments.release(key);
        let busy = self.assignments.count(&item.node_id) > 0;
        if let Some(node) = self.registry.get_mut(&item.node_id) {
            if node.status == NodeState::Locked {
                node.status = if busy {
                    NodeState::Working
                } else {
                    NodeState::Free
                };
            }
        }
        self.update_nodes_work(fx);
    }

    /// A late outcome for a task the node no longer holds must not leave the
    /// node locked on nothing.
    fn unlock_if_idle(&mut self, node_id: &NodeId, fx: &mut Effects) {
        if self.assignments.count(node_id) > 0 {
            return;
        }
        let Some(node) = self.registry.get_mut(node_id) else {
            return;
        };
        if node.status == NodeState::Locked {
            info!(node = %node.name, "idle node unlocked");
            node.status = NodeState::Free;
            self.update_nodes_work(fx);
        }
    }

    /// Folds a periodic status report. An unchanged status is a heartbeat.
    pub(super) fn read_status_report(&mut self, report: StatusReport, fx: &mut Effects) {
        let Some(node) = self.registry.identify_mut(&report.unid) else {
            return;
        };
        node.touch();

        if !report.task_reports.is_empty() {
            self.read_task_reports(report.task_reports, fx);
        }

        let Some(node) = self.registry.get_mut(&report.unid) else {
            return;
        };
        if node.status == report.status {
            debug!(node = %node.name, "node is still alive");
            return;
        }
        // an offer in flight or a fatal crash outranks what the node says
        if matches!(node.status, NodeState::Locked | NodeState::Crashed) {
            debug!(node = %node.name, current = %node.status, reported = %report.status, "status report ignored");
            return;
        }
        if report.status == NodeState::Locked {
            warn!(node = %node.name, "node reported a locked status, only the master locks nodes");
            return;
        }
        info!(node = %node.name, from = %node.status, to = %report.status, "node updating its status");
        if report.status == NodeState::NotConnected {
            self.remove_node(&report.unid, fx);
            return;
        }
        node.status = report.status;
        self.update_nodes_work(fx);
    }

    pub(super) fn read_task_reports(&mut self, reports: Vec<TaskReport>, fx: &mut Effects) {
        for report in reports {
            let key = report.task.key();
            let Some(node) = self.registry.identify_mut(&report.unid) else {
                continue;
            };
            node.touch();

            if !self.assignments.holds(&report.unid, key) {
                warn!(node_id = %report.unid, task = %key, "bad task update from node");
                continue;
            }
            let Some(task) = self.jobs.task_mut(key) else {
                warn!(task = %key, "reported task has no job");
                continue;
            };

            let old = task.state();
            task.progress = report.task.progress;
            if old != task.state() {
                info!(task = %key, from = %old, to = %task.state(), "task updated");
            }
            self.task_updated(&report.unid, key, fx);
        }
    }

    fn task_updated(&mut self, node_id: &NodeId, key: TaskKey, fx: &mut Effects) {
        let Some(state) = self.jobs.task(key).map(|t| t.state()) else {
            return;
        };
        match state {
            TaskState::Completed => {
                self.release_task(node_id, key);
                if self.jobs.get(key.job_id).is_some_and(|job| job.all_completed()) {
                    self.job_encoding_completed(key.job_id, fx);
                }
                self.update_nodes_work(fx);
            }
            TaskState::Todo | TaskState::Canceled => {
                if let Some(task) = self.jobs.task_mut(key) {
                    task.progress.reset();
                }
                self.release_task(node_id, key);
                self.update_nodes_work(fx);
            }
            TaskState::Computing => {}
        }
    }

    /// Drops the link between a node and a task. A node left without work
    /// becomes free.
    fn release_task(&mut self, node_id: &NodeId, key: TaskKey) {
        self.assignments.release(key);
        if self.assignments.count(node_id) > 0 {
            return;
        }
        if let Some(node) = self.registry.get_mut(node_id) {
            if matches!(node.status, NodeState::Working | NodeState::Locked) {
                node.status = NodeState::Free;
            }
        }
    }

    pub(super) fn read_crash_report(&mut self, report: CrashReport, fx: &mut Effects) {
        let limit = self.policy.fatal_after_crashes;
        let Some(node) = self.registry.identify_mut(&report.unid) else {
            return;
        };
        node.touch();

        let fatal = if report.cause.fatal {
            true
        } else {
            node.non_fatal_crashes += 1;
            limit.is_some_and(|limit| node.non_fatal_crashes >= limit)
        };

        if fatal {
            error!(node = %node.name, cause = %report.cause.message, "node fatally crashed");
            node.status = NodeState::Crashed;
            fx.persist = true;
        } else {
            warn!(
                node = %node.name,
                cause = %report.cause.message,
                crashes = node.non_fatal_crashes,
                "node crashed but not fatally"
            );
        }
    }

    /// Every task of the job completed: check the parts and start muxing.
    pub(super) fn job_encoding_completed(&mut self, id: JobId, fx: &mut Effects) {
        let shared = self.policy.shared_folder.clone();
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        job.status = JobState::Encoded;
        info!(job_id = %id, name = %job.name, "job encoded");

        let mut intact = true;
        for task in job.tasks.iter_mut().filter(|t| t.is_video()) {
            let part = shared.join(&task.final_file);
            if !part.exists() {
                error!(job = %job.name, task = task.id, part = %part.display(), "cannot start muxing, part is missing");
                task.progress.reset();
                intact = false;
            }
        }
        fx.persist = true;

        if !intact {
            job.status = JobState::Computing;
            return;
        }

        job.status = JobState::Muxing;
        fx.mux.push(MuxRequest {
            job_id: job.id,
            job_name: job.name.clone(),
            video_parts: job.video_tasks().map(|t| shared.join(&t.final_file)).collect(),
            audio_parts: job.audio_tasks().map(|t| shared.join(&t.final_file)).collect(),
            output: shared.join(&job.output_file),
        });
    }

    pub(super) fn muxing_outcome(&mut self, id: JobId, outcome: MuxOutcome, fx: &mut Effects) {
        let retries = self.policy.mux_retries;
        let Some(job) = self.jobs.get_mut(id) else {
            warn!(job_id = %id, ?outcome, "muxing outcome for an unknown job");
            return;
        };
        match outcome {
            MuxOutcome::Started => {
                info!(job = %job.name, "muxing started");
                job.status = JobState::Muxing;
            }
            MuxOutcome::Completed(output) => {
                info!(job = %job.name, output = %output.display(), "job finished muxing");
                job.status = JobState::Completed;
                fx.persist = true;
            }
            MuxOutcome::Failed(reason) => {
                error!(job = %job.name, %reason, "muxing failed");
                if job.mux_attempts < retries {
                    job.mux_attempts += 1;
                    warn!(job = %job.name, attempt = job.mux_attempts, "retrying mux");
                    self.job_encoding_completed(id, fx);
                }
            }
        }
    }
}
