use std::{collections::HashMap, path::PathBuf};

use protocol::{task::Task, JobId, JobState, TaskId, TaskKey, TaskState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Paths are relative to the shared folder.
    pub source_file: PathBuf,
    pub output_folder: PathBuf,
    pub output_file: PathBuf,
    pub status: JobState,
    /// Lower runs first; equal priorities run in submission order.
    pub priority: u32,
    pub tasks: Vec<Task>,
    pub mux_attempts: u32,
}

impl Job {
    pub fn order_key(&self) -> (u32, JobId) {
        (self.priority, self.id)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Tasks waiting for a node, in task order.
    pub fn todo_tasks(&self, video: bool) -> impl Iterator<Item = &Task> {
        self.tasks
            .iter()
            .filter(move |t| t.is_video() == video && t.state() == TaskState::Todo)
    }

    pub fn video_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.is_video())
    }

    pub fn audio_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.is_video())
    }

    pub fn all_completed(&self) -> bool {
        self.tasks.iter().all(|t| t.state() == TaskState::Completed)
    }

    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state() == TaskState::Completed)
            .count()
    }

    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        self.tasks.iter().map(|t| t.progress.ratio()).sum::<f64>() / self.tasks.len() as f64
    }
}

#[derive(Default)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
}

impl JobStore {
    /// Returns false when a job with the same id exists.
    pub fn insert(&mut self, job: Job) -> bool {
        if self.jobs.contains_key(&job.id) {
            return false;
        }
        self.jobs.insert(job.id, job);
        true
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        self.jobs.remove(&id)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn task(&self, key: TaskKey) -> Option<&Task> {
        self.jobs.get(&key.job_id)?.task(key.task_id)
    }

    pub fn task_mut(&mut self, key: TaskKey) -> Option<&mut Task> {
        self.jobs.get_mut(&key.job_id)?.task_mut(key.task_id)
    }

    /// Jobs in scheduling order.
    pub fn ordered(&self) -> Vec<&Job> {
        let mut jobs: Vec<_> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.order_key());
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
