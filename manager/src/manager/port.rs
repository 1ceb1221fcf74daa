//! Collaborators the master talks to but does not implement itself.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use futures::future::BoxFuture;
use protocol::{task::Task, JobId, TaskKey};
use serde::{Deserialize, Serialize};

use super::{job::Job, node::Node};

pub trait NodeClient: Send + Sync + 'static {
    /// Offers a task to a node. `Ok(false)` is a refusal.
    fn offer_task(&self, endpoint: SocketAddr, task: Task) -> BoxFuture<'static, Result<bool>>;

    fn abort_task(&self, endpoint: SocketAddr, key: TaskKey) -> BoxFuture<'static, Result<()>>;

    fn notify_disconnect(&self, endpoint: SocketAddr) -> BoxFuture<'static, Result<()>>;
}

pub trait FileProbe: Send + Sync + 'static {
    fn probe(&self, path: PathBuf) -> BoxFuture<'static, Result<FileInfo>>;
}

pub trait Muxer: Send + Sync + 'static {
    /// Merges the parts of a job, returns the written file.
    fn mux(&self, req: MuxRequest) -> BoxFuture<'static, Result<PathBuf>>;
}

pub trait StateStore: Send + Sync + 'static {
    fn save(&self, snapshot: &Snapshot) -> Result<()>;

    fn load(&self) -> Result<Option<Snapshot>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    pub duration_ms: u64,
    pub size: u64,
    pub video: Option<VideoStream>,
    pub audio: Vec<AudioStream>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    pub index: u32,
    pub codec: String,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    pub index: u32,
    pub codec: String,
    pub channels: u8,
    pub sample_rate: u32,
}

/// Absolute paths of everything needed to produce the final file of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxRequest {
    pub job_id: JobId,
    pub job_name: String,
    pub video_parts: Vec<PathBuf>,
    pub audio_parts: Vec<PathBuf>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub jobs: Vec<Job>,
}
