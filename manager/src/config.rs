use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::manager::dispatch::DEFAULT_DISPATCHERS;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Where nodes connect and send their reports.
    pub node_listen: SocketAddr,
    /// Root of the storage every node sees. Job and task paths are relative to it.
    pub shared_folder: PathBuf,
    /// Relative to `shared_folder`.
    pub encoding_folder: PathBuf,
    pub state_file: PathBuf,
    /// Concurrent task offers.
    pub dispatchers: usize,
    /// Length of one video chunk.
    pub task_length_ms: u64,
    pub offer_timeout_ms: u64,
    pub notify_timeout_ms: u64,
    pub node_timeout_secs: u64,
    pub check_interval_secs: u64,
    pub mux_retries: u32,
    pub fatal_after_crashes: Option<u32>,
    pub media_extensions: Vec<String>,
    pub log: utils::logger::Config,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            node_listen: SocketAddr::from(([0, 0, 0, 0], 1337)),
            shared_folder: PathBuf::from("/srv/transcode"),
            encoding_folder: PathBuf::from("encoded"),
            state_file: PathBuf::from("master_state.json"),
            dispatchers: DEFAULT_DISPATCHERS,
            task_length_ms: 5 * 60 * 1000,
            offer_timeout_ms: 10_000,
            notify_timeout_ms: 2_000,
            node_timeout_secs: 30,
            check_interval_secs: 10,
            mux_retries: 0,
            fatal_after_crashes: None,
            media_extensions: ["mkv", "mp4", "avi", "mov"].map(String::from).to_vec(),
            log: Default::default(),
        }
    }
}

impl ManagerConfig {
    /// Reads a JSON config file. Without a path every field takes its default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let cfg = serde_json::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn encoding_root(&self) -> PathBuf {
        self.shared_folder.join(&self.encoding_folder)
    }
}
