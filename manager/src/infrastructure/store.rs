use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::debug;

use crate::manager::port::{Snapshot, StateStore};

/// Keeps the master state in one JSON file. Writes go to a sibling file
/// first and are renamed over the previous state.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonStateStore {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let raw = serde_json::to_vec_pretty(snapshot).context("serialize master state")?;
        let tmp = self.tmp_path();
        fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), nodes = snapshot.nodes.len(), jobs = snapshot.jobs.len(), "master state flushed");
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let snapshot = serde_json::from_slice(&raw)
            .with_context(|| format!("parse master state {}", self.path.display()))?;
        Ok(Some(snapshot))
    }
}
