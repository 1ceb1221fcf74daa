use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::task::{Preset, RateControl};

/// Client job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// File or directory, relative to the shared folder. A directory
    /// submits one job per media file found under it.
    pub input_file: PathBuf,
    pub name: String,
    pub preset: Preset,
    pub rate_control: RateControl,
    pub rate: u32,
    pub passes: u8,
    #[serde(default)]
    pub priority: u32,
}
