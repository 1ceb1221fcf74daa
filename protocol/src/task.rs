use std::path::PathBuf;

use bitflags::bitflags;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{JobId, TaskId, TaskKey, TaskState};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
pub enum Codec {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
    Aac,
    Opus,
    Vorbis,
    Flac,
    Mp3,
}

impl Codec {
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            Codec::H264 | Codec::H265 | Codec::Vp8 | Codec::Vp9 | Codec::Av1
        )
    }

    pub fn flag(&self) -> CodecSet {
        match self {
            Codec::H264 => CodecSet::H264,
            Codec::H265 => CodecSet::H265,
            Codec::Vp8 => CodecSet::VP8,
            Codec::Vp9 => CodecSet::VP9,
            Codec::Av1 => CodecSet::AV1,
            Codec::Aac => CodecSet::AAC,
            Codec::Opus => CodecSet::OPUS,
            Codec::Vorbis => CodecSet::VORBIS,
            Codec::Flac => CodecSet::FLAC,
            Codec::Mp3 => CodecSet::MP3,
        }
    }

    /// Extension of the part file a task of this codec produces.
    pub fn part_extension(&self) -> &'static str {
        match self {
            Codec::H264 | Codec::H265 => "mkv",
            Codec::Vp8 | Codec::Vp9 | Codec::Av1 => "webm",
            Codec::Aac => "m4a",
            Codec::Opus | Codec::Vorbis => "ogg",
            Codec::Flac => "flac",
            Codec::Mp3 => "mp3",
        }
    }
}

bitflags! {
    /// Codecs a node is able to encode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CodecSet: u16 {
        const H264   = 1 << 0;
        const H265   = 1 << 1;
        const VP8    = 1 << 2;
        const VP9    = 1 << 3;
        const AV1    = 1 << 4;
        const AAC    = 1 << 5;
        const OPUS   = 1 << 6;
        const VORBIS = 1 << 7;
        const FLAC   = 1 << 8;
        const MP3    = 1 << 9;
    }
}

impl CodecSet {
    pub fn supports(&self, codec: Codec) -> bool {
        self.contains(codec.flag())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum RateControl {
    /// Average bitrate, `rate` in kbps.
    Vbr,
    /// Constant quality, `rate` is the quality factor.
    Crf,
}

impl RateControl {
    pub fn max_passes(&self) -> u8 {
        match self {
            RateControl::Vbr => 2,
            RateControl::Crf => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, Default)]
pub enum Preset {
    UltraFast,
    SuperFast,
    VeryFast,
    Faster,
    Fast,
    #[default]
    Medium,
    Slow,
    Slower,
    VerySlow,
    Placebo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoTaskConfig {
    /// Relative to the shared folder.
    pub source_file: PathBuf,
    pub codec: Codec,
    pub rate_control: RateControl,
    pub rate: u32,
    pub passes: u8,
    pub preset: Preset,
    pub start_ms: u64,
    pub end_ms: u64,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioTaskConfig {
    pub source_file: PathBuf,
    pub codec: Codec,
    pub rate_control: RateControl,
    pub rate: u32,
    pub channels: u8,
    pub sample_rate: u32,
    pub stream_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskKind {
    Video(VideoTaskConfig),
    Audio(AudioTaskConfig),
}

impl TaskKind {
    pub fn is_video(&self) -> bool {
        matches!(self, TaskKind::Video(_))
    }

    pub fn codec(&self) -> Codec {
        match self {
            TaskKind::Video(v) => v.codec,
            TaskKind::Audio(a) => a.codec,
        }
    }

    pub fn step_count(&self) -> u8 {
        match self {
            TaskKind::Video(v) => v.passes.max(1),
            TaskKind::Audio(_) => 1,
        }
    }
}

/// Progress of a task. `units` are frames for video and milliseconds for audio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub state: TaskState,
    pub step_count: u8,
    pub current_step: u8,
    pub units_done: u64,
    pub units_total: u64,
    pub speed: f64,
}

impl TaskProgress {
    pub fn new(step_count: u8, units_total: u64) -> Self {
        Self {
            state: TaskState::Todo,
            step_count: step_count.max(1),
            current_step: 0,
            units_done: 0,
            units_total,
            speed: 0.0,
        }
    }

    pub fn start(&mut self) {
        if self.state == TaskState::Todo {
            self.state = TaskState::Computing;
            self.current_step = 0;
            self.units_done = 0;
        }
    }

    pub fn reset(&mut self) {
        self.state = TaskState::Todo;
        self.current_step = 0;
        self.units_done = 0;
        self.speed = 0.0;
    }

    pub fn complete(&mut self) {
        self.state = TaskState::Completed;
        self.current_step = self.step_count;
        self.units_done = self.units_total;
        self.speed = 0.0;
    }

    pub fn cancel(&mut self) {
        self.state = TaskState::Canceled;
        self.speed = 0.0;
    }

    /// Overall completion across every step, in `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.state == TaskState::Completed {
            return 1.0;
        }
        if self.units_total == 0 {
            return 0.0;
        }
        let step = (self.units_done.min(self.units_total)) as f64 / self.units_total as f64;
        (f64::from(self.current_step) + step) / f64::from(self.step_count.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub kind: TaskKind,
    pub progress: TaskProgress,
    /// Part file, relative to the shared folder.
    pub temp_file: PathBuf,
    pub final_file: PathBuf,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.job_id, self.id)
    }

    pub fn state(&self) -> TaskState {
        self.progress.state
    }

    pub fn is_video(&self) -> bool {
        self.kind.is_video()
    }
}
