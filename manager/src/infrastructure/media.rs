//! ffprobe and ffmpeg, run as child processes on the master.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use async_process::Command;
use futures::{future::BoxFuture, FutureExt};
use paste::paste;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};

use crate::manager::port::{AudioStream, FileInfo, FileProbe, MuxRequest, Muxer, VideoStream};

macro_rules! from_str_opt {
    ($type_:ident) => {
        paste! {
            fn [<$type_ _from_str_opt>]<'de, D>(deserializer: D) -> Result<Option<$type_>, D::Error>
            where
                D: Deserializer<'de>,
            {
                let ss = Option::<String>::deserialize(deserializer)?;
                ss.map(|ss| ss.trim().parse::<$type_>())
                    .transpose()
                    .map_err(::serde::de::Error::custom)
            }
        }
    };
}

from_str_opt!(f64);
from_str_opt!(u32);
from_str_opt!(u64);

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    index: u32,
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    channels: Option<u8>,
    #[serde(default, deserialize_with = "u32_from_str_opt")]
    sample_rate: Option<u32>,
    #[serde(default)]
    disposition: Disposition,
}

#[derive(Debug, Default, Deserialize)]
struct Disposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default, deserialize_with = "f64_from_str_opt")]
    duration: Option<f64>,
    #[serde(default, deserialize_with = "u64_from_str_opt")]
    size: Option<u64>,
}

/// `"24000/1001"` or `"25"`.
fn frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let (num, den): (f64, f64) = (num.parse().ok()?, den.parse().ok()?);
            (den != 0.0).then(|| num / den)
        }
        None => raw.parse().ok(),
    }
}

pub fn parse_ffprobe(raw: &str) -> Result<FileInfo> {
    let output: ProbeOutput = serde_json::from_str(raw).context("deserialize ffprobe output")?;

    let mut info = FileInfo {
        duration_ms: output
            .format
            .duration
            .map_or(0, |secs| (secs * 1000.0).round() as u64),
        size: output.format.size.unwrap_or_default(),
        ..Default::default()
    };

    for stream in output.streams {
        match stream.codec_type.as_str() {
            "video" if stream.disposition.attached_pic == 0 => {
                if info.video.is_some() {
                    info!(index = stream.index, "more than one video stream, keeping the first");
                    continue;
                }
                info.video = Some(VideoStream {
                    index: stream.index,
                    codec: stream.codec_name,
                    frame_rate: stream
                        .r_frame_rate
                        .as_deref()
                        .and_then(frame_rate)
                        .unwrap_or_default(),
                    width: stream.width.unwrap_or_default(),
                    height: stream.height.unwrap_or_default(),
                });
            }
            "audio" => info.audio.push(AudioStream {
                index: stream.index,
                codec: stream.codec_name,
                channels: stream.channels.unwrap_or(2),
                sample_rate: stream.sample_rate.unwrap_or(48000),
            }),
            other => debug!(index = stream.index, kind = other, "stream ignored"),
        }
    }
    Ok(info)
}

#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffprobe"),
        }
    }
}

impl FileProbe for FfprobeProbe {
    fn probe(&self, path: PathBuf) -> BoxFuture<'static, Result<FileInfo>> {
        let program = self.program.clone();
        async move {
            debug!(path = %path.display(), "probing media file");
            let output = Command::new(&program)
                .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
                .arg(&path)
                .output()
                .await
                .with_context(|| format!("run {}", program.display()))?;
            if !output.status.success() {
                bail!("ffprobe failed on {}: {}", path.display(), output.status);
            }
            let raw = String::from_utf8(output.stdout).context("ffprobe output is not utf-8")?;
            parse_ffprobe(&raw)
        }
        .boxed()
    }
}

/// Concat demuxer input listing the video parts in order.
pub fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|part| {
            let escaped = part.to_string_lossy().replace('\'', r"'\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

/// Arguments joining the concatenated video and every audio part into
/// `req.output` without re-encoding.
pub fn mux_args(req: &MuxRequest, list: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-v", "error", "-f", "concat", "-safe", "0", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(list.into());
    for audio in &req.audio_parts {
        args.push("-i".into());
        args.push(audio.into());
    }
    args.extend(["-map", "0:v"].map(OsString::from));
    for input in 1..=req.audio_parts.len() {
        args.push("-map".into());
        args.push(format!("{input}:a").into());
    }
    args.extend(["-c", "copy"].map(OsString::from));
    args.push(req.output.clone().into());
    args
}

#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    program: PathBuf,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
        }
    }
}

impl Muxer for FfmpegMuxer {
    fn mux(&self, req: MuxRequest) -> BoxFuture<'static, Result<PathBuf>> {
        let program = self.program.clone();
        async move {
            if req.video_parts.is_empty() {
                bail!("job {} has no video part to mux", req.job_name);
            }
            let folder = req
                .output
                .parent()
                .context("output file has no parent folder")?;
            let list = folder.join(format!("{}.concat", req.job_id));
            std::fs::write(&list, concat_list(&req.video_parts))
                .with_context(|| format!("write {}", list.display()))?;

            info!(job = %req.job_name, parts = req.video_parts.len(), audio = req.audio_parts.len(), "muxing");
            let output = Command::new(&program)
                .args(mux_args(&req, &list))
                .output()
                .await
                .with_context(|| format!("run {}", program.display()));
            if let Err(err) = std::fs::remove_file(&list) {
                warn!(?err, list = %list.display(), "cannot remove concat list");
            }

            let output = output?;
            if !output.status.success() {
                bail!(
                    "ffmpeg exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(req.output)
        }
        .boxed()
    }
}
