use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, ensure, Context, Result};
use protocol::{
    job_msg::JobRequest,
    task::{AudioTaskConfig, Codec, RateControl, Task, TaskKind, TaskProgress, VideoTaskConfig},
    JobId, JobState, TaskId,
};
use tokio::{
    sync::mpsc,
    task::{self, JoinHandle},
};
use tracing::{error, info, warn};

use crate::{
    config::ManagerConfig,
    manager::{
        job::Job,
        port::{FileInfo, FileProbe},
        Event, Master,
    },
};

const PARTS_FOLDER: &str = "parts";

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub shared_folder: PathBuf,
    pub encoding_folder: PathBuf,
    pub task_length_ms: u64,
    pub media_extensions: Vec<String>,
}

impl From<&ManagerConfig> for JobSettings {
    fn from(cfg: &ManagerConfig) -> Self {
        Self {
            shared_folder: cfg.shared_folder.clone(),
            encoding_folder: cfg.encoding_folder.clone(),
            task_length_ms: cfg.task_length_ms.max(1),
            media_extensions: cfg.media_extensions.clone(),
        }
    }
}

/// Turns client requests into jobs, one request at a time.
#[derive(Clone)]
pub struct JobInitiator {
    requests: mpsc::UnboundedSender<JobRequest>,
    shared_folder: PathBuf,
}

impl JobInitiator {
    pub fn start(
        master: Master,
        probe: Arc<dyn FileProbe>,
        settings: JobSettings,
    ) -> (Self, JoinHandle<()>) {
        let (requests, mut rx) = mpsc::unbounded_channel::<JobRequest>();
        let initiator = Self {
            requests,
            shared_folder: settings.shared_folder.clone(),
        };
        let intake = Intake { probe, settings };

        let handle = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let name = req.name.clone();
                match intake.expand(req).await {
                    Ok(jobs) => {
                        for job in jobs {
                            master.send(Event::JobSubmitted(job));
                        }
                    }
                    Err(err) => error!(?err, %name, "cannot create job"),
                }
            }
        });
        (initiator, handle)
    }

    /// Queues a request. Fails when the input is not on the shared storage.
    pub fn submit(&self, req: JobRequest) -> Result<()> {
        let input = self.shared_folder.join(&req.input_file);
        ensure!(
            input.exists(),
            "input {} does not exist in the shared folder",
            req.input_file.display()
        );
        self.requests
            .send(req)
            .map_err(|_| anyhow::anyhow!("job intake is stopped"))
    }
}

struct Intake {
    probe: Arc<dyn FileProbe>,
    settings: JobSettings,
}

impl Intake {
    /// A folder gives one job per media file under it, a file one job.
    /// Inside a folder a file that cannot become a job is skipped.
    async fn expand(&self, req: JobRequest) -> Result<Vec<Job>> {
        let shared = self.settings.shared_folder.clone();
        let input = shared.join(&req.input_file);

        if !input.is_dir() {
            let job = self
                .create(&req, req.input_file.clone(), req.name.clone())
                .await?;
            return Ok(vec![job]);
        }

        info!(folder = %req.input_file.display(), "batch request");
        let folder = req.input_file.clone();
        let extensions = self.settings.media_extensions.clone();
        let files = blocking(move || collect_media_files(&shared, &folder, &extensions)).await?;

        let mut taken = HashSet::new();
        let mut jobs = Vec::with_capacity(files.len());
        for file in files {
            let name = batch_job_name(&req, &file, &mut taken);
            match self.create(&req, file.clone(), name).await {
                Ok(job) => jobs.push(job),
                Err(err) => warn!(?err, source = %file.display(), "cannot create job, skipped"),
            }
        }
        Ok(jobs)
    }

    async fn create(&self, req: &JobRequest, source: PathBuf, name: String) -> Result<Job> {
        let shared = self.settings.shared_folder.clone();
        let info = self
            .probe
            .probe(shared.join(&source))
            .await
            .with_context(|| format!("probe {}", source.display()))?;
        let job = build_job(req, source, name, &info, &self.settings)?;
        let job = blocking(move || prepare_file_system(&shared, &job).map(|_| job)).await?;
        info!(job_id = %job.id, name = %job.name, tasks = job.tasks.len(), "job created");
        Ok(job)
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    task::spawn_blocking(f).await.context("file system task")?
}

/// `<name> - <path under the batch folder>`, without the extension. Names
/// map to output folders, so a name already used in the batch gets a suffix.
fn batch_job_name(req: &JobRequest, file: &Path, taken: &mut HashSet<String>) -> String {
    let relative = file.strip_prefix(&req.input_file).unwrap_or(file);
    let base = format!("{} - {}", req.name, relative.with_extension("").to_string_lossy());
    let mut name = base.clone();
    let mut n = 2;
    while !taken.insert(folder_name(&name)) {
        name = format!("{base} ({n})");
        n += 1;
    }
    name
}

fn folder_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Media files under `folder`, relative to `shared`, sorted.
pub fn collect_media_files(
    shared: &Path,
    folder: &Path,
    extensions: &[String],
) -> Result<Vec<PathBuf>> {
    let mut found = vec![];
    let mut pending = vec![shared.join(folder)];

    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
            if matches {
                found.push(path.strip_prefix(shared)?.to_path_buf());
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Splits a source file into tasks: fixed-length video chunks first, then
/// one audio task per audio stream.
pub fn build_job(
    req: &JobRequest,
    source: PathBuf,
    name: String,
    info: &FileInfo,
    settings: &JobSettings,
) -> Result<Job> {
    let Some(video) = &info.video else {
        bail!("{} has no video stream", source.display());
    };
    ensure!(info.duration_ms > 0, "{} has no duration", source.display());

    let id = JobId::next_id();
    let output_folder = settings.encoding_folder.join(folder_name(&name));
    let parts = output_folder.join(PARTS_FOLDER);
    let passes = req.passes.clamp(1, req.rate_control.max_passes());

    let mut tasks = vec![];
    let mut start_ms = 0;
    while start_ms < info.duration_ms {
        let end_ms = (start_ms + settings.task_length_ms).min(info.duration_ms);
        let frames = ((end_ms - start_ms) as f64 / 1000.0 * video.frame_rate).round() as u64;
        let task_id = tasks.len() as TaskId;
        let kind = TaskKind::Video(VideoTaskConfig {
            source_file: source.clone(),
            codec: Codec::H264,
            rate_control: req.rate_control,
            rate: req.rate,
            passes,
            preset: req.preset,
            start_ms,
            end_ms,
            extra_args: vec![],
        });
        tasks.push(new_task(id, task_id, kind, frames, &parts));
        start_ms = end_ms;
    }

    for stream in &info.audio {
        let task_id = tasks.len() as TaskId;
        let kind = TaskKind::Audio(AudioTaskConfig {
            source_file: source.clone(),
            codec: Codec::Vorbis,
            rate_control: RateControl::Crf,
            rate: 3,
            channels: 2,
            sample_rate: 48000,
            stream_index: stream.index,
        });
        tasks.push(new_task(id, task_id, kind, info.duration_ms, &parts));
    }

    let output_file = output_folder.join(format!("{}.mkv", folder_name(&name)));
    Ok(Job {
        id,
        name,
        source_file: source,
        output_folder,
        output_file,
        status: JobState::Todo,
        priority: req.priority,
        tasks,
        mux_attempts: 0,
    })
}

fn new_task(job_id: JobId, id: TaskId, kind: TaskKind, units: u64, parts: &Path) -> Task {
    let part = format!("part-{id}.{}", kind.codec().part_extension());
    Task {
        id,
        job_id,
        progress: TaskProgress::new(kind.step_count(), units),
        kind,
        temp_file: PathBuf::from(job_id.to_string()).join(&part),
        final_file: parts.join(part),
    }
}

/// Creates the output folder of a job, emptying it if it already exists,
/// and its parts folder.
pub fn prepare_file_system(shared: &Path, job: &Job) -> Result<()> {
    let output = shared.join(&job.output_folder);
    if output.exists() {
        warn!(folder = %output.display(), "output folder is not empty, cleaning");
        fs::remove_dir_all(&output).with_context(|| format!("clean {}", output.display()))?;
    }
    let parts = output.join(PARTS_FOLDER);
    fs::create_dir_all(&parts).with_context(|| format!("create {}", parts.display()))?;
    Ok(())
}
