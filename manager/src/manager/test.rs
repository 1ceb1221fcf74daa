use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use protocol::{
    handshake::HandShakeReq,
    node_msg::{CrashCause, CrashReport, ReportedTask, StatusReport, TaskReport},
    task::{
        AudioTaskConfig, Codec, CodecSet, Preset, RateControl, Task, TaskKind, TaskProgress,
        VideoTaskConfig,
    },
    JobId, JobState, NodeId, NodeState, TaskKey, TaskState,
};

use super::{
    dispatch::DispatchItem,
    job::Job,
    port::{MuxRequest, Muxer, NodeClient, Snapshot, StateStore},
    Effects, Event, Master, MasterInner, MuxOutcome, Policy, Ports,
};
use crate::config::ManagerConfig;

fn policy(shared: &Path) -> Policy {
    Policy {
        shared_folder: shared.to_path_buf(),
        mux_retries: 0,
        fatal_after_crashes: None,
    }
}

fn master() -> MasterInner {
    MasterInner::new(policy(Path::new("/nonexistent")))
}

pub(crate) fn hello(name: &str, threads: u32) -> HandShakeReq {
    HandShakeReq {
        unid: None,
        name: name.to_string(),
        address: None,
        listen_port: 7000,
        threads,
        codecs: CodecSet::all(),
    }
}

fn connect(inner: &mut MasterInner, name: &str, threads: u32) -> (NodeId, Effects) {
    let mut fx = Effects::default();
    let id = inner
        .connect(hello(name, threads), IpAddr::V4(Ipv4Addr::LOCALHOST), &mut fx)
        .unwrap();
    (id, fx)
}

fn video(job_id: JobId, id: u32) -> Task {
    let cfg = VideoTaskConfig {
        source_file: "movie.mkv".into(),
        codec: Codec::H264,
        rate_control: RateControl::Crf,
        rate: 23,
        passes: 1,
        preset: Preset::Medium,
        start_ms: u64::from(id) * 1000,
        end_ms: u64::from(id + 1) * 1000,
        extra_args: vec![],
    };
    Task {
        id,
        job_id,
        kind: TaskKind::Video(cfg),
        progress: TaskProgress::new(1, 1000),
        temp_file: format!("part-{id}.mkv").into(),
        final_file: format!("movie/parts/part-{id}.mkv").into(),
    }
}

pub(crate) fn audio(job_id: JobId, id: u32) -> Task {
    let cfg = AudioTaskConfig {
        source_file: "movie.mkv".into(),
        codec: Codec::Vorbis,
        rate_control: RateControl::Crf,
        rate: 3,
        channels: 2,
        sample_rate: 48000,
        stream_index: 1,
    };
    Task {
        id,
        job_id,
        kind: TaskKind::Audio(cfg),
        progress: TaskProgress::new(1, 1000),
        temp_file: format!("part-{id}.ogg").into(),
        final_file: format!("movie/parts/part-{id}.ogg").into(),
    }
}

pub(crate) fn job(priority: u32, tasks: impl FnOnce(JobId) -> Vec<Task>) -> Job {
    let id = JobId::next_id();
    Job {
        id,
        name: "movie".to_string(),
        source_file: "movie.mkv".into(),
        output_folder: "encoded/movie".into(),
        output_file: "encoded/movie/movie.mkv".into(),
        status: JobState::Todo,
        priority,
        tasks: tasks(id),
        mux_attempts: 0,
    }
}

fn add_job(inner: &mut MasterInner, job: Job) -> Effects {
    let mut fx = Effects::default();
    assert!(inner.add_job(job, &mut fx));
    fx
}

fn apply(inner: &mut MasterInner, event: Event) -> Effects {
    let mut fx = Effects::default();
    inner.apply(event, &mut fx);
    fx
}

fn accept_all(inner: &mut MasterInner, fx: Effects) -> Vec<TaskKey> {
    let mut accepted = vec![];
    let mut pending = fx.dispatch;
    while let Some(item) = pending.pop() {
        accepted.push(item.key());
        pending.extend(apply(inner, Event::TaskAccepted(item)).dispatch);
    }
    accepted
}

fn report(inner: &mut MasterInner, node: &NodeId, key: TaskKey, state: TaskState) -> Effects {
    let mut progress = TaskProgress::new(1, 1000);
    progress.start();
    match state {
        TaskState::Completed => progress.complete(),
        TaskState::Todo => progress.reset(),
        TaskState::Canceled => progress.cancel(),
        TaskState::Computing => progress.units_done = 500,
    }
    let report = TaskReport {
        unid: node.clone(),
        task: ReportedTask {
            id: key.task_id,
            job_id: key.job_id,
            progress,
        },
    };
    apply(inner, Event::TaskReportsReceived(vec![report]))
}

fn status(inner: &MasterInner, node: &NodeId) -> NodeState {
    inner.registry.get(node).unwrap().status
}

fn task_state(inner: &MasterInner, key: TaskKey) -> TaskState {
    inner.jobs.task(key).unwrap().state()
}

fn keys(fx: &Effects) -> Vec<TaskKey> {
    fx.dispatch.iter().map(DispatchItem::key).collect()
}

fn assert_capacity(inner: &MasterInner) {
    for node in inner.registry.iter() {
        assert!(inner.assignments.count(&node.id) <= node.threads as usize);
    }
}

#[test]
fn audio_goes_first_and_video_waits_for_an_idle_node() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 2);

    let job = job(0, |id| vec![video(id, 0), audio(id, 1)]);
    let job_id = job.id;
    let fx = add_job(&mut inner, job);

    assert_eq!(keys(&fx), vec![TaskKey::new(job_id, 1)]);
    assert_eq!(status(&inner, &x), NodeState::Locked);
    assert_eq!(inner.jobs.get(job_id).unwrap().status, JobState::Computing);

    let accepted = accept_all(&mut inner, fx);
    assert_eq!(accepted, vec![TaskKey::new(job_id, 1)]);
    assert_eq!(status(&inner, &x), NodeState::Working);
    assert_eq!(task_state(&inner, TaskKey::new(job_id, 0)), TaskState::Todo);

    let fx = report(&mut inner, &x, TaskKey::new(job_id, 1), TaskState::Completed);
    assert_eq!(keys(&fx), vec![TaskKey::new(job_id, 0)]);
    assert_eq!(status(&inner, &x), NodeState::Locked);
    assert_capacity(&inner);
}

#[test]
fn node_running_video_takes_no_audio() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 4);

    let first = job(0, |id| vec![video(id, 0)]);
    let fx = add_job(&mut inner, first);
    accept_all(&mut inner, fx);
    assert_eq!(status(&inner, &x), NodeState::Working);

    let second = job(0, |id| vec![audio(id, 0)]);
    let fx = add_job(&mut inner, second);
    assert!(fx.dispatch.is_empty());
    assert_eq!(inner.assignments.count(&x), 1);
}

#[test]
fn jobs_run_by_priority_then_submission() {
    let mut inner = master();
    let low = job(5, |id| vec![audio(id, 0)]);
    let high = job(1, |id| vec![audio(id, 0)]);
    let late_high = job(1, |id| vec![audio(id, 0)]);
    let (low_id, high_id, late_id) = (low.id, high.id, late_high.id);
    for job in [low, late_high, high] {
        add_job(&mut inner, job);
    }

    let (a, fx) = connect(&mut inner, "a", 1);
    assert_eq!(keys(&fx), vec![TaskKey::new(high_id, 0)]);
    let (_, fx) = connect(&mut inner, "b", 1);
    assert_eq!(keys(&fx), vec![TaskKey::new(late_id, 0)]);
    let (_, fx) = connect(&mut inner, "c", 1);
    assert_eq!(keys(&fx), vec![TaskKey::new(low_id, 0)]);
    assert_eq!(status(&inner, &a), NodeState::Locked);
}

#[test]
fn capability_mismatch_skips_the_task() {
    let mut inner = master();
    let mut req = hello("vp9 only", 2);
    req.codecs = CodecSet::VP9 | CodecSet::VORBIS;
    let mut fx = Effects::default();
    let x = inner
        .connect(req, IpAddr::V4(Ipv4Addr::LOCALHOST), &mut fx)
        .unwrap();

    let job = job(0, |id| vec![video(id, 0), audio(id, 1)]);
    let job_id = job.id;
    let fx = add_job(&mut inner, job);
    assert_eq!(keys(&fx), vec![TaskKey::new(job_id, 1)]);
    accept_all(&mut inner, fx);

    let fx = report(&mut inner, &x, TaskKey::new(job_id, 1), TaskState::Completed);
    assert!(fx.dispatch.is_empty());
    assert_eq!(status(&inner, &x), NodeState::Free);
}

#[test]
fn thread_capacity_is_never_exceeded() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 2);
    let (y, _) = connect(&mut inner, "y", 3);

    let job = job(0, |id| (0..10).map(|t| audio(id, t)).collect());
    let job_id = job.id;
    let fx = add_job(&mut inner, job);
    let accepted = accept_all(&mut inner, fx);

    assert_eq!(accepted.len(), 5);
    assert_eq!(inner.assignments.count(&x), 2);
    assert_eq!(inner.assignments.count(&y), 3);
    assert_capacity(&inner);

    let fx = report(&mut inner, &y, accepted[0], TaskState::Completed);
    accept_all(&mut inner, fx);
    assert_capacity(&inner);
    assert_eq!(
        inner
            .jobs
            .get(job_id)
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.state() == TaskState::Computing)
            .count(),
        5
    );
}

#[test]
fn refused_offer_returns_task_and_node() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let job = job(0, |id| vec![video(id, 0)]);
    let key = TaskKey::new(job.id, 0);
    let mut fx = add_job(&mut inner, job);
    let item = fx.dispatch.pop().unwrap();

    // x is the only candidate, so the task goes straight back to it
    let fx = apply(&mut inner, Event::TaskRefused(item.clone()));
    assert_eq!(keys(&fx), vec![key]);

    let fx = apply(&mut inner, Event::TaskRefused(fx.dispatch[0].clone()));
    assert_eq!(keys(&fx), vec![key]);
    assert_eq!(status(&inner, &x), NodeState::Locked);

    // a refusal for an offer that is no longer held changes nothing
    let mut fx = Effects::default();
    inner.remove_node(&x, &mut fx);
    let fx = apply(&mut inner, Event::TaskRefused(item));
    assert!(fx.dispatch.is_empty());
    assert_eq!(status(&inner, &x), NodeState::NotConnected);
    assert_eq!(task_state(&inner, key), TaskState::Todo);
}

#[test]
fn refusal_frees_the_node_when_nothing_else_fits() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let (y, _) = connect(&mut inner, "y", 1);
    let job = job(0, |id| vec![video(id, 0)]);
    let key = TaskKey::new(job.id, 0);
    let mut fx = add_job(&mut inner, job);
    let item = fx.dispatch.pop().unwrap();
    assert_eq!(item.node_id, x);

    inner.registry.get_mut(&x).unwrap().codecs = CodecSet::VORBIS;
    let fx = apply(&mut inner, Event::TaskRefused(item));
    assert_eq!(status(&inner, &x), NodeState::Free);
    assert_eq!(fx.dispatch[0].node_id, y);
    assert_eq!(inner.assignments.node_of(key), Some(&y));
}

#[test]
fn stale_task_report_is_dropped() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let (y, _) = connect(&mut inner, "y", 1);
    let job = job(0, |id| vec![audio(id, 0)]);
    let key = TaskKey::new(job.id, 0);
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);
    let holder = inner.assignments.node_of(key).cloned().unwrap();
    let other = if holder == x { y } else { x };

    let fx = report(&mut inner, &other, key, TaskState::Completed);
    assert!(fx.dispatch.is_empty());
    assert_eq!(task_state(&inner, key), TaskState::Computing);

    let unknown = NodeId::new("ghost").unwrap();
    report(&mut inner, &unknown, key, TaskState::Completed);
    assert_eq!(task_state(&inner, key), TaskState::Computing);

    report(&mut inner, &holder, key, TaskState::Computing);
    assert_eq!(inner.jobs.task(key).unwrap().progress.units_done, 500);
}

#[test]
fn task_report_racing_ahead_of_acceptance() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let job = job(0, |id| vec![audio(id, 0), audio(id, 1)]);
    let (first, second) = (TaskKey::new(job.id, 0), TaskKey::new(job.id, 1));
    let mut fx = add_job(&mut inner, job);
    let offered = fx.dispatch.pop().unwrap();
    assert_eq!(offered.key(), first);

    // the node finished before the dispatch worker reported the acceptance
    let fx = report(&mut inner, &x, first, TaskState::Completed);
    assert_eq!(keys(&fx), vec![second]);
    assert_eq!(status(&inner, &x), NodeState::Locked);

    let late = apply(&mut inner, Event::TaskAccepted(offered.clone()));
    assert!(late.dispatch.is_empty());
    assert_eq!(inner.assignments.node_of(second), Some(&x));
    assert_eq!(status(&inner, &x), NodeState::Locked);

    accept_all(&mut inner, fx);
    assert_eq!(status(&inner, &x), NodeState::Working);
    let fx = report(&mut inner, &x, second, TaskState::Completed);
    assert!(fx.dispatch.is_empty());
    assert_eq!(status(&inner, &x), NodeState::Free);

    // a late outcome never strands an idle node
    inner.registry.get_mut(&x).unwrap().status = NodeState::Locked;
    apply(&mut inner, Event::TaskRefused(offered));
    assert_eq!(status(&inner, &x), NodeState::Free);
    let fx = add_job(&mut inner, job_with_audio());
    assert_eq!(fx.dispatch.len(), 1);
}

#[test]
fn reported_locked_status_is_rejected() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let report = |status| StatusReport {
        unid: x.clone(),
        status,
        task_reports: vec![],
    };

    let fx = apply(&mut inner, Event::StatusReceived(report(NodeState::Locked)));
    assert!(fx.dispatch.is_empty());
    assert_eq!(status(&inner, &x), NodeState::Free);

    apply(&mut inner, Event::StatusReceived(report(NodeState::Free)));
    let fx = add_job(&mut inner, job_with_audio());
    assert_eq!(fx.dispatch.len(), 1);
}

fn job_with_audio() -> Job {
    job(0, |id| vec![audio(id, 0)])
}

#[test]
fn node_initiated_reset_reschedules() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let job = job(0, |id| vec![audio(id, 0)]);
    let key = TaskKey::new(job.id, 0);
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);

    let fx = report(&mut inner, &x, key, TaskState::Canceled);
    assert_eq!(keys(&fx), vec![key]);
    assert_eq!(task_state(&inner, key), TaskState::Computing);
    assert_eq!(status(&inner, &x), NodeState::Locked);
}

#[test]
fn fatal_crash_excludes_the_node() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 2);
    let first = job(0, |id| vec![audio(id, 0)]);
    let key = TaskKey::new(first.id, 0);
    let fx = add_job(&mut inner, first);
    accept_all(&mut inner, fx);

    let crash = CrashReport {
        unid: x.clone(),
        cause: CrashCause {
            fatal: true,
            message: "encoder missing".to_string(),
        },
    };
    let fx = apply(&mut inner, Event::CrashReceived(crash));
    assert!(fx.persist);
    assert_eq!(status(&inner, &x), NodeState::Crashed);

    let fx = add_job(&mut inner, job(0, |id| vec![audio(id, 0), video(id, 1)]));
    assert!(fx.dispatch.is_empty());

    // the running task stays with the crashed node
    assert_eq!(inner.assignments.node_of(key), Some(&x));
    assert_eq!(task_state(&inner, key), TaskState::Computing);

    // the node cannot take its id back before it disconnected
    let mut req = hello("x", 2);
    req.unid = Some(x.to_string());
    let mut fx = Effects::default();
    assert!(inner
        .connect(req.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), &mut fx)
        .is_err());

    inner.remove_node(&x, &mut fx);
    assert_eq!(task_state(&inner, key), TaskState::Todo);
    let mut fx = Effects::default();
    inner
        .connect(req, IpAddr::V4(Ipv4Addr::LOCALHOST), &mut fx)
        .unwrap();
    assert_eq!(fx.dispatch.len(), 1);
}

#[test]
fn non_fatal_crashes_escalate_when_configured() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let crash = || CrashReport {
        unid: x.clone(),
        cause: CrashCause {
            fatal: false,
            message: "segfault".to_string(),
        },
    };

    apply(&mut inner, Event::CrashReceived(crash()));
    apply(&mut inner, Event::CrashReceived(crash()));
    assert_eq!(status(&inner, &x), NodeState::Free);
    assert_eq!(inner.registry.get(&x).unwrap().non_fatal_crashes, 2);

    inner.policy.fatal_after_crashes = Some(3);
    apply(&mut inner, Event::CrashReceived(crash()));
    assert_eq!(status(&inner, &x), NodeState::Crashed);
}

#[test]
fn integrity_failure_rolls_the_job_back() {
    let shared = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(shared.path().join("movie/parts")).unwrap();
    let mut inner = MasterInner::new(policy(shared.path()));
    let nodes: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| connect(&mut inner, name, 1).0)
        .collect();

    let job = job(0, |id| (0..3).map(|t| video(id, t)).collect());
    let job_id = job.id;
    for task in &job.tasks {
        std::fs::write(shared.path().join(&task.final_file), b"part").unwrap();
    }
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);

    let holder = |inner: &MasterInner, t| {
        inner
            .assignments
            .node_of(TaskKey::new(job_id, t))
            .cloned()
            .unwrap()
    };
    for t in 0..2 {
        let node = holder(&inner, t);
        report(&mut inner, &node, TaskKey::new(job_id, t), TaskState::Completed);
    }
    assert_eq!(inner.jobs.get(job_id).unwrap().status, JobState::Computing);

    std::fs::remove_file(shared.path().join("movie/parts/part-2.mkv")).unwrap();
    let node = holder(&inner, 2);
    let fx = report(&mut inner, &node, TaskKey::new(job_id, 2), TaskState::Completed);

    assert!(fx.mux.is_empty());
    assert_eq!(inner.jobs.get(job_id).unwrap().status, JobState::Computing);
    assert_eq!(keys(&fx), vec![TaskKey::new(job_id, 2)]);
    assert_eq!(task_state(&inner, TaskKey::new(job_id, 0)), TaskState::Completed);
    assert!(nodes.iter().all(|n| inner.registry.get(n).is_some()));
}

#[test]
fn complete_job_is_muxed() {
    let shared = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(shared.path().join("movie/parts")).unwrap();
    let mut inner = MasterInner::new(policy(shared.path()));
    let (x, _) = connect(&mut inner, "x", 2);

    let job = job(0, |id| vec![video(id, 0), audio(id, 1)]);
    let job_id = job.id;
    std::fs::write(shared.path().join(&job.tasks[0].final_file), b"part").unwrap();
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);

    let fx = report(&mut inner, &x, TaskKey::new(job_id, 1), TaskState::Completed);
    accept_all(&mut inner, fx);
    let fx = report(&mut inner, &x, TaskKey::new(job_id, 0), TaskState::Completed);

    assert_eq!(inner.jobs.get(job_id).unwrap().status, JobState::Muxing);
    assert_eq!(status(&inner, &x), NodeState::Free);
    let [req] = &fx.mux[..] else {
        panic!("expected one mux request, got {:?}", fx.mux);
    };
    assert_eq!(req.job_id, job_id);
    assert_eq!(req.video_parts, vec![shared.path().join("movie/parts/part-0.mkv")]);
    assert_eq!(req.audio_parts, vec![shared.path().join("movie/parts/part-1.ogg")]);
    assert_eq!(req.output, shared.path().join("encoded/movie/movie.mkv"));

    apply(&mut inner, Event::Muxing(job_id, MuxOutcome::Started));
    let output = PathBuf::from("encoded/movie/movie.mkv");
    let fx = apply(&mut inner, Event::Muxing(job_id, MuxOutcome::Completed(output)));
    assert!(fx.persist);
    assert_eq!(inner.jobs.get(job_id).unwrap().status, JobState::Completed);
}

#[test]
fn mux_failure_is_retried_a_bounded_number_of_times() {
    let shared = tempfile::tempdir().unwrap();
    let mut inner = MasterInner::new(policy(shared.path()));
    let mut done = job(0, |id| vec![audio(id, 0)]);
    done.tasks[0].progress.complete();
    done.status = JobState::Muxing;
    let job_id = done.id;
    add_job(&mut inner, done);

    let failed = || Event::Muxing(job_id, MuxOutcome::Failed("mkvmerge died".to_string()));
    assert!(apply(&mut inner, failed()).mux.is_empty());
    assert_eq!(inner.jobs.get(job_id).unwrap().status, JobState::Muxing);

    inner.policy.mux_retries = 1;
    assert_eq!(apply(&mut inner, failed()).mux.len(), 1);
    assert!(apply(&mut inner, failed()).mux.is_empty());
    assert_eq!(inner.jobs.get(job_id).unwrap().mux_attempts, 1);
}

#[test]
fn remove_node_is_idempotent() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 2);
    let job = job(0, |id| vec![audio(id, 0), audio(id, 1)]);
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);
    assert_eq!(inner.assignments.count(&x), 2);

    let mut fx = Effects::default();
    inner.remove_node(&x, &mut fx);
    let once = serde_json::to_value(inner.snapshot()).unwrap();
    inner.remove_node(&x, &mut fx);
    let twice = serde_json::to_value(inner.snapshot()).unwrap();

    assert_eq!(once, twice);
    assert_eq!(status(&inner, &x), NodeState::NotConnected);
    assert!(inner.assignments.tasks_of(&x).is_empty());
    assert!(fx.dispatch.is_empty());
}

#[test]
fn reconnecting_node_starts_empty_and_free() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 2);
    let job = job(0, |id| vec![audio(id, 0), audio(id, 1)]);
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);

    apply(&mut inner, Event::NodeDisconnected(x.clone()));
    // another node takes over the released work
    let (y, fx) = connect(&mut inner, "y", 2);
    accept_all(&mut inner, fx);
    assert_eq!(inner.assignments.count(&y), 2);

    let mut req = hello("x", 2);
    req.unid = Some(x.to_string());
    let mut fx = Effects::default();
    let id = inner
        .connect(req, IpAddr::V4(Ipv4Addr::LOCALHOST), &mut fx)
        .unwrap();
    assert_eq!(id, x);
    assert_eq!(status(&inner, &x), NodeState::Free);
    assert!(inner.assignments.tasks_of(&x).is_empty());
    assert!(fx.dispatch.is_empty());
}

#[test]
fn reconnect_while_holding_tasks_releases_them() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let job = job(0, |id| vec![audio(id, 0)]);
    let key = TaskKey::new(job.id, 0);
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);

    // the node restarted without us noticing the disconnect
    inner.registry.get_mut(&x).unwrap().status = NodeState::NotConnected;
    let mut req = hello("x", 1);
    req.unid = Some(x.to_string());
    let mut fx = Effects::default();
    inner
        .connect(req, IpAddr::V4(Ipv4Addr::LOCALHOST), &mut fx)
        .unwrap();

    // handshake drops the old assignment before the fresh pass
    assert_eq!(keys(&fx), vec![key]);
    assert_eq!(inner.assignments.tasks_of(&x), vec![key]);
}

#[test]
fn status_reports() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let report = |status| StatusReport {
        unid: x.clone(),
        status,
        task_reports: vec![],
    };

    let fx = apply(&mut inner, Event::StatusReceived(report(NodeState::Free)));
    assert!(fx.dispatch.is_empty() && !fx.persist);

    apply(&mut inner, Event::StatusReceived(report(NodeState::Paused)));
    assert_eq!(status(&inner, &x), NodeState::Paused);
    let fx = add_job(&mut inner, job(0, |id| vec![audio(id, 0)]));
    assert!(fx.dispatch.is_empty());

    let fx = apply(&mut inner, Event::StatusReceived(report(NodeState::Free)));
    assert_eq!(fx.dispatch.len(), 1);
    assert_eq!(status(&inner, &x), NodeState::Locked);

    // an offer is in flight, the node does not know it yet
    apply(&mut inner, Event::StatusReceived(report(NodeState::Free)));
    assert_eq!(status(&inner, &x), NodeState::Locked);

    apply(&mut inner, Event::StatusReceived(report(NodeState::NotConnected)));
    assert_eq!(status(&inner, &x), NodeState::Locked);
}

#[test]
fn status_report_carries_task_reports() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let job = job(0, |id| vec![audio(id, 0)]);
    let key = TaskKey::new(job.id, 0);
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);

    let mut progress = TaskProgress::new(1, 1000);
    progress.complete();
    let status_report = StatusReport {
        unid: x.clone(),
        status: NodeState::Free,
        task_reports: vec![TaskReport {
            unid: x.clone(),
            task: ReportedTask {
                id: key.task_id,
                job_id: key.job_id,
                progress,
            },
        }],
    };
    apply(&mut inner, Event::StatusReceived(status_report));
    assert_eq!(task_state(&inner, key), TaskState::Completed);
    assert_eq!(status(&inner, &x), NodeState::Free);
}

#[test]
fn pause_and_resume() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let mut fx = Effects::default();
    assert!(inner.pause_node(&x, &mut fx));
    assert!(!inner.pause_node(&x, &mut fx));

    let job = job(0, |id| vec![video(id, 0)]);
    let fx = add_job(&mut inner, job);
    assert!(fx.dispatch.is_empty());

    let mut fx = Effects::default();
    assert!(inner.resume_node(&x, &mut fx));
    assert_eq!(fx.dispatch.len(), 1);
    assert!(!inner.resume_node(&NodeId::new("ghost").unwrap(), &mut fx));
}

#[test]
fn delete_job_aborts_running_tasks() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 2);
    let doomed = job(0, |id| vec![audio(id, 0), audio(id, 1)]);
    let doomed_id = doomed.id;
    let fx = add_job(&mut inner, doomed);
    accept_all(&mut inner, fx);
    let next = job(1, |id| vec![video(id, 0)]);
    let next_id = next.id;
    add_job(&mut inner, next);

    let mut fx = Effects::default();
    assert!(inner.delete_job(doomed_id, &mut fx));
    assert!(!inner.jobs.contains(doomed_id));

    let endpoint = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7000);
    assert_eq!(
        fx.abort,
        vec![
            (endpoint, TaskKey::new(doomed_id, 0)),
            (endpoint, TaskKey::new(doomed_id, 1)),
        ]
    );
    assert_eq!(keys(&fx), vec![TaskKey::new(next_id, 0)]);
    assert_eq!(status(&inner, &x), NodeState::Locked);

    assert!(!inner.delete_job(doomed_id, &mut Effects::default()));
}

#[test]
fn snapshot_restores_disconnected() {
    let shared = tempfile::tempdir().unwrap();
    let mut inner = MasterInner::new(policy(shared.path()));
    let (x, _) = connect(&mut inner, "x", 1);
    let job = job(0, |id| vec![audio(id, 0), audio(id, 1)]);
    let job_id = job.id;
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);
    let raw = serde_json::to_string(&inner.snapshot()).unwrap();
    let snapshot: Snapshot = serde_json::from_str(&raw).unwrap();

    let mut restored = MasterInner::new(policy(shared.path()));
    let mut fx = Effects::default();
    restored.restore(snapshot, &mut fx);

    assert_eq!(status(&restored, &x), NodeState::NotConnected);
    assert!(fx.dispatch.is_empty());
    let job = restored.jobs.get(job_id).unwrap();
    assert!(job.tasks.iter().all(|t| t.state() == TaskState::Todo));

    let mut req = hello("x", 1);
    req.unid = Some(x.to_string());
    let mut fx = Effects::default();
    restored
        .connect(req, IpAddr::V4(Ipv4Addr::LOCALHOST), &mut fx)
        .unwrap();
    assert_eq!(keys(&fx), vec![TaskKey::new(job_id, 0)]);
}

#[test]
fn shutdown_releases_everything() {
    let mut inner = master();
    let (x, _) = connect(&mut inner, "x", 1);
    let (_, _) = connect(&mut inner, "y", 1);
    let (z, _) = connect(&mut inner, "z", 1);
    assert!(inner.pause_node(&z, &mut Effects::default()));
    let job = job(0, |id| vec![audio(id, 0)]);
    let key = TaskKey::new(job.id, 0);
    let fx = add_job(&mut inner, job);
    accept_all(&mut inner, fx);

    let mut fx = Effects::default();
    inner.release_everything(&mut fx);
    // paused nodes are not told
    assert_eq!(fx.notify_disconnect.len(), 2);
    assert_eq!(status(&inner, &x), NodeState::NotConnected);
    assert_eq!(status(&inner, &z), NodeState::NotConnected);
    assert_eq!(task_state(&inner, key), TaskState::Todo);
    assert!(fx.persist);
}

/// Accepts every offer and remembers what it was asked.
#[derive(Default)]
pub(crate) struct RecordingClient {
    pub offers: Mutex<Vec<TaskKey>>,
    pub notices: Mutex<Vec<SocketAddr>>,
}

impl NodeClient for RecordingClient {
    fn offer_task(&self, _: SocketAddr, task: Task) -> BoxFuture<'static, Result<bool>> {
        self.offers.lock().push(task.key());
        async { Ok(true) }.boxed()
    }

    fn abort_task(&self, _: SocketAddr, _: TaskKey) -> BoxFuture<'static, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn notify_disconnect(&self, endpoint: SocketAddr) -> BoxFuture<'static, Result<()>> {
        self.notices.lock().push(endpoint);
        async { Ok(()) }.boxed()
    }
}

pub(crate) struct NoMuxer;

impl Muxer for NoMuxer {
    fn mux(&self, req: MuxRequest) -> BoxFuture<'static, Result<PathBuf>> {
        async move { Ok(req.output) }.boxed()
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub saved: Mutex<Option<Snapshot>>,
}

impl StateStore for MemoryStore {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.saved.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.saved.lock().clone())
    }
}

pub(crate) fn fake_ports(client: Arc<RecordingClient>, store: Arc<MemoryStore>) -> Ports {
    Ports {
        client,
        muxer: Arc::new(NoMuxer),
        store,
    }
}

pub(crate) async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
#[tracing_test::traced_test]
async fn master_dispatches_through_the_pool() {
    let client = Arc::new(RecordingClient::default());
    let store = Arc::new(MemoryStore::default());
    let master = Master::start(
        &ManagerConfig::default(),
        fake_ports(client.clone(), store.clone()),
    );

    let id = master
        .connect(hello("x", 1), IpAddr::V4(Ipv4Addr::LOCALHOST))
        .unwrap();
    let job = job(0, |id| vec![audio(id, 0)]);
    let key = TaskKey::new(job.id, 0);
    master.send(Event::JobSubmitted(job));

    wait_for("acceptance", || {
        master.nodes().iter().any(|n| n.status == NodeState::Working)
    })
    .await;
    assert_eq!(*client.offers.lock(), vec![key]);
    master.sync().await;
    let saved = store.saved.lock().clone().unwrap();
    assert_eq!(saved.jobs.len(), 1);

    master.shutdown().await;
    let saved = store.saved.lock().clone().unwrap();
    assert_eq!(saved.nodes.len(), 1);
    assert_eq!(saved.nodes[0].status, NodeState::NotConnected);
    assert_eq!(client.notices.lock().len(), 1);
    let node = master.nodes().into_iter().find(|n| n.id == id).unwrap();
    assert_eq!(node.status, NodeState::NotConnected);
    assert!(node.current_tasks.is_empty());
}
