//! The master's orchestration core.
//!
//! [`MasterInner`] is a synchronous state machine over the node registry,
//! the job store and the assignment table. Every entry point records the
//! side effects it needs in an [`Effects`] value instead of performing
//! them; the [`Master`] handle applies mutations under one lock and then
//! carries out the effects.

pub mod assignment;
pub mod dispatch;
pub mod job;
mod lifecycle;
pub mod node;
pub mod port;
mod reconcile;
mod schedule;

#[cfg(test)]
pub(crate) mod test;

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use protocol::{
    handshake::HandShakeReq,
    node_msg::{CrashReport, StatusReport, TaskReport},
    JobId, JobState, NodeId, NodeState, TaskKey,
};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    task::{self, JoinHandle},
    time,
};
use tracing::{error, info, warn};
use utils::log_if_err;

use crate::config::ManagerConfig;

use self::{
    assignment::Assignments,
    dispatch::{DispatchItem, DispatcherPool},
    job::{Job, JobStore},
    node::NodeRegistry,
    port::{MuxRequest, Muxer, NodeClient, Snapshot, StateStore},
};

/// Everything that reaches the core asynchronously.
#[derive(Debug)]
pub enum Event {
    NodeDisconnected(NodeId),
    TaskAccepted(DispatchItem),
    TaskRefused(DispatchItem),
    StatusReceived(StatusReport),
    TaskReportsReceived(Vec<TaskReport>),
    CrashReceived(CrashReport),
    JobSubmitted(Job),
    JobDeleted(JobId),
    Muxing(JobId, MuxOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MuxOutcome {
    Started,
    Completed(PathBuf),
    Failed(String),
}

/// Work left to do once the state is consistent again.
#[derive(Debug, Default)]
pub struct Effects {
    pub dispatch: Vec<DispatchItem>,
    pub mux: Vec<MuxRequest>,
    pub abort: Vec<(SocketAddr, TaskKey)>,
    pub notify_disconnect: Vec<SocketAddr>,
    pub persist: bool,
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub shared_folder: PathBuf,
    pub mux_retries: u32,
    /// Non-fatal crashes after which a node is treated as crashed.
    pub fatal_after_crashes: Option<u32>,
}

impl From<&ManagerConfig> for Policy {
    fn from(cfg: &ManagerConfig) -> Self {
        Self {
            shared_folder: cfg.shared_folder.clone(),
            mux_retries: cfg.mux_retries,
            fatal_after_crashes: cfg.fatal_after_crashes,
        }
    }
}

pub struct MasterInner {
    registry: NodeRegistry,
    jobs: JobStore,
    assignments: Assignments,
    policy: Policy,
}

impl MasterInner {
    pub fn new(policy: Policy) -> Self {
        Self {
            registry: NodeRegistry::default(),
            jobs: JobStore::default(),
            assignments: Assignments::default(),
            policy,
        }
    }

    pub fn apply(&mut self, event: Event, fx: &mut Effects) {
        match event {
            Event::NodeDisconnected(id) => self.remove_node(&id, fx),
            Event::TaskAccepted(item) => self.task_accepted(&item, fx),
            Event::TaskRefused(item) => self.task_refused(&item, fx),
            Event::StatusReceived(report) => self.read_status_report(report, fx),
            Event::TaskReportsReceived(reports) => self.read_task_reports(reports, fx),
            Event::CrashReceived(report) => self.read_crash_report(report, fx),
            Event::JobSubmitted(job) => {
                self.add_job(job, fx);
            }
            Event::JobDeleted(id) => {
                self.delete_job(id, fx);
            }
            Event::Muxing(id, outcome) => self.muxing_outcome(id, outcome, fx),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            nodes: self.registry.iter().cloned().collect(),
            jobs: self.jobs.ordered().into_iter().cloned().collect(),
        }
    }

    pub fn job_views(&self) -> Vec<JobView> {
        self.jobs
            .ordered()
            .into_iter()
            .map(|job| JobView {
                id: job.id,
                name: job.name.clone(),
                status: job.status,
                priority: job.priority,
                progress: job.progress(),
                tasks: job.tasks.len(),
                completed: job.completed_count(),
            })
            .collect()
    }

    pub fn node_views(&self) -> Vec<NodeView> {
        self.registry
            .iter()
            .map(|node| NodeView {
                id: node.id.clone(),
                name: node.name.clone(),
                endpoint: node.endpoint(),
                status: node.status,
                threads: node.threads,
                current_tasks: self.assignments.tasks_of(&node.id),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub name: String,
    pub status: JobState,
    pub priority: u32,
    pub progress: f64,
    pub tasks: usize,
    pub completed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub name: String,
    pub endpoint: SocketAddr,
    pub status: NodeState,
    pub threads: u32,
    pub current_tasks: Vec<TaskKey>,
}

#[derive(Clone)]
pub struct Ports {
    pub client: Arc<dyn NodeClient>,
    pub muxer: Arc<dyn Muxer>,
    pub store: Arc<dyn StateStore>,
}

/// Shared handle to the master state. Cheap to clone.
#[derive(Clone)]
pub struct Master {
    inner: Arc<Mutex<MasterInner>>,
    ports: Ports,
    dispatcher: Arc<DispatcherPool>,
    events: mpsc::UnboundedSender<Event>,
    flushes: mpsc::UnboundedSender<Flush>,
    services: Arc<Mutex<Vec<JoinHandle<()>>>>,
    notify_timeout: Duration,
}

/// Requests for the state writer, served in order.
enum Flush {
    Save(Arc<Snapshot>),
    /// Answered once every save queued before it is on disk.
    Sync(oneshot::Sender<()>),
}

impl Master {
    /// Starts the dispatch pool and the event loop. Requires a tokio runtime.
    pub fn start(cfg: &ManagerConfig, ports: Ports) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (flushes, flush_rx) = mpsc::unbounded_channel();
        let dispatcher = DispatcherPool::start(cfg.dispatchers, ports.client.clone(), events.clone());
        let writer = tokio::spawn(run_writer(ports.store.clone(), flush_rx));
        let master = Self {
            inner: Arc::new(Mutex::new(MasterInner::new(Policy::from(cfg)))),
            ports,
            dispatcher: Arc::new(dispatcher),
            events,
            flushes,
            services: Default::default(),
            notify_timeout: cfg.notify_timeout(),
        };

        let handle = tokio::spawn(master.clone().run_events(rx));
        master.track(handle);
        master.track(writer);
        master
    }

    /// Registers a background service to stop on shutdown.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.services.lock().push(handle);
    }

    async fn run_events(self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
    }

    pub fn handle(&self, event: Event) {
        self.mutate(|inner, fx| inner.apply(event, fx));
    }

    /// Queues an event for the reconciliation loop.
    pub fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            error!("event loop is gone, event dropped");
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut MasterInner, &mut Effects) -> R) -> R {
        let mut fx = Effects::default();
        let mut inner = self.inner.lock();
        let result = f(&mut inner, &mut fx);
        if fx.persist {
            self.flush(inner.snapshot());
        }
        self.execute(fx);
        result
    }

    fn flush(&self, snapshot: Snapshot) {
        if self.flushes.send(Flush::Save(Arc::new(snapshot))).is_err() {
            error!("state writer is gone, snapshot dropped");
        }
    }

    /// Waits until every snapshot taken so far is written.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.flushes.send(Flush::Sync(tx)).is_err() || rx.await.is_err() {
            warn!("state writer is gone, nothing to wait for");
        }
    }

    fn execute(&self, fx: Effects) {
        for item in fx.dispatch {
            self.dispatcher.dispatch(item);
        }
        for req in fx.mux {
            self.spawn_mux(req);
        }
        for (endpoint, key) in fx.abort {
            let fut = self.ports.client.abort_task(endpoint, key);
            tokio::spawn(bounded(self.notify_timeout, fut, "abort task"));
        }
        for endpoint in fx.notify_disconnect {
            let fut = self.ports.client.notify_disconnect(endpoint);
            tokio::spawn(bounded(self.notify_timeout, fut, "notify disconnect"));
        }
    }

    fn spawn_mux(&self, req: MuxRequest) {
        let muxer = self.ports.muxer.clone();
        let master = self.clone();
        tokio::spawn(async move {
            let job_id = req.job_id;
            master.send(Event::Muxing(job_id, MuxOutcome::Started));
            let outcome = match muxer.mux(req).await {
                Ok(output) => MuxOutcome::Completed(output),
                Err(err) => MuxOutcome::Failed(format!("{err:#}")),
            };
            master.send(Event::Muxing(job_id, outcome));
        });
    }

    pub fn connect(&self, req: HandShakeReq, peer: IpAddr) -> Result<NodeId> {
        self.mutate(|inner, fx| inner.connect(req, peer, fx))
    }

    pub fn add_job(&self, job: Job) -> bool {
        self.mutate(|inner, fx| inner.add_job(job, fx))
    }

    pub fn delete_job(&self, id: JobId) -> bool {
        self.mutate(|inner, fx| inner.delete_job(id, fx))
    }

    pub fn remove_node(&self, id: &NodeId) {
        self.mutate(|inner, fx| inner.remove_node(id, fx))
    }

    pub fn disconnect_node(&self, id: &NodeId) {
        self.mutate(|inner, fx| inner.disconnect_node(id, fx))
    }

    pub fn pause_node(&self, id: &NodeId) -> bool {
        self.mutate(|inner, fx| inner.pause_node(id, fx))
    }

    pub fn resume_node(&self, id: &NodeId) -> bool {
        self.mutate(|inner, fx| inner.resume_node(id, fx))
    }

    /// Disconnects nodes that have not reported for longer than `timeout`.
    pub fn disconnect_silent(&self, timeout: Duration) -> Vec<NodeId> {
        self.mutate(|inner, fx| {
            let silent = inner.registry.silent_nodes(timeout);
            for id in &silent {
                inner.disconnect_node(id, fx);
            }
            silent
        })
    }

    pub fn update_nodes_work(&self) {
        self.mutate(|inner, fx| inner.update_nodes_work(fx))
    }

    pub fn restore(&self, snapshot: Snapshot) {
        self.mutate(|inner, fx| inner.restore(snapshot, fx))
    }

    pub fn jobs(&self) -> Vec<JobView> {
        self.inner.lock().job_views()
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.inner.lock().jobs.get(id).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeView> {
        self.inner.lock().node_views()
    }

    pub fn dispatcher(&self) -> &DispatcherPool {
        &self.dispatcher
    }

    /// Releases every task, flushes the state, says goodbye to the nodes
    /// and stops every service.
    pub async fn shutdown(&self) {
        let notices: Vec<_> = {
            let mut fx = Effects::default();
            let mut inner = self.inner.lock();
            inner.release_everything(&mut fx);
            self.flush(inner.snapshot());
            fx.notify_disconnect
                .into_iter()
                .map(|endpoint| {
                    let fut = self.ports.client.notify_disconnect(endpoint);
                    bounded(self.notify_timeout, fut, "notify disconnect")
                })
                .collect()
        };
        info!(nodes = notices.len(), "master shutting down");
        self.sync().await;
        join_all(notices).await;

        self.dispatcher.shutdown();
        for handle in self.services.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Writes snapshots off the lock and off the runtime threads. A backlog is
/// collapsed into its newest snapshot.
async fn run_writer(store: Arc<dyn StateStore>, mut rx: mpsc::UnboundedReceiver<Flush>) {
    while let Some(first) = rx.recv().await {
        let mut latest = None;
        let mut waiting = vec![];
        let mut next = Some(first);
        while let Some(flush) = next {
            match flush {
                Flush::Save(snapshot) => latest = Some(snapshot),
                Flush::Sync(tx) => waiting.push(tx),
            }
            next = rx.try_recv().ok();
        }

        if let Some(snapshot) = latest {
            let store = store.clone();
            match task::spawn_blocking(move || store.save(&snapshot)).await {
                Ok(res) => log_if_err!(res, "flush master state"),
                Err(err) => error!(?err, "state writer crashed"),
            }
        }
        for tx in waiting {
            let _ = tx.send(());
        }
    }
}

async fn bounded(timeout: Duration, fut: BoxFuture<'static, Result<()>>, what: &'static str) {
    let res: Result<()> = async { time::timeout(timeout, fut).await.context("timed out")? }.await;
    if let Err(err) = res {
        warn!(?err, "{what} failed");
    }
}
