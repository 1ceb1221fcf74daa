pub mod application;
pub mod config;
pub mod controller;
pub mod infrastructure;
pub mod manager;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    application::job::{JobInitiator, JobSettings},
    config::ManagerConfig,
    infrastructure::{
        client::TcpNodeClient,
        media::{FfmpegMuxer, FfprobeProbe},
        store::JsonStateStore,
    },
    manager::{port::StateStore, Master, Ports},
};

/// A running master and its job intake.
#[derive(Clone)]
pub struct Cluster {
    pub master: Master,
    pub jobs: JobInitiator,
}

impl Cluster {
    pub async fn shutdown(&self) {
        self.master.shutdown().await;
    }
}

/// Restores the previous state, then starts the node listener, the job
/// intake and the liveness checker.
pub async fn start(cfg: &ManagerConfig) -> Result<Cluster> {
    let store = Arc::new(JsonStateStore::new(cfg.state_file.clone()));
    let ports = Ports {
        client: Arc::new(TcpNodeClient::new(cfg.offer_timeout(), cfg.notify_timeout())),
        muxer: Arc::new(FfmpegMuxer::default()),
        store: store.clone(),
    };
    let master = Master::start(cfg, ports);

    if let Some(snapshot) = store.load()? {
        master.restore(snapshot);
    }

    let listener = TcpListener::bind(cfg.node_listen)
        .await
        .with_context(|| format!("bind node listener on {}", cfg.node_listen))?;
    master.track(tokio::spawn(controller::node::serve(master.clone(), listener)));

    let (jobs, intake) = JobInitiator::start(
        master.clone(),
        Arc::new(FfprobeProbe::default()),
        JobSettings::from(cfg),
    );
    master.track(intake);
    master.track(application::node::spawn_checker(
        master.clone(),
        cfg.check_interval(),
        cfg.node_timeout(),
    ));

    info!(dispatchers = master.dispatcher().capacity(), "master started");
    Ok(Cluster { master, jobs })
}
