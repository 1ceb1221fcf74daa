use std::path::PathBuf;

use clap::Parser;
use manager::config::ManagerConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "manager", about = "Master of the transcoding cluster")]
struct Cli {
    /// JSON configuration file, defaults are used without one
    #[arg(short, long, env = "MANAGER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = ManagerConfig::load(cli.config.as_deref())?;
    utils::logger::init(&cfg.log)?;

    info!(listen = %cfg.node_listen, shared = %cfg.shared_folder.display(), "running master");
    let cluster = manager::start(&cfg).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cluster.shutdown().await;
    Ok(())
}
