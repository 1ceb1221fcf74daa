use std::time::Duration;

use tokio::{task::JoinHandle, time};
use tracing::{debug, warn};

use crate::manager::Master;

/// Periodically disconnects nodes that stopped reporting.
pub fn spawn_checker(master: Master, every: Duration, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let silent = master.disconnect_silent(timeout);
            if silent.is_empty() {
                debug!("every node is alive");
            } else {
                warn!(?silent, ?timeout, "disconnected silent nodes");
            }
        }
    })
}
