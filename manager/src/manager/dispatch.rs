use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use protocol::{task::Task, NodeId, TaskKey};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{port::NodeClient, Event};

/// Offer of one task to one node. The outcome travels back as
/// [`Event::TaskAccepted`] or [`Event::TaskRefused`].
#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub node_id: NodeId,
    pub endpoint: SocketAddr,
    pub task: Task,
}

impl DispatchItem {
    pub fn key(&self) -> TaskKey {
        self.task.key()
    }
}

pub const DEFAULT_DISPATCHERS: usize = 5;

#[derive(Default)]
struct PoolStats {
    queued: AtomicUsize,
    busy: AtomicUsize,
}

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DispatchItem>>>;

/// Fixed set of dispatch workers draining one FIFO queue.
///
/// `dispatch` never waits: items beyond the worker count stay queued until
/// a worker is done with its current offer.
pub struct DispatcherPool {
    queue: mpsc::UnboundedSender<DispatchItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    capacity: usize,
}

impl DispatcherPool {
    pub fn start(
        capacity: usize,
        client: Arc<dyn NodeClient>,
        outcomes: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (queue, rx) = mpsc::unbounded_channel();
        let rx: SharedQueue = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(PoolStats::default());

        let workers = (0..capacity)
            .map(|id| {
                tokio::spawn(dispatch_worker(
                    id,
                    rx.clone(),
                    client.clone(),
                    outcomes.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        Self {
            queue,
            workers: Mutex::new(workers),
            stats,
            capacity,
        }
    }

    pub fn dispatch(&self, item: DispatchItem) {
        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.queue.send(item) {
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            warn!(task = %err.0.key(), "dispatcher pool is shut down, offer abandoned");
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.stats.queued.load(Ordering::SeqCst)
    }

    /// Offers in flight.
    pub fn busy(&self) -> usize {
        self.stats.busy.load(Ordering::SeqCst)
    }

    /// Stops every worker. Offers in flight are abandoned and their outcome
    /// never reported.
    pub fn shutdown(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }
}

impl Drop for DispatcherPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn dispatch_worker(
    id: usize,
    queue: SharedQueue,
    client: Arc<dyn NodeClient>,
    outcomes: mpsc::UnboundedSender<Event>,
    stats: Arc<PoolStats>,
) {
    loop {
        let item = { queue.lock().await.recv().await };
        let Some(item) = item else {
            debug!(worker = id, "dispatch queue closed");
            break;
        };
        stats.queued.fetch_sub(1, Ordering::SeqCst);
        stats.busy.fetch_add(1, Ordering::SeqCst);

        let accepted = match client.offer_task(item.endpoint, item.task.clone()).await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(?err, node_id = %item.node_id, task = %item.key(), "task offer failed");
                false
            }
        };
        stats.busy.fetch_sub(1, Ordering::SeqCst);

        info!(worker = id, node_id = %item.node_id, task = %item.key(), accepted, "offer answered");
        let event = if accepted {
            Event::TaskAccepted(item)
        } else {
            Event::TaskRefused(item)
        };
        if outcomes.send(event).is_err() {
            break;
        }
    }
}
