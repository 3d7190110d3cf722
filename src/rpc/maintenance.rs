//! Periodic maintenance: bucket refresh, replication, republishing and expiration.

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use flume::{RecvTimeoutError, TrySendError};
use tracing::debug;

use super::{lookup::LookupKind, Rpc};

/// Pending runs the worker may lag behind by, before tickers skip cycles.
const QUEUE_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A periodic maintenance job.
pub enum MaintenanceTask {
    /// Look up a random id in every stale bucket.
    Refresh,
    /// Store every local record at the current closest nodes.
    Replicate,
    /// Store every record this node published itself again.
    Republish,
    /// Delete expired records.
    Expire,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 4] = [
        MaintenanceTask::Refresh,
        MaintenanceTask::Replicate,
        MaintenanceTask::Republish,
        MaintenanceTask::Expire,
    ];
}

#[derive(Debug)]
/// One ticker thread per task feeding a single worker through a bounded queue.
///
/// Each task can be cancelled on its own by dropping its stop channel.
pub(crate) struct Scheduler {
    queue: Mutex<Option<flume::Sender<MaintenanceTask>>>,
    tickers: Mutex<HashMap<MaintenanceTask, flume::Sender<()>>>,
}

impl Scheduler {
    /// Start the worker running `run` for every tick, until `run` returns `false`.
    pub fn start<F>(periods: &[(MaintenanceTask, Duration)], run: F) -> io::Result<Self>
    where
        F: Fn(MaintenanceTask) -> bool + Send + 'static,
    {
        let (queue_tx, queue_rx) = flume::bounded(QUEUE_CAPACITY);

        thread::Builder::new()
            .name("kademlia-maintenance".to_string())
            .spawn(move || {
                for task in queue_rx.iter() {
                    if !run(task) {
                        break;
                    }
                }
            })?;

        let mut tickers = HashMap::new();

        for (task, period) in periods.iter().copied() {
            let (stop_tx, stop_rx) = flume::bounded::<()>(1);
            let queue = queue_tx.clone();

            thread::Builder::new()
                .name(format!("kademlia-{task:?}").to_lowercase())
                .spawn(move || tick(task, period, stop_rx, queue))?;

            tickers.insert(task, stop_tx);
        }

        Ok(Self {
            queue: Mutex::new(Some(queue_tx)),
            tickers: Mutex::new(tickers),
        })
    }

    /// Stop scheduling `task`. Returns `false` if it was not scheduled.
    pub fn cancel(&self, task: MaintenanceTask) -> bool {
        self.tickers().remove(&task).is_some()
    }

    pub fn is_scheduled(&self, task: MaintenanceTask) -> bool {
        self.tickers().contains_key(&task)
    }

    /// Stop every ticker, the worker exits once the queue drains.
    pub fn shutdown(&self) {
        self.tickers().clear();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn tickers(&self) -> MutexGuard<'_, HashMap<MaintenanceTask, flume::Sender<()>>> {
        self.tickers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn tick(
    task: MaintenanceTask,
    period: Duration,
    stop: flume::Receiver<()>,
    queue: flume::Sender<MaintenanceTask>,
) {
    loop {
        match stop.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => match queue.try_send(task) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(?task, "Maintenance worker is busy, skipping a cycle");
                }
                Err(TrySendError::Disconnected(_)) => break,
            },
            // Cancelled.
            _ => break,
        }
    }
}

impl Rpc {
    /// Run a maintenance task now, on the calling thread.
    pub fn run_maintenance(&self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::Refresh => self.refresh(),
            MaintenanceTask::Replicate => self.replicate(),
            MaintenanceTask::Republish => self.republish(),
            MaintenanceTask::Expire => self.expire(),
        }
    }

    fn refresh(&self) {
        let stale = self.routing_table.stale_buckets(self.config.refresh);

        for index in &stale {
            let target = self.id.random_at_prefix(*index);

            self.lookup(&target, LookupKind::FindNode);
            self.routing_table.touch_bucket(*index);
        }

        debug!(
            buckets = stale.len(),
            table_size = self.routing_table.size(),
            "Refreshed stale buckets"
        );
    }

    fn replicate(&self) {
        let now = Instant::now();
        let mut replicated = 0;

        for record in self.store.records() {
            // Stored or replicated recently enough.
            if now.duration_since(record.last_republished_at) < self.config.replicate {
                continue;
            }

            match self.store_closest(&record.key, record.value.clone(), Some(record.remaining(now))) {
                Ok(_) => replicated += 1,
                Err(error) => debug!(key = %record.key, ?error, "Failed to replicate record"),
            }

            self.store.mark_republished(&record.key, now);
        }

        debug!(replicated, "Replicated records");
    }

    fn republish(&self) {
        let originals = self.store.originals();

        for record in &originals {
            self.store
                .publish(record.key.clone(), record.value.clone(), self.config.expire);

            if let Err(error) = self.store_closest(&record.key, record.value.clone(), None) {
                debug!(key = %record.key, ?error, "Failed to republish record");
            }
        }

        debug!(republished = originals.len(), "Republished records");
    }

    fn expire(&self) {
        let removed = self.store.remove_expired(Instant::now());

        if removed > 0 {
            debug!(removed, "Removed expired records");
        }
    }
}
