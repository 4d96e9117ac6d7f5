//! Hands decoded records to one worker per assigned partition.
//!
//! Workers are started when a partition is assigned (or lazily on its first
//! record) and stopped when it is revoked. A worker that halts closes its
//! channel; from then on records of that partition are dropped uncommitted
//! until the partition is revoked or the process restarts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app_context::AppContext;
use crate::controller::{Inbound, PartitionStats, SinkController};
use crate::error::SinkError;
use crate::metrics_consts::{PARTITION_WORKERS, RECORDS_DROPPED_HALTED};

type WorkerResult = Result<Result<PartitionStats, SinkError>, JoinError>;

struct PartitionWorker {
    sender: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<PartitionStats, SinkError>>,
}

/// What every partition worker did by the time the sink stopped.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub partitions: BTreeMap<i32, PartitionStats>,
    pub halted: Vec<i32>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.halted.is_empty()
    }

    fn absorb(&mut self, partition: i32, result: WorkerResult) {
        match result {
            Ok(Ok(stats)) => {
                let total = self.partitions.entry(partition).or_default();
                total.batches_delivered += stats.batches_delivered;
                total.records_delivered += stats.records_delivered;
                total.records_skipped += stats.records_skipped;
                total.retries += stats.retries;
                total.last_committed = total.last_committed.max(stats.last_committed);
            }
            // Already logged by the worker when it halted
            Ok(Err(_)) => self.halted.push(partition),
            Err(e) => {
                error!(partition, error = %e, "partition worker panicked");
                self.halted.push(partition);
            }
        }
    }
}

pub struct PartitionRouter {
    context: Arc<AppContext>,
    shutdown: CancellationToken,
    workers: HashMap<i32, PartitionWorker>,
    // Workers that stopped on their own, joined on revoke or shutdown
    stopped: Vec<(i32, JoinHandle<Result<PartitionStats, SinkError>>)>,
    halted: HashSet<i32>,
    report: ShutdownReport,
}

impl PartitionRouter {
    pub fn new(context: Arc<AppContext>, shutdown: CancellationToken) -> Self {
        Self {
            context,
            shutdown,
            workers: HashMap::new(),
            stopped: Vec::new(),
            halted: HashSet::new(),
            report: ShutdownReport::default(),
        }
    }

    pub fn assign(&mut self, partitions: &[i32]) {
        for &partition in partitions {
            if self.workers.contains_key(&partition) {
                info!(partition, "worker already running, reusing it");
                continue;
            }
            self.spawn(partition);
        }
    }

    fn spawn(&mut self, partition: i32) -> &mut PartitionWorker {
        info!(partition, "starting partition worker");
        let (sender, receiver) = mpsc::channel(self.context.channel_capacity);
        let cancel = self.shutdown.child_token();
        let controller =
            SinkController::new(partition, receiver, self.context.clone(), cancel.clone());
        let worker = PartitionWorker {
            sender,
            cancel,
            handle: tokio::spawn(controller.run()),
        };

        let worker = self.workers.entry(partition).or_insert(worker);
        metrics::gauge!(PARTITION_WORKERS).increment(1.0);
        worker
    }

    /// Sends a record to its partition worker, waiting while the worker's
    /// channel is full. Gives up when the sink is shutting down.
    pub async fn route(&mut self, partition: i32, inbound: Inbound) {
        if self.halted.contains(&partition) {
            metrics::counter!(RECORDS_DROPPED_HALTED).increment(1);
            return;
        }

        let sender = match self.workers.get(&partition) {
            Some(worker) => worker.sender.clone(),
            None => self.spawn(partition).sender.clone(),
        };

        let sent = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            sent = sender.send(inbound) => sent,
        };

        if sent.is_err() {
            // The worker only drops its receiver when it stops
            warn!(
                partition,
                "partition worker stopped, dropping its records until the partition is reassigned"
            );
            metrics::counter!(RECORDS_DROPPED_HALTED).increment(1);
            self.halted.insert(partition);
            if let Some(worker) = self.workers.remove(&partition) {
                metrics::gauge!(PARTITION_WORKERS).decrement(1.0);
                self.stopped.push((partition, worker.handle));
            }
        }
    }

    /// Stops the workers of revoked partitions. Buffered records are left
    /// uncommitted for the next owner of the partition.
    pub async fn revoke(&mut self, partitions: &[i32]) {
        let mut stopping = Vec::new();
        for &partition in partitions {
            if let Some(worker) = self.workers.remove(&partition) {
                metrics::gauge!(PARTITION_WORKERS).decrement(1.0);
                worker.cancel.cancel();
                stopping.push((partition, worker.handle));
            }
            self.halted.remove(&partition);
        }
        let (stopped, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.stopped)
            .into_iter()
            .partition(|(partition, _)| partitions.contains(partition));
        self.stopped = running;
        stopping.extend(stopped);

        self.join(stopping).await;
        for &partition in partitions {
            self.context.committer.forget(partition);
            info!(partition, "partition revoked");
        }
    }

    async fn join(&mut self, workers: Vec<(i32, JoinHandle<Result<PartitionStats, SinkError>>)>) {
        let (partitions, handles): (Vec<_>, Vec<_>) = workers.into_iter().unzip();
        let results = join_all(handles).await;
        for (partition, result) in partitions.into_iter().zip(results) {
            self.report.absorb(partition, result);
        }
    }

    /// Stops every worker and waits for them.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!(workers = self.workers.len(), "stopping partition workers");
        self.shutdown.cancel();

        let mut workers: Vec<_> = std::mem::take(&mut self.stopped);
        for (partition, worker) in self.workers.drain() {
            workers.push((partition, worker.handle));
        }
        metrics::gauge!(PARTITION_WORKERS).set(0.0);
        self.join(workers).await;

        self.report.halted.sort_unstable();
        self.report
    }
}
