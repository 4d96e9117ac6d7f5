use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::{Batch, BatchAccumulator, FlushTrigger};
use crate::app_context::AppContext;
use crate::error::{DeliveryError, SinkError};
use crate::health::HealthHandle;
use crate::metrics_consts::{
    BATCHES_FLUSHED, BATCH_SIZE, DELIVERY_DURATION, DELIVERY_FAILURES, DELIVERY_RETRIES,
    PARTITION_HALTS, RECORDS_DELIVERED,
};
use crate::record::Record;

/// What the router hands a partition worker.
#[derive(Debug)]
pub enum Inbound {
    Record(Record),
    /// An offset whose message could not be decoded
    Skipped(i64),
}

/// Where a partition worker is in the life of its current batch.
#[derive(Debug)]
pub enum State {
    /// No open batch
    Idle,
    /// A batch is open and filling up
    Consuming,
    Flushing {
        batch: Batch,
        attempt: u32,
    },
    Retrying {
        batch: Batch,
        attempt: u32,
        until: Instant,
    },
    Committing {
        batch: Batch,
    },
    ShuttingDown,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    pub batches_delivered: u64,
    pub records_delivered: u64,
    pub records_skipped: u64,
    pub retries: u64,
    pub last_committed: Option<i64>,
}

enum Wake {
    Shutdown,
    Inbound(Option<Inbound>),
    Tick,
}

/// Runs the batch life cycle of one partition: accumulate, deliver, retry
/// transient failures with backoff, and commit once the destination has the
/// whole batch. Offsets are only committed after a successful delivery, and
/// batches of a partition are delivered strictly one after the other.
pub struct SinkController {
    partition: i32,
    inbound: mpsc::Receiver<Inbound>,
    accumulator: BatchAccumulator,
    context: Arc<AppContext>,
    shutdown: CancellationToken,
    liveness: HealthHandle,
    poll_interval: Duration,
    stats: PartitionStats,
}

impl SinkController {
    pub fn new(
        partition: i32,
        inbound: mpsc::Receiver<Inbound>,
        context: Arc<AppContext>,
        shutdown: CancellationToken,
    ) -> Self {
        let liveness = context
            .liveness
            .register(format!("partition-{partition}"), context.liveness_deadline());

        Self {
            partition,
            inbound,
            accumulator: BatchAccumulator::new(context.batch),
            poll_interval: context.poll_interval(),
            context,
            shutdown,
            liveness,
            stats: PartitionStats::default(),
        }
    }

    pub async fn run(mut self) -> Result<PartitionStats, SinkError> {
        info!(partition = self.partition, "partition worker started");

        let mut state = State::Idle;
        loop {
            state = match state {
                State::Idle | State::Consuming => self.consume().await,
                State::Flushing { batch, attempt } => match self.flush(batch, attempt).await {
                    Ok(next) => next,
                    Err(e) => return Err(self.halt(e)),
                },
                State::Retrying {
                    batch,
                    attempt,
                    until,
                } => self.wait_for_retry(batch, attempt, until).await,
                State::Committing { batch } => match self.commit(batch).await {
                    Ok(next) => next,
                    Err(e) => return Err(self.halt(e)),
                },
                State::ShuttingDown => return Ok(self.shut_down()),
            };
        }
    }

    fn resting_state(&self) -> State {
        if self.accumulator.is_open(self.partition) {
            State::Consuming
        } else {
            State::Idle
        }
    }

    async fn consume(&mut self) -> State {
        if self.shutdown.is_cancelled() {
            return State::ShuttingDown;
        }
        self.liveness.report_healthy();

        let now = Instant::now();
        if let Some((batch, trigger)) = self.accumulator.take_ready(self.partition, now) {
            return self.start_flush(batch, trigger);
        }

        let tick = now + self.poll_interval;
        let wake_at = self
            .accumulator
            .next_deadline()
            .map_or(tick, |deadline| deadline.min(tick));

        let wake = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Wake::Shutdown,
            inbound = self.inbound.recv() => Wake::Inbound(inbound),
            _ = sleep_until(wake_at) => Wake::Tick,
        };

        match wake {
            Wake::Shutdown => State::ShuttingDown,
            Wake::Inbound(None) => {
                debug!(partition = self.partition, "record channel closed");
                State::ShuttingDown
            }
            Wake::Inbound(Some(Inbound::Record(record))) => {
                self.accumulator.add(record);
                self.after_add()
            }
            Wake::Inbound(Some(Inbound::Skipped(offset))) => {
                self.stats.records_skipped += 1;
                self.accumulator.skip_at(self.partition, offset, Instant::now());
                self.after_add()
            }
            Wake::Tick => self.resting_state(),
        }
    }

    fn after_add(&mut self) -> State {
        match self.accumulator.take_ready(self.partition, Instant::now()) {
            Some((batch, trigger)) => self.start_flush(batch, trigger),
            None => self.resting_state(),
        }
    }

    fn start_flush(&self, batch: Batch, trigger: FlushTrigger) -> State {
        metrics::counter!(BATCHES_FLUSHED, "trigger" => trigger.as_str()).increment(1);
        metrics::histogram!(BATCH_SIZE).record(batch.len() as f64);
        debug!(
            partition = self.partition,
            first_offset = batch.first_offset(),
            last_offset = batch.last_offset(),
            records = batch.len(),
            trigger = trigger.as_str(),
            "flushing batch"
        );

        State::Flushing { batch, attempt: 0 }
    }

    async fn deliver(&self, batch: &mut Batch) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            // Only undecodable offsets, there is nothing to write but the
            // offsets still have to be committed
            return Ok(());
        }
        if let Some(schema) = &self.context.schema {
            schema.reconcile(batch).await?;
        }
        self.context.delivery.deliver(batch).await
    }

    async fn flush(&mut self, mut batch: Batch, attempt: u32) -> Result<State, SinkError> {
        let started = Instant::now();
        let result = self.deliver(&mut batch).await;
        metrics::histogram!(DELIVERY_DURATION, "backend" => self.context.delivery.name())
            .record(started.elapsed().as_secs_f64());

        let error = match result {
            Ok(()) => return Ok(State::Committing { batch }),
            Err(error) => error,
        };
        metrics::counter!(DELIVERY_FAILURES, "kind" => error.kind()).increment(1);

        let last_committed = self.context.committer.committed(self.partition);
        if !error.is_transient() {
            return Err(SinkError::DeliveryHalted {
                partition: self.partition,
                first_offset: batch.first_offset(),
                last_offset: batch.last_offset(),
                last_committed,
                source: error,
            });
        }
        if !self.context.retry.should_retry(attempt) {
            return Err(SinkError::RetriesExhausted {
                partition: self.partition,
                first_offset: batch.first_offset(),
                last_offset: batch.last_offset(),
                last_committed,
                attempts: attempt + 1,
                source: error,
            });
        }

        let delay = self.context.retry.time_until_next_retry(attempt);
        warn!(
            partition = self.partition,
            first_offset = batch.first_offset(),
            last_offset = batch.last_offset(),
            attempt = attempt + 1,
            ?delay,
            error = %error,
            "delivery failed, retrying batch"
        );
        metrics::counter!(DELIVERY_RETRIES).increment(1);
        self.stats.retries += 1;

        Ok(State::Retrying {
            batch,
            attempt: attempt + 1,
            until: Instant::now() + delay,
        })
    }

    async fn wait_for_retry(&mut self, batch: Batch, attempt: u32, until: Instant) -> State {
        self.liveness.report_healthy();
        let (first_offset, last_offset) = (batch.first_offset(), batch.last_offset());

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!(
                    partition = self.partition,
                    first_offset,
                    last_offset,
                    "stopping during retry backoff, the batch will be consumed again"
                );
                State::ShuttingDown
            }
            _ = sleep_until(until) => State::Flushing { batch, attempt },
        }
    }

    async fn commit(&mut self, batch: Batch) -> Result<State, SinkError> {
        let up_to = batch.last_offset();
        let mut attempt = 0;

        loop {
            let error = match self.context.committer.commit(self.partition, up_to) {
                Ok(outcome) => {
                    self.stats.batches_delivered += 1;
                    self.stats.records_delivered += batch.len() as u64;
                    self.stats.last_committed = Some(up_to);
                    metrics::counter!(RECORDS_DELIVERED).increment(batch.len() as u64);
                    debug!(
                        partition = self.partition,
                        up_to,
                        ?outcome,
                        records = batch.len(),
                        "batch delivered and committed"
                    );
                    return Ok(self.resting_state());
                }
                Err(error) => error,
            };

            // Losing the commit only means the batch is delivered again later
            if self.shutdown.is_cancelled() {
                warn!(
                    partition = self.partition,
                    up_to,
                    error = %error,
                    "abandoning offset commit on shutdown"
                );
                return Ok(State::ShuttingDown);
            }
            if !self.context.retry.should_retry(attempt) {
                return Err(SinkError::CommitHalted {
                    partition: self.partition,
                    offset: up_to,
                    attempts: attempt + 1,
                    source: error,
                });
            }

            let delay = self.context.retry.time_until_next_retry(attempt);
            warn!(
                partition = self.partition,
                up_to,
                attempt = attempt + 1,
                ?delay,
                error = %error,
                "offset commit failed, retrying"
            );
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    warn!(
                        partition = self.partition,
                        up_to,
                        "abandoning offset commit on shutdown"
                    );
                    return Ok(State::ShuttingDown);
                }
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn halt(&self, error: SinkError) -> SinkError {
        let (first_offset, last_offset) = error.offset_range();
        error!(
            partition = self.partition,
            first_offset,
            last_offset,
            last_committed = ?self.context.committer.committed(self.partition),
            error = %error,
            "partition halted, resume from the last committed offset once the cause is fixed"
        );
        metrics::counter!(PARTITION_HALTS).increment(1);
        self.liveness.report_halted(error.to_string());
        error
    }

    fn shut_down(self) -> PartitionStats {
        let buffered = self.accumulator.buffered();
        if buffered > 0 {
            info!(
                partition = self.partition,
                buffered, "leaving buffered records uncommitted, they will be consumed again"
            );
        }
        self.liveness.deregister();
        info!(partition = self.partition, stats = ?self.stats, "partition worker stopped");
        self.stats
    }
}
