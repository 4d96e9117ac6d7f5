use std::sync::Arc;

use common_kafka::PartitionedConsumer;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{BoxError, CommitError};
use crate::metrics_consts::{OFFSET_COMMITS, OFFSET_COMMIT_FAILURES};

/// Where committed positions are persisted.
pub trait OffsetStore: Send + Sync {
    /// Stores `next_offset`, the first offset not yet delivered, as the
    /// position of `partition`.
    fn store(&self, partition: i32, next_offset: i64) -> Result<(), BoxError>;
}

impl OffsetStore for PartitionedConsumer {
    fn store(&self, partition: i32, next_offset: i64) -> Result<(), BoxError> {
        self.commit(partition, next_offset).map_err(Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Already at or past the requested offset, nothing was written
    Unchanged,
}

/// Commits delivered offsets, per partition.
///
/// Positions only ever move forward: asking to commit an offset at or below
/// the last committed one is a no-op, so replayed batches and repeated calls
/// are harmless.
pub struct OffsetCommitter {
    store: Arc<dyn OffsetStore>,
    committed: DashMap<i32, i64>,
}

impl OffsetCommitter {
    pub fn new(store: Arc<dyn OffsetStore>) -> Self {
        Self {
            store,
            committed: DashMap::new(),
        }
    }

    /// Marks everything up to and including `up_to` as delivered.
    pub fn commit(&self, partition: i32, up_to: i64) -> Result<CommitOutcome, CommitError> {
        if self
            .committed
            .get(&partition)
            .is_some_and(|last| *last >= up_to)
        {
            debug!(partition, up_to, "offset already committed");
            return Ok(CommitOutcome::Unchanged);
        }

        if let Err(source) = self.store.store(partition, up_to + 1) {
            metrics::counter!(OFFSET_COMMIT_FAILURES).increment(1);
            return Err(CommitError::Store {
                partition,
                offset: up_to,
                source,
            });
        }

        self.committed
            .entry(partition)
            .and_modify(|last| *last = (*last).max(up_to))
            .or_insert(up_to);
        metrics::counter!(OFFSET_COMMITS).increment(1);
        debug!(partition, up_to, "committed offset");

        Ok(CommitOutcome::Committed)
    }

    /// The last offset committed for `partition` by this process.
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.committed.get(&partition).map(|last| *last)
    }

    /// Drops what we know of a partition once it is no longer assigned to us.
    /// Another member may commit it meanwhile, so a later reassignment starts
    /// from a clean slate.
    pub fn forget(&self, partition: i32) {
        if let Some((_, last)) = self.committed.remove(&partition) {
            info!(partition, last_committed = last, "forgetting partition offsets");
        }
    }
}
