use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::record::Record;

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub max_size: usize,
    pub timeout: Duration,
}

/// A contiguous run of offsets from one partition, delivered as a unit.
///
/// `records` only holds what decoded. Offsets that were skipped as undecodable
/// still count towards the covered range, so committing `last_offset` moves
/// the group past them.
#[derive(Debug)]
pub struct Batch {
    partition: i32,
    records: Vec<Record>,
    first_offset: i64,
    last_offset: i64,
    skipped: usize,
    opened_at: Instant,
}

impl Batch {
    fn open(partition: i32, offset: i64, now: Instant) -> Self {
        Self {
            partition,
            records: Vec::new(),
            first_offset: offset,
            last_offset: offset,
            skipped: 0,
            opened_at: now,
        }
    }

    fn cover(&mut self, offset: i64) {
        self.first_offset = self.first_offset.min(offset);
        self.last_offset = self.last_offset.max(offset);
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub(crate) fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    /// Number of deliverable records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Offsets covered so far, decoded or not.
    fn size(&self) -> usize {
        self.records.len() + self.skipped
    }

    pub fn first_offset(&self) -> i64 {
        self.first_offset
    }

    pub fn last_offset(&self) -> i64 {
        self.last_offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timeout,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timeout => "timeout",
        }
    }
}

/// Groups records into per-partition batches, and says when one is due.
///
/// A batch is due once it covers `max_size` offsets, skipped ones included, or
/// once `timeout` has passed since its first offset arrived, whichever comes
/// first. Due batches have to be taken before more offsets are added to that
/// partition.
pub struct BatchAccumulator {
    settings: BatchSettings,
    open: HashMap<i32, Batch>,
}

impl BatchAccumulator {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            settings,
            open: HashMap::new(),
        }
    }

    pub fn add(&mut self, record: Record) -> BatchStatus {
        self.add_at(record, Instant::now())
    }

    pub fn add_at(&mut self, record: Record, now: Instant) -> BatchStatus {
        let partition = record.partition();
        let max_size = self.settings.max_size;
        let batch = self.batch_for(partition, record.offset(), now);
        debug_assert!(batch.size() < max_size);

        batch.cover(record.offset());
        batch.records.push(record);
        self.status(partition, now)
    }

    /// Records that an offset could not be decoded. It joins the open batch so
    /// that its commit happens together with its neighbours.
    pub fn skip_at(&mut self, partition: i32, offset: i64, now: Instant) -> BatchStatus {
        let max_size = self.settings.max_size;
        let batch = self.batch_for(partition, offset, now);
        debug_assert!(batch.size() < max_size);

        batch.cover(offset);
        batch.skipped += 1;
        self.status(partition, now)
    }

    pub fn is_ready(&self, partition: i32, now: Instant) -> bool {
        self.open
            .get(&partition)
            .is_some_and(|batch| self.trigger(batch, now).is_some())
    }

    /// The earliest instant at which an open batch times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open
            .values()
            .map(|batch| batch.opened_at + self.settings.timeout)
            .min()
    }

    /// Takes the batch of `partition` if it is due.
    pub fn take_ready(&mut self, partition: i32, now: Instant) -> Option<(Batch, FlushTrigger)> {
        let trigger = self.trigger(self.open.get(&partition)?, now)?;
        self.open.remove(&partition).map(|batch| (batch, trigger))
    }

    /// Whether `partition` has a batch open, even one holding only skipped offsets.
    pub fn is_open(&self, partition: i32) -> bool {
        self.open.contains_key(&partition)
    }

    /// Takes the open batch of `partition` whether or not it is due.
    #[cfg(test)]
    pub(crate) fn take(&mut self, partition: i32) -> Option<Batch> {
        self.open.remove(&partition)
    }

    /// Deliverable records held across all open batches.
    pub fn buffered(&self) -> usize {
        self.open.values().map(Batch::len).sum()
    }

    fn batch_for(&mut self, partition: i32, offset: i64, now: Instant) -> &mut Batch {
        self.open
            .entry(partition)
            .or_insert_with(|| Batch::open(partition, offset, now))
    }

    fn trigger(&self, batch: &Batch, now: Instant) -> Option<FlushTrigger> {
        if batch.size() >= self.settings.max_size {
            Some(FlushTrigger::Size)
        } else if now.duration_since(batch.opened_at) >= self.settings.timeout {
            Some(FlushTrigger::Timeout)
        } else {
            None
        }
    }

    fn status(&self, partition: i32, now: Instant) -> BatchStatus {
        if self.is_ready(partition, now) {
            BatchStatus::Ready
        } else {
            BatchStatus::Pending
        }
    }
}
