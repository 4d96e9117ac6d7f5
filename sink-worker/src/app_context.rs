use std::sync::Arc;
use std::time::Duration;

use crate::accumulator::BatchSettings;
use crate::committer::{OffsetCommitter, OffsetStore};
use crate::config::SinkSettings;
use crate::delivery::{Backend, DeliveryClient};
use crate::health::HealthRegistry;
use crate::record::RecordDecoder;
use crate::retry::RetryPolicy;
use crate::schema::SchemaManager;

/// Everything the partition workers share. Built once at startup.
pub struct AppContext {
    pub batch: BatchSettings,
    pub retry: RetryPolicy,
    pub delivery: Arc<dyn DeliveryClient>,
    pub schema: Option<Arc<SchemaManager>>,
    pub committer: Arc<OffsetCommitter>,
    pub decoder: RecordDecoder,
    pub liveness: HealthRegistry,
    pub channel_capacity: usize,
}

impl AppContext {
    pub fn new(
        settings: &SinkSettings,
        backend: Backend,
        offsets: Arc<dyn OffsetStore>,
        liveness: HealthRegistry,
    ) -> Self {
        Self {
            batch: settings.batch,
            retry: settings.retry,
            delivery: backend.delivery,
            schema: backend.schema,
            committer: Arc::new(OffsetCommitter::new(offsets)),
            decoder: settings.decoder(),
            liveness,
            channel_capacity: settings.channel_capacity,
        }
    }

    /// How long a partition worker may go without reporting before it counts
    /// as stalled. It has to outlast the longest retry backoff.
    pub fn liveness_deadline(&self) -> Duration {
        let backoff = self.retry.maximum_interval().saturating_mul(2);
        (backoff + Duration::from_secs(30)).max(Duration::from_secs(60))
    }

    /// How often a worker with nothing to do wakes up to check its batch
    /// timeout and report in.
    pub fn poll_interval(&self) -> Duration {
        (self.batch.timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(5))
    }
}
