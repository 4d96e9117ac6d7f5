pub const RECORDS_CONSUMED: &str = "sink_records_consumed_total";
pub const RECORDS_SKIPPED: &str = "sink_records_skipped_total";
pub const RECORDS_DROPPED_HALTED: &str = "sink_records_dropped_halted_partition_total";
pub const KAFKA_RECV_ERRORS: &str = "sink_kafka_recv_errors_total";

pub const BATCHES_FLUSHED: &str = "sink_batches_flushed_total";
pub const BATCH_SIZE: &str = "sink_batch_size_records";
pub const DELIVERY_DURATION: &str = "sink_delivery_duration_seconds";
pub const DELIVERY_FAILURES: &str = "sink_delivery_failures_total";
pub const DELIVERY_RETRIES: &str = "sink_delivery_retries_total";
pub const RECORDS_DELIVERED: &str = "sink_records_delivered_total";

pub const OFFSET_COMMITS: &str = "sink_offset_commits_total";
pub const OFFSET_COMMIT_FAILURES: &str = "sink_offset_commit_failures_total";

pub const PARTITION_HALTS: &str = "sink_partition_halts_total";
pub const PARTITION_WORKERS: &str = "sink_partition_workers";

pub const SCHEMA_COLUMNS_ADDED: &str = "sink_schema_columns_added_total";
