pub mod config;
pub mod kafka_consumer;

pub use config::{ConsumerConfig, KafkaConfig};
pub use kafka_consumer::{PartitionedConsumer, RawMessage, RebalanceEvent};
