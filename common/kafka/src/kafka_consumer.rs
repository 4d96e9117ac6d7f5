use rdkafka::{
    consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::{KafkaError, KafkaResult},
    ClientContext, Message, Offset, TopicPartitionList,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};

/// Partition ownership changes observed by the group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<i32>),
    Revoked(Vec<i32>),
}

/// An owned copy of a consumed message, detached from the librdkafka buffer so
/// it can be handed to another task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp_ms: Option<i64>,
}

pub struct PartitionContext {
    topic: String,
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl PartitionContext {
    fn partitions_of(&self, list: &TopicPartitionList) -> Vec<i32> {
        list.elements_for_topic(&self.topic)
            .iter()
            .map(|elem| elem.partition())
            .collect()
    }

    /// Forwards the partitions of our topic in `list`, if there are any.
    fn forward(&self, list: &TopicPartitionList, event: fn(Vec<i32>) -> RebalanceEvent) {
        let partitions = self.partitions_of(list);
        if partitions.is_empty() {
            return;
        }

        let event = event(partitions);
        info!(?event, "partition ownership changed");
        if let Err(e) = self.events.send(event) {
            // Only happens once the router is gone, i.e. during shutdown
            warn!("dropping rebalance event: {}", e);
        }
    }
}

impl ClientContext for PartitionContext {}

impl ConsumerContext for PartitionContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(list) = rebalance {
            self.forward(list, RebalanceEvent::Revoked);
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(list) => self.forward(list, RebalanceEvent::Assigned),
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => error!("rebalance error: {}", e),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!("offset commit for {} partitions failed: {}", offsets.count(), e);
        }
    }
}

/// A consumer-group member subscribed to a single topic, which hands out
/// messages from every assigned partition and commits offsets on request.
pub struct PartitionedConsumer {
    consumer: StreamConsumer<PartitionContext>,
    topic: String,
}

impl PartitionedConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RebalanceEvent>), KafkaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = PartitionContext {
            topic: consumer_config.topic.clone(),
            events: tx,
        };

        let consumer: StreamConsumer<PartitionContext> = consumer_config
            .client_config(common_config)
            .create_with_context(context)?;
        consumer.subscribe(&[consumer_config.topic.as_str()])?;

        Ok((
            Self {
                consumer,
                topic: consumer_config.topic.clone(),
            },
            rx,
        ))
    }

    pub async fn recv(&self) -> Result<RawMessage, KafkaError> {
        let message = self.consumer.recv().await?;

        Ok(RawMessage {
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp_ms: message.timestamp().to_millis(),
        })
    }

    /// Synchronously commits `next_offset` (the first offset NOT yet delivered)
    /// as the group position of `partition`.
    pub fn commit(&self, partition: i32, next_offset: i64) -> Result<(), KafkaError> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&self.topic, partition, Offset::Offset(next_offset))?;
        self.consumer.commit(&list, CommitMode::Sync)
    }
}
