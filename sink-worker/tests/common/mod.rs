#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::{RawMessage, RebalanceEvent};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sink_worker::accumulator::{Batch, BatchSettings};
use sink_worker::app_context::AppContext;
use sink_worker::committer::{OffsetCommitter, OffsetStore};
use sink_worker::consumer::{consume, MessageSource};
use sink_worker::delivery::DeliveryClient;
use sink_worker::error::{BoxError, DeliveryError};
use sink_worker::health::HealthRegistry;
use sink_worker::record::RecordDecoder;
use sink_worker::retry::RetryPolicy;
use sink_worker::router::{PartitionRouter, ShutdownReport};

/// Hands out whatever the test pushes, then waits forever like an idle topic.
pub struct ChannelSource {
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawMessage>>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&self) -> Result<RawMessage, BoxError> {
        match self.messages.lock().await.recv().await {
            Some(message) => Ok(message),
            None => std::future::pending().await,
        }
    }
}

pub type DeliveryScript = Box<dyn Fn(&Batch, usize) -> Result<(), DeliveryError> + Send + Sync>;

/// Records every delivered batch as (partition, offsets). `script` sees each
/// attempt with its sequence number and decides how it ends.
pub struct FakeDelivery {
    pub delivered: Mutex<Vec<(i32, Vec<i64>)>>,
    attempts: Mutex<usize>,
    script: DeliveryScript,
}

impl FakeDelivery {
    pub fn accepting() -> Arc<Self> {
        Self::scripted(Box::new(|_, _| Ok(())))
    }

    pub fn scripted(script: DeliveryScript) -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
            script,
        })
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    pub fn delivered(&self) -> Vec<(i32, Vec<i64>)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryClient for FakeDelivery {
    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            *attempts
        };
        (self.script)(batch, attempt)?;

        let offsets = batch.records().iter().map(|r| r.offset()).collect();
        self.delivered
            .lock()
            .unwrap()
            .push((batch.partition(), offsets));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

#[derive(Default)]
pub struct MemoryOffsets {
    pub stored: Mutex<Vec<(i32, i64)>>,
}

impl MemoryOffsets {
    pub fn stored(&self) -> Vec<(i32, i64)> {
        self.stored.lock().unwrap().clone()
    }
}

impl OffsetStore for MemoryOffsets {
    fn store(&self, partition: i32, next_offset: i64) -> Result<(), BoxError> {
        self.stored.lock().unwrap().push((partition, next_offset));
        Ok(())
    }
}

pub struct Pipeline {
    pub messages: mpsc::UnboundedSender<RawMessage>,
    pub rebalances: mpsc::UnboundedSender<RebalanceEvent>,
    pub context: Arc<AppContext>,
    pub shutdown: CancellationToken,
    handle: JoinHandle<ShutdownReport>,
}

impl Pipeline {
    pub fn start(
        delivery: Arc<FakeDelivery>,
        offsets: Arc<MemoryOffsets>,
        max_size: usize,
    ) -> Self {
        let context = Arc::new(AppContext {
            batch: BatchSettings {
                max_size,
                timeout: Duration::from_secs(1),
            },
            retry: RetryPolicy::new(
                2,
                Duration::from_millis(100),
                Duration::from_secs(1),
                3,
            ),
            delivery,
            schema: None,
            committer: Arc::new(OffsetCommitter::new(offsets)),
            decoder: RecordDecoder::new(false),
            liveness: HealthRegistry::new("liveness"),
            channel_capacity: 100,
        });

        let (messages, messages_rx) = mpsc::unbounded_channel();
        let (rebalances, rebalances_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let source = ChannelSource {
            messages: tokio::sync::Mutex::new(messages_rx),
        };
        let router = PartitionRouter::new(context.clone(), shutdown.clone());

        let handle = {
            let context = context.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                consume(&source, rebalances_rx, router, context, shutdown).await
            })
        };

        Self {
            messages,
            rebalances,
            context,
            shutdown,
            handle,
        }
    }

    pub fn send(&self, partition: i32, offset: i64, payload: Value) {
        self.send_raw(partition, offset, Some(payload.to_string().into_bytes()));
    }

    pub fn send_raw(&self, partition: i32, offset: i64, payload: Option<Vec<u8>>) {
        self.messages
            .send(RawMessage {
                partition,
                offset,
                key: Some(format!("sensor-{partition}").into_bytes()),
                payload,
                timestamp_ms: Some(1_700_000_000_000 + offset),
            })
            .unwrap();
    }

    pub async fn stop(self) -> ShutdownReport {
        self.shutdown.cancel();
        self.handle.await.unwrap()
    }
}
