use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common_kafka::{PartitionedConsumer, RawMessage, RebalanceEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_context::AppContext;
use crate::controller::Inbound;
use crate::error::BoxError;
use crate::metrics_consts::{KAFKA_RECV_ERRORS, RECORDS_CONSUMED, RECORDS_SKIPPED};
use crate::router::{PartitionRouter, ShutdownReport};

/// Where raw messages come from. Implemented by the Kafka consumer, and by
/// in-memory sources in tests.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn recv(&self) -> Result<RawMessage, BoxError>;
}

#[async_trait]
impl MessageSource for PartitionedConsumer {
    async fn recv(&self) -> Result<RawMessage, BoxError> {
        PartitionedConsumer::recv(self).await.map_err(Into::into)
    }
}

enum Event {
    Shutdown,
    Rebalance(Option<RebalanceEvent>),
    Heartbeat,
    Message(Result<RawMessage, BoxError>),
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Pulls messages until `shutdown` fires, decodes them and routes them to
/// their partition worker. Rebalance events are applied between messages, so
/// a revoked partition's worker is stopped before anything else is routed.
pub async fn consume<S: MessageSource>(
    source: &S,
    mut rebalances: mpsc::UnboundedReceiver<RebalanceEvent>,
    mut router: PartitionRouter,
    context: Arc<AppContext>,
    shutdown: CancellationToken,
) -> ShutdownReport {
    // Routing blocks while a partition worker is backed up, which can last
    // as long as its retry backoff
    let liveness = context
        .liveness
        .register("consumer", context.liveness_deadline());
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut rebalances_open = true;

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Event::Shutdown,
            event = rebalances.recv(), if rebalances_open => Event::Rebalance(event),
            _ = heartbeat.tick() => Event::Heartbeat,
            message = source.recv() => Event::Message(message),
        };

        match event {
            Event::Shutdown => break,
            Event::Rebalance(Some(RebalanceEvent::Assigned(partitions))) => {
                router.assign(&partitions);
            }
            Event::Rebalance(Some(RebalanceEvent::Revoked(partitions))) => {
                router.revoke(&partitions).await;
            }
            Event::Rebalance(None) => rebalances_open = false,
            Event::Heartbeat => liveness.report_healthy(),
            Event::Message(Ok(message)) => {
                liveness.report_healthy();
                let partition = message.partition;
                let offset = message.offset;
                metrics::counter!(RECORDS_CONSUMED).increment(1);

                let inbound = match context.decoder.decode(message, Utc::now()) {
                    Ok(record) => Inbound::Record(record),
                    Err(e) => {
                        warn!(partition, offset, error = %e, "skipping undecodable message");
                        metrics::counter!(RECORDS_SKIPPED).increment(1);
                        Inbound::Skipped(offset)
                    }
                };
                router.route(partition, inbound).await;
            }
            Event::Message(Err(e)) => {
                warn!(error = %e, "failed to receive message");
                metrics::counter!(KAFKA_RECV_ERRORS).increment(1);
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    info!("shutting down consumer");
    let report = router.shutdown().await;
    liveness.deregister();
    debug!(?report, "consumer stopped");
    report
}
