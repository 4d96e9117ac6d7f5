use std::sync::Arc;

use async_trait::async_trait;

use crate::accumulator::Batch;
use crate::config::{BackendSettings, SinkSettings};
use crate::error::DeliveryError;
use crate::schema::SchemaManager;

pub mod mqtt;
pub mod timescale;

/// A destination the sink writes batches to.
///
/// `deliver` either writes the whole batch or reports why it could not, with
/// the failure already classified as transient or fatal. Redelivering a batch
/// after a transient failure must be acceptable to the destination, since the
/// sink guarantees at-least-once delivery only.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError>;

    /// Short backend name for logs and metric labels.
    fn name(&self) -> &'static str;

    /// Releases connections on shutdown.
    async fn close(&self) {}
}

/// A connected destination, and the schema manager that goes with it when the
/// destination has a schema.
pub struct Backend {
    pub delivery: Arc<dyn DeliveryClient>,
    pub schema: Option<Arc<SchemaManager>>,
}

/// Connects to the configured destination. Failures here are startup
/// failures: nothing was consumed yet.
pub async fn connect(settings: &SinkSettings) -> Result<Backend, DeliveryError> {
    match &settings.backend {
        BackendSettings::Timescale(timescale) => {
            let (client, schema) =
                timescale::TimescaleClient::connect(timescale, settings.schema).await?;
            Ok(Backend {
                delivery: Arc::new(client),
                schema: Some(schema),
            })
        }
        BackendSettings::Mqtt(mqtt) => {
            let client = mqtt::MqttClient::connect(mqtt).await?;
            Ok(Backend {
                delivery: Arc::new(client),
                schema: None,
            })
        }
    }
}
