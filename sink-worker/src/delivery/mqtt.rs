use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::v5;
use rumqttc::Outgoing;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::Batch;
use crate::config::{MqttQos, MqttSettings, MqttVersion};
use crate::delivery::DeliveryClient;
use crate::error::{BoxError, DeliveryError};
use crate::record::Record;
use crate::secrets::Secret;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// What the event loop task tells the publisher about the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkEvent {
    Connected,
    /// A publish left the client, with its packet id (0 for QoS 0)
    Written(u16),
    /// PUBACK, the end of a QoS 1 exchange
    Acknowledged(u16),
    /// PUBCOMP, the end of a QoS 2 exchange
    Completed(u16),
    Refused { auth: bool, reason: String },
    Disconnected(String),
}

/// Both protocol generations behind one interface.
#[async_trait]
trait Link: Send {
    /// Polls the connection until something the publisher cares about happens.
    async fn next_event(&mut self) -> LinkEvent;
}

#[async_trait]
impl Link for rumqttc::EventLoop {
    async fn next_event(&mut self) -> LinkEvent {
        use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet};

        loop {
            let event = match self.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => LinkEvent::Connected,
                Ok(Event::Incoming(Packet::PubAck(ack))) => LinkEvent::Acknowledged(ack.pkid),
                Ok(Event::Incoming(Packet::PubComp(comp))) => LinkEvent::Completed(comp.pkid),
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => LinkEvent::Written(pkid),
                Ok(_) => continue,
                Err(ConnectionError::ConnectionRefused(code)) => LinkEvent::Refused {
                    auth: matches!(
                        code,
                        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
                    ),
                    reason: format!("{code:?}"),
                },
                Err(e) => LinkEvent::Disconnected(e.to_string()),
            };
            return event;
        }
    }
}

#[async_trait]
impl Link for v5::EventLoop {
    async fn next_event(&mut self) -> LinkEvent {
        use v5::mqttbytes::v5::{ConnectReturnCode, Packet};
        use v5::{ConnectionError, Event};

        loop {
            let event = match self.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => LinkEvent::Connected,
                Ok(Event::Incoming(Packet::PubAck(ack))) => LinkEvent::Acknowledged(ack.pkid),
                Ok(Event::Incoming(Packet::PubComp(comp))) => LinkEvent::Completed(comp.pkid),
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => LinkEvent::Written(pkid),
                Ok(_) => continue,
                Err(ConnectionError::ConnectionRefused(code)) => LinkEvent::Refused {
                    auth: matches!(
                        code,
                        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
                    ),
                    reason: format!("{code:?}"),
                },
                Err(e) => LinkEvent::Disconnected(e.to_string()),
            };
            return event;
        }
    }
}

/// Owns the event loop: rumqttc only makes progress, including reconnects,
/// while it is being polled.
async fn drive(
    mut link: impl Link,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = link.next_event() => event,
        };

        let failed = matches!(
            event,
            LinkEvent::Refused { .. } | LinkEvent::Disconnected(_)
        );
        if failed {
            warn!(?event, "mqtt connection failed");
        }
        if events.send(event).is_err() {
            return;
        }

        if failed {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }
}

enum Session {
    V3(rumqttc::AsyncClient),
    V5(v5::AsyncClient),
}

impl Session {
    async fn publish(
        &self,
        topic: String,
        qos: MqttQos,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BoxError> {
        match self {
            Session::V3(client) => client
                .publish(topic, v3_qos(qos), retain, payload)
                .await
                .map_err(Into::into),
            Session::V5(client) => client
                .publish(topic, v5_qos(qos), retain, payload)
                .await
                .map_err(Into::into),
        }
    }

    async fn disconnect(&self) -> Result<(), BoxError> {
        match self {
            Session::V3(client) => client.disconnect().await.map_err(Into::into),
            Session::V5(client) => client.disconnect().await.map_err(Into::into),
        }
    }
}

fn v3_qos(qos: MqttQos) -> rumqttc::QoS {
    match qos {
        MqttQos::AtMostOnce => rumqttc::QoS::AtMostOnce,
        MqttQos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        MqttQos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn v5_qos(qos: MqttQos) -> v5::mqttbytes::QoS {
    match qos {
        MqttQos::AtMostOnce => v5::mqttbytes::QoS::AtMostOnce,
        MqttQos::AtLeastOnce => v5::mqttbytes::QoS::AtLeastOnce,
        MqttQos::ExactlyOnce => v5::mqttbytes::QoS::ExactlyOnce,
    }
}

/// `<root>/<key>`, or `<root>/<partition>` for records without a key. Topic
/// wildcards are not allowed in a publish, so they are replaced.
fn topic_for(root: &str, record: &Record) -> String {
    let leaf = record
        .key()
        .map(|key| key.trim_matches('/').replace(['+', '#'], "_"))
        .filter(|key| !key.is_empty())
        .unwrap_or_else(|| record.partition().to_string());

    format!("{root}/{leaf}")
}

/// Counts how many publishes of the current batch the broker confirmed, as
/// far as the requested QoS allows: written for QoS 0, PUBACK for QoS 1,
/// PUBCOMP for QoS 2.
struct AckTracker {
    qos: MqttQos,
    expected: usize,
    confirmed: usize,
    in_flight: HashSet<u16>,
}

impl AckTracker {
    fn new(qos: MqttQos, expected: usize) -> Self {
        Self {
            qos,
            expected,
            confirmed: 0,
            in_flight: HashSet::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.confirmed >= self.expected
    }

    fn observe(&mut self, event: LinkEvent) -> Result<(), DeliveryError> {
        match event {
            LinkEvent::Written(pkid) => {
                if self.qos == MqttQos::AtMostOnce {
                    self.confirmed += 1;
                } else {
                    self.in_flight.insert(pkid);
                }
            }
            LinkEvent::Acknowledged(pkid) if self.qos == MqttQos::AtLeastOnce => {
                if self.in_flight.remove(&pkid) {
                    self.confirmed += 1;
                }
            }
            LinkEvent::Completed(pkid) if self.qos == MqttQos::ExactlyOnce => {
                if self.in_flight.remove(&pkid) {
                    self.confirmed += 1;
                }
            }
            LinkEvent::Refused { auth: true, reason } => {
                return Err(DeliveryError::fatal(format!(
                    "broker rejected the credentials: {reason}"
                )))
            }
            LinkEvent::Refused { reason, .. } => {
                return Err(DeliveryError::transient(format!(
                    "broker refused the connection: {reason}"
                )))
            }
            LinkEvent::Disconnected(reason) => {
                return Err(DeliveryError::transient(format!(
                    "connection to the broker lost: {reason}"
                )))
            }
            LinkEvent::Connected | LinkEvent::Acknowledged(_) | LinkEvent::Completed(_) => {}
        }
        Ok(())
    }
}

/// Publishes every record of a batch as its own message and waits for the
/// broker to confirm all of them.
///
/// Deliveries are serialized: acknowledgements carry only a packet id, so only
/// one batch at a time can be waiting on them.
pub struct MqttClient {
    session: Session,
    events: Mutex<mpsc::UnboundedReceiver<LinkEvent>>,
    topic_root: String,
    qos: MqttQos,
    retain: bool,
    ack_timeout: Duration,
    cancel: CancellationToken,
}

impl MqttClient {
    pub async fn connect(settings: &MqttSettings) -> Result<Self, DeliveryError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let password = settings
            .password
            .as_ref()
            .map(Secret::expose)
            .unwrap_or_default();

        let session = match settings.version {
            MqttVersion::V3_1 | MqttVersion::V3_1_1 => {
                if settings.version == MqttVersion::V3_1 {
                    warn!("mqtt 3.1 requested, connecting with a 3.1.1 session");
                }
                let mut options =
                    rumqttc::MqttOptions::new(&settings.client_id, &settings.host, settings.port);
                options.set_keep_alive(KEEP_ALIVE);
                if let Some(username) = &settings.username {
                    options.set_credentials(username, password);
                }
                let (client, eventloop) = rumqttc::AsyncClient::new(options, REQUEST_CAPACITY);
                tokio::spawn(drive(eventloop, tx, cancel.clone()));
                Session::V3(client)
            }
            MqttVersion::V5 => {
                let mut options =
                    v5::MqttOptions::new(&settings.client_id, &settings.host, settings.port);
                options.set_keep_alive(KEEP_ALIVE);
                if let Some(username) = &settings.username {
                    options.set_credentials(username, password);
                }
                let (client, eventloop) = v5::AsyncClient::new(options, REQUEST_CAPACITY);
                tokio::spawn(drive(eventloop, tx, cancel.clone()));
                Session::V5(client)
            }
        };

        // Fail the startup on bad credentials. Anything else is retried by the
        // event loop and surfaces as transient delivery failures.
        match timeout(CONNECT_TIMEOUT, rx.recv()).await {
            Ok(Some(LinkEvent::Connected)) => info!(
                host = %settings.host,
                port = settings.port,
                client_id = %settings.client_id,
                "connected to mqtt broker"
            ),
            Ok(Some(LinkEvent::Refused { auth: true, reason })) => {
                cancel.cancel();
                return Err(DeliveryError::fatal(format!(
                    "mqtt broker rejected the credentials: {reason}"
                )));
            }
            Ok(Some(event)) => warn!(?event, "mqtt broker not reachable yet"),
            Ok(None) => return Err(DeliveryError::fatal("mqtt event loop stopped")),
            Err(_) => warn!(
                timeout = ?CONNECT_TIMEOUT,
                "no answer from the mqtt broker yet"
            ),
        }

        Ok(Self {
            session,
            events: Mutex::new(rx),
            topic_root: settings.topic_root.clone(),
            qos: settings.qos,
            retain: settings.retain,
            ack_timeout: settings.ack_timeout,
            cancel,
        })
    }
}

#[async_trait]
impl DeliveryClient for MqttClient {
    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut events = self.events.lock().await;
        // Leftovers from an abandoned delivery say nothing about this one,
        // except a credentials rejection which will not go away
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::Refused { auth: true, reason } = event {
                return Err(DeliveryError::fatal(format!(
                    "broker rejected the credentials: {reason}"
                )));
            }
        }

        let deadline = Instant::now() + self.ack_timeout;
        for record in batch.records() {
            let payload = serde_json::to_vec(record.payload()).map_err(DeliveryError::fatal)?;
            let topic = topic_for(&self.topic_root, record);
            match timeout_at(
                deadline,
                self.session.publish(topic, self.qos, self.retain, payload),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(DeliveryError::Transient(e)),
                Err(_) => {
                    return Err(DeliveryError::transient(format!(
                        "timed out after {:?} queueing publishes",
                        self.ack_timeout
                    )))
                }
            }
        }

        let mut tracker = AckTracker::new(self.qos, batch.len());
        while !tracker.is_complete() {
            let event = match timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(DeliveryError::fatal("mqtt event loop stopped")),
                Err(_) => {
                    return Err(DeliveryError::transient(format!(
                        "timed out after {:?} with {} of {} publishes confirmed",
                        self.ack_timeout, tracker.confirmed, tracker.expected
                    )))
                }
            };
            tracker.observe(event)?;
        }

        debug!(
            partition = batch.partition(),
            records = batch.len(),
            "batch confirmed by mqtt broker"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn close(&self) {
        if let Err(e) = self.session.disconnect().await {
            debug!("mqtt disconnect failed: {}", e);
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::Map;

    use super::*;

    fn record(key: Option<&str>) -> Record {
        Record::new(7, 0, key.map(str::to_owned), Map::new(), Utc::now())
    }

    #[test]
    fn topics_use_key_or_partition() {
        assert_eq!(
            topic_for("plant/telemetry", &record(Some("inverter-1"))),
            "plant/telemetry/inverter-1"
        );
        assert_eq!(topic_for("plant", &record(None)), "plant/7");
        assert_eq!(topic_for("plant", &record(Some("/"))), "plant/7");
        assert_eq!(topic_for("plant", &record(Some("a/+/#"))), "plant/a/_/_");
    }

    #[test]
    fn qos1_waits_for_pubacks() {
        let mut tracker = AckTracker::new(MqttQos::AtLeastOnce, 2);

        tracker.observe(LinkEvent::Written(1)).unwrap();
        tracker.observe(LinkEvent::Written(2)).unwrap();
        assert!(!tracker.is_complete());

        // Ack for a packet of an earlier, abandoned batch
        tracker.observe(LinkEvent::Acknowledged(9)).unwrap();
        tracker.observe(LinkEvent::Acknowledged(1)).unwrap();
        assert!(!tracker.is_complete());

        tracker.observe(LinkEvent::Acknowledged(2)).unwrap();
        assert!(tracker.is_complete());
    }

    #[test]
    fn qos2_waits_for_pubcomp() {
        let mut tracker = AckTracker::new(MqttQos::ExactlyOnce, 1);

        tracker.observe(LinkEvent::Written(5)).unwrap();
        tracker.observe(LinkEvent::Acknowledged(5)).unwrap();
        assert!(!tracker.is_complete());

        tracker.observe(LinkEvent::Completed(5)).unwrap();
        assert!(tracker.is_complete());
    }

    #[test]
    fn qos0_counts_writes() {
        let mut tracker = AckTracker::new(MqttQos::AtMostOnce, 2);

        tracker.observe(LinkEvent::Written(0)).unwrap();
        tracker.observe(LinkEvent::Written(0)).unwrap();
        assert!(tracker.is_complete());
    }

    #[test]
    fn connection_problems_are_classified() {
        let mut tracker = AckTracker::new(MqttQos::AtLeastOnce, 1);

        let lost = tracker
            .observe(LinkEvent::Disconnected("reset".to_owned()))
            .unwrap_err();
        assert!(lost.is_transient());

        let unavailable = tracker
            .observe(LinkEvent::Refused {
                auth: false,
                reason: "ServiceUnavailable".to_owned(),
            })
            .unwrap_err();
        assert!(unavailable.is_transient());

        let rejected = tracker
            .observe(LinkEvent::Refused {
                auth: true,
                reason: "BadUserNamePassword".to_owned(),
            })
            .unwrap_err();
        assert!(!rejected.is_transient());
    }
}
