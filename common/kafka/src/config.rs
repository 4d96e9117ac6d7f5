use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "true")]
    pub kafka_verify_ssl_certificate: bool,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(from = "CONSUMER_GROUP_NAME")]
    pub consumer_group: String,

    // The platform injects the source topic under a lowercase name
    #[envconfig(from = "input")]
    pub topic: String,

    // We default to "earliest" for this, a sink that starts on "latest" silently skips
    // whatever was produced before its first deploy
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "45000")]
    pub kafka_session_timeout_ms: u32,
}

impl ConsumerConfig {
    /// Builds the librdkafka configuration for a group member that stores and
    /// commits offsets explicitly. Both automatic offset storage and automatic
    /// commits are disabled: offsets only move once a batch has been delivered.
    pub fn client_config(&self, common: &KafkaConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.kafka_consumer_offset_reset)
            .set(
                "session.timeout.ms",
                self.kafka_session_timeout_ms.to_string(),
            );

        if common.kafka_tls {
            client_config.set("security.protocol", "ssl").set(
                "enable.ssl.certificate.verification",
                common.kafka_verify_ssl_certificate.to_string(),
            );
        };

        client_config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn consumer_config_reads_platform_names() {
        let config = ConsumerConfig::init_from_hashmap(&env(&[
            ("CONSUMER_GROUP_NAME", "timescale-sink"),
            ("input", "solar-data"),
        ]))
        .unwrap();

        assert_eq!(config.consumer_group, "timescale-sink");
        assert_eq!(config.topic, "solar-data");
        assert_eq!(config.kafka_consumer_offset_reset, "earliest");
        assert_eq!(config.kafka_session_timeout_ms, 45000);
    }

    #[test]
    fn consumer_config_requires_group_and_topic() {
        assert!(ConsumerConfig::init_from_hashmap(&env(&[("input", "solar-data")])).is_err());
        assert!(
            ConsumerConfig::init_from_hashmap(&env(&[("CONSUMER_GROUP_NAME", "sink")])).is_err()
        );
    }

    #[test]
    fn client_config_disables_automatic_offsets() {
        let kafka = KafkaConfig::init_from_hashmap(&env(&[("KAFKA_HOSTS", "kafka:9092")])).unwrap();
        let consumer = ConsumerConfig::init_from_hashmap(&env(&[
            ("CONSUMER_GROUP_NAME", "sink"),
            ("input", "events"),
            ("KAFKA_CONSUMER_OFFSET_RESET", "latest"),
        ]))
        .unwrap();

        let client = consumer.client_config(&kafka);
        assert_eq!(client.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(client.get("group.id"), Some("sink"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("latest"));
        assert_eq!(client.get("security.protocol"), None);
    }

    #[test]
    fn client_config_enables_tls() {
        let kafka = KafkaConfig::init_from_hashmap(&env(&[
            ("KAFKA_TLS", "true"),
            ("KAFKA_VERIFY_SSL_CERTIFICATE", "false"),
        ]))
        .unwrap();
        let consumer = ConsumerConfig::init_from_hashmap(&env(&[
            ("CONSUMER_GROUP_NAME", "sink"),
            ("input", "events"),
        ]))
        .unwrap();

        let client = consumer.client_config(&kafka);
        assert_eq!(client.get("security.protocol"), Some("ssl"));
        assert_eq!(
            client.get("enable.ssl.certificate.verification"),
            Some("false")
        );
    }
}
