use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time;

use common_kafka::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use sqlx::postgres::PgConnectOptions;

use crate::accumulator::BatchSettings;
use crate::error::ConfigError;
use crate::record::RecordDecoder;
use crate::retry::RetryPolicy;
use crate::schema::{quote_ident, SchemaPolicy, UnknownFieldPolicy, MAX_IDENTIFIER_LEN};
use crate::secrets::{self, Secret};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "1000")]
    pub batch_size: NonZeroUsize,

    // Whole seconds, as the platform's sink templates express it
    #[envconfig(default = "1")]
    pub batch_timeout: EnvSecsDuration,

    #[envconfig(default = "timescaledb")]
    pub sink_backend: BackendKind,

    #[envconfig(default = "true")]
    pub schema_auto_update: bool,

    #[envconfig(default = "fail")]
    pub schema_unknown_fields: UnknownFieldPolicy,

    #[envconfig(default = "false")]
    pub unwrap_envelope: bool,

    // Payload field holding a nanosecond epoch, converted on decode
    pub payload_timestamp_field: Option<String>,

    #[envconfig(default = "1000")]
    pub partition_channel_capacity: NonZeroUsize,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(nested = true)]
    pub timescale: TimescaleConfig,

    #[envconfig(nested = true)]
    pub mqtt: MqttConfig,

    #[envconfig(default = "text")]
    pub log_format: LogFormat,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks everything that can be checked without talking to Kafka or the
    /// destination, and resolves secrets. Failing here means the process never
    /// starts consuming.
    pub fn validate(&self) -> Result<SinkSettings, ConfigError> {
        require("CONSUMER_GROUP_NAME", &self.consumer.consumer_group)?;
        require("input", &self.consumer.topic)?;
        match self.consumer.kafka_consumer_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => {
                return Err(ConfigError::invalid(
                    "KAFKA_CONSUMER_OFFSET_RESET",
                    format!("{other:?} is neither earliest nor latest"),
                ))
            }
        }

        let backend = match self.sink_backend {
            BackendKind::Timescale => BackendSettings::Timescale(self.timescale.validate()?),
            BackendKind::Mqtt => {
                BackendSettings::Mqtt(self.mqtt.validate(&self.consumer.consumer_group)?)
            }
        };

        Ok(SinkSettings {
            batch: BatchSettings {
                max_size: self.batch_size.get(),
                timeout: self.batch_timeout.0,
            },
            schema: SchemaPolicy {
                auto_update: self.schema_auto_update,
                unknown_fields: self.schema_unknown_fields,
            },
            retry: self.retry_policy.validate()?,
            unwrap_envelope: self.unwrap_envelope,
            payload_timestamp_field: self
                .payload_timestamp_field
                .as_deref()
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .map(str::to_owned),
            channel_capacity: self.partition_channel_capacity.get(),
            backend,
        })
    }
}

/// The validated, immutable settings everything downstream of startup runs on.
#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub batch: BatchSettings,
    pub schema: SchemaPolicy,
    pub retry: RetryPolicy,
    pub unwrap_envelope: bool,
    pub payload_timestamp_field: Option<String>,
    pub channel_capacity: usize,
    pub backend: BackendSettings,
}

impl SinkSettings {
    pub fn decoder(&self) -> RecordDecoder {
        let decoder = RecordDecoder::new(self.unwrap_envelope);
        match &self.payload_timestamp_field {
            Some(field) => decoder.with_timestamp_field(field.as_str()),
            None => decoder,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BackendSettings {
    Timescale(TimescaleSettings),
    Mqtt(MqttSettings),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Timescale,
    Mqtt,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timescaledb" | "timescale" | "postgres" => Ok(BackendKind::Timescale),
            "mqtt" => Ok(BackendKind::Mqtt),
            other => Err(format!("unknown sink backend {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A strictly positive number of whole seconds.
#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(EnvSecsDuration(time::Duration::from_secs(secs))),
            _ => Err(ParseEnvSecsDurationError),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL_MS", default = "500")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL_MS", default = "30000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAX_RETRIES", default = "5")]
    pub max_retries: u32,
}

impl RetryPolicyConfig {
    fn validate(&self) -> Result<RetryPolicy, ConfigError> {
        if self.backoff_coefficient == 0 {
            return Err(ConfigError::invalid(
                "RETRY_BACKOFF_COEFFICIENT",
                "must be at least 1",
            ));
        }
        if self.maximum_interval.0 < self.initial_interval.0 {
            return Err(ConfigError::invalid(
                "RETRY_MAXIMUM_INTERVAL_MS",
                "must not be lower than RETRY_INITIAL_INTERVAL_MS",
            ));
        }

        Ok(RetryPolicy::new(
            self.backoff_coefficient,
            self.initial_interval.0,
            self.maximum_interval.0,
            self.max_retries,
        ))
    }
}

#[derive(Envconfig, Clone)]
pub struct TimescaleConfig {
    pub timescaledb_host: Option<String>,

    #[envconfig(default = "5432")]
    pub timescaledb_port: u16,

    #[envconfig(default = "postgres")]
    pub timescaledb_database: String,

    #[envconfig(default = "postgres")]
    pub timescaledb_user: String,

    pub timescaledb_password: Option<Secret>,

    pub timescaledb_password_file: Option<String>,

    pub timescaledb_table_name: Option<String>,

    #[envconfig(default = "public")]
    pub timescaledb_schema: String,

    #[envconfig(default = "10")]
    pub timescaledb_max_connections: u32,

    #[envconfig(default = "true")]
    pub timescaledb_create_hypertable: bool,
}

impl TimescaleConfig {
    fn validate(&self) -> Result<TimescaleSettings, ConfigError> {
        let host = self
            .timescaledb_host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::Missing("TIMESCALEDB_HOST"))?;
        let table = self
            .timescaledb_table_name
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("TIMESCALEDB_TABLE_NAME"))?;
        check_identifier("TIMESCALEDB_TABLE_NAME", &table)?;
        check_identifier("TIMESCALEDB_SCHEMA", &self.timescaledb_schema)?;
        require("TIMESCALEDB_DATABASE", &self.timescaledb_database)?;
        require("TIMESCALEDB_USER", &self.timescaledb_user)?;
        if self.timescaledb_max_connections == 0 {
            return Err(ConfigError::invalid(
                "TIMESCALEDB_MAX_CONNECTIONS",
                "must be at least 1",
            ));
        }

        let password = secrets::resolve(
            "TIMESCALEDB_PASSWORD",
            self.timescaledb_password.as_ref(),
            self.timescaledb_password_file.as_deref(),
        )?
        .ok_or(ConfigError::Missing("TIMESCALEDB_PASSWORD"))?;

        Ok(TimescaleSettings {
            host,
            port: self.timescaledb_port,
            database: self.timescaledb_database.clone(),
            user: self.timescaledb_user.clone(),
            password,
            schema: self.timescaledb_schema.clone(),
            table,
            max_connections: self.timescaledb_max_connections,
            create_hypertable: self.timescaledb_create_hypertable,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TimescaleSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Secret,
    pub schema: String,
    pub table: String,
    pub max_connections: u32,
    pub create_hypertable: bool,
}

impl TimescaleSettings {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(self.password.expose())
            .application_name("timescale-sink")
    }

    /// The destination table as a quoted, schema qualified SQL name.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

#[derive(Envconfig, Clone)]
pub struct MqttConfig {
    #[envconfig(from = "mqtt_server")]
    pub server: Option<String>,

    #[envconfig(from = "mqtt_port", default = "1883")]
    pub port: u16,

    #[envconfig(from = "mqtt_version", default = "3.1.1")]
    pub version: MqttVersion,

    #[envconfig(from = "mqtt_username")]
    pub username: Option<String>,

    #[envconfig(from = "mqtt_password")]
    pub password: Option<Secret>,

    #[envconfig(from = "MQTT_PASSWORD_FILE")]
    pub password_file: Option<String>,

    #[envconfig(from = "mqtt_topic_root")]
    pub topic_root: Option<String>,

    #[envconfig(from = "mqtt_qos", default = "1")]
    pub qos: u8,

    #[envconfig(from = "mqtt_retain", default = "false")]
    pub retain: bool,

    #[envconfig(from = "MQTT_CLIENT_ID")]
    pub client_id: Option<String>,

    #[envconfig(from = "MQTT_ACK_TIMEOUT_MS", default = "10000")]
    pub ack_timeout: EnvMsDuration,
}

impl MqttConfig {
    fn validate(&self, consumer_group: &str) -> Result<MqttSettings, ConfigError> {
        let host = self
            .server
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("mqtt_server"))?;

        let topic_root = self
            .topic_root
            .as_deref()
            .map(|root| root.trim_end_matches('/'))
            .filter(|root| !root.is_empty())
            .ok_or(ConfigError::Missing("mqtt_topic_root"))?
            .to_owned();
        if topic_root.contains(['+', '#']) {
            return Err(ConfigError::invalid(
                "mqtt_topic_root",
                "wildcards are not allowed in a publish topic",
            ));
        }

        let qos = MqttQos::try_from(self.qos)
            .map_err(|_| ConfigError::invalid("mqtt_qos", "must be 0, 1 or 2"))?;

        let username = self.username.clone().filter(|u| !u.is_empty());
        let password = secrets::resolve(
            "mqtt_password",
            self.password.as_ref(),
            self.password_file.as_deref(),
        )?;
        if password.is_some() && username.is_none() {
            return Err(ConfigError::invalid(
                "mqtt_password",
                "a password requires mqtt_username",
            ));
        }

        if self.ack_timeout.0.is_zero() {
            return Err(ConfigError::invalid(
                "MQTT_ACK_TIMEOUT_MS",
                "must be greater than zero",
            ));
        }

        // Brokers drop the older session when a client id connects twice, so
        // replicas of the same sink need distinct ids.
        let client_id = self
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}-{:08x}", consumer_group, rand::random::<u32>()));

        Ok(MqttSettings {
            host,
            port: self.port,
            version: self.version,
            username,
            password,
            topic_root,
            qos,
            retain: self.retain,
            client_id,
            ack_timeout: self.ack_timeout.0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub version: MqttVersion,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub topic_root: String,
    pub qos: MqttQos,
    pub retain: bool,
    pub client_id: String,
    pub ack_timeout: time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttVersion {
    V3_1,
    V3_1_1,
    V5,
}

impl FromStr for MqttVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "3.1" | "31" => Ok(MqttVersion::V3_1),
            "3.1.1" | "311" | "4" => Ok(MqttVersion::V3_1_1),
            "5" | "5.0" => Ok(MqttVersion::V5),
            other => Err(format!("unsupported mqtt version {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttQos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for MqttQos {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MqttQos::AtMostOnce),
            1 => Ok(MqttQos::AtLeastOnce),
            2 => Ok(MqttQos::ExactlyOnce),
            other => Err(other),
        }
    }
}

fn require(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(name));
    }
    Ok(())
}

fn check_identifier(name: &'static str, value: &str) -> Result<(), ConfigError> {
    require(name, value)?;
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ConfigError::invalid(
            name,
            format!("longer than {MAX_IDENTIFIER_LEN} bytes"),
        ));
    }
    if value.contains('\0') {
        return Err(ConfigError::invalid(name, "contains a NUL byte"));
    }
    Ok(())
}
