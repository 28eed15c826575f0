use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::types::Subscription;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "kafka-playground-consumer")]
    pub kafka_consumer_group: String,

    // comma separated
    #[envconfig(default = "application-messages")]
    pub kafka_consumer_topics: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // When disabled, acknowledged offsets are committed on every poll (async),
    // on revocation and on close (sync) instead of in the background.
    #[envconfig(default = "true")]
    pub kafka_consumer_auto_commit: bool,

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    // Enables static group membership and doubles as the reported member id
    pub kafka_client_id: Option<String>,

    #[envconfig(default = "500")]
    pub kafka_max_poll_records: usize,

    // How long a poll keeps collecting after its first record arrived
    #[envconfig(default = "50")]
    pub kafka_poll_linger_ms: u64,

    #[envconfig(default = "45000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "3000")]
    pub kafka_heartbeat_interval_ms: u32,

    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,
}

impl ConsumerConfig {
    pub fn subscription(&self) -> Subscription {
        Subscription::from_csv(&self.kafka_consumer_topics)
    }
}

/// Builds the rdkafka client configuration for a group consumer driven by a
/// `ConsumptionEngine`.
///
/// Offsets are never stored automatically: the broker client stores them once
/// the engine has dispatched the batch they belong to. Partition assignment is
/// always cooperative-sticky so a rebalance only moves the partitions that
/// have to move.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set("partition.assignment.strategy", "cooperative-sticky")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// All settings from env config in one go
    pub fn from_env_config(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Self {
        Self::new(&kafka.kafka_hosts, &consumer.kafka_consumer_group)
            .with_tls(kafka.kafka_tls)
            .with_offset_reset(&consumer.kafka_consumer_offset_reset)
            .with_auto_commit(
                consumer.kafka_consumer_auto_commit,
                consumer.kafka_consumer_auto_commit_interval_ms,
            )
            .with_session_timeout_ms(consumer.kafka_session_timeout_ms)
            .with_heartbeat_interval_ms(consumer.kafka_heartbeat_interval_ms)
            .with_max_poll_interval_ms(consumer.kafka_max_poll_interval_ms)
            .with_static_membership(consumer.kafka_client_id.as_deref())
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_auto_commit(mut self, enabled: bool, interval_ms: u32) -> Self {
        self.config
            .set("enable.auto.commit", enabled.to_string())
            .set("auto.commit.interval.ms", interval_ms.to_string());
        self
    }

    /// Set session timeout: how long broker waits for heartbeats before declaring consumer dead.
    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    /// Should be ~1/3 of session.timeout.ms
    pub fn with_heartbeat_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("heartbeat.interval.ms", ms.to_string());
        self
    }

    /// Set maximum time between poll() calls before consumer leaves group.
    /// A record handler that runs longer than this gets the member kicked out.
    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// With a client id, also enables static membership so a restarting
    /// member gets its partitions back without a rebalance.
    pub fn with_static_membership(mut self, client_id: Option<&str>) -> Self {
        if let Some(found_client_id) = client_id {
            self.config.set("client.id", found_client_id);
            self.config.set("group.instance.id", found_client_id);
        }
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_config() -> ConsumerConfig {
        ConsumerConfig {
            kafka_consumer_group: "playground".to_string(),
            kafka_consumer_topics: "orders".to_string(),
            kafka_consumer_offset_reset: "latest".to_string(),
            kafka_consumer_auto_commit: false,
            kafka_consumer_auto_commit_interval_ms: 1000,
            kafka_client_id: Some("consumer-0".to_string()),
            kafka_max_poll_records: 10,
            kafka_poll_linger_ms: 5,
            kafka_session_timeout_ms: 30000,
            kafka_heartbeat_interval_ms: 10000,
            kafka_max_poll_interval_ms: 60000,
        }
    }

    #[test]
    fn test_builder_defaults() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group").build();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("group"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(
            config.get("partition.assignment.strategy"),
            Some("cooperative-sticky")
        );
        assert_eq!(config.get("security.protocol"), None);
        assert_eq!(config.get("group.instance.id"), None);
    }

    #[test]
    fn test_builder_from_env_config() {
        let kafka = KafkaConfig {
            kafka_hosts: "kafka:9093".to_string(),
            kafka_tls: true,
        };

        let config = ConsumerConfigBuilder::from_env_config(&kafka, &consumer_config()).build();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9093"));
        assert_eq!(config.get("group.id"), Some("playground"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.commit.interval.ms"), Some("1000"));
        assert_eq!(config.get("session.timeout.ms"), Some("30000"));
        assert_eq!(config.get("heartbeat.interval.ms"), Some("10000"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("60000"));
        assert_eq!(config.get("client.id"), Some("consumer-0"));
        assert_eq!(config.get("group.instance.id"), Some("consumer-0"));
    }

    #[test]
    fn test_subscription_from_topic_list() {
        let mut config = consumer_config();
        config.kafka_consumer_topics = "orders, payments,orders".to_string();

        assert_eq!(
            config.subscription().topic_refs(),
            vec!["orders", "payments"]
        );
    }

    #[test]
    fn test_custom_setting_overrides_default() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group")
            .set("socket.timeout.ms", "2500")
            .build();

        assert_eq!(config.get("socket.timeout.ms"), Some("2500"));
    }
}
