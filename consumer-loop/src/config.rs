use std::time::Duration;

use common_consumption::kafka::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    // Header carrying the distributed trace context of each record
    #[envconfig(default = "newrelic")]
    pub trace_header: String,

    // How long to wait for the engine to close the consumer after a signal
    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    #[envconfig(from = "LOG_FORMAT", default = "text")]
    pub log_format: String, // text, json

    // OTLP collector endpoint, spans are only exported when set
    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "consumer-loop")]
    pub otel_service_name: String,

    #[envconfig(default = "5")]
    pub otel_export_timeout_secs: u64,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:3310");
        assert_eq!(config.trace_header, "newrelic");
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert!(!config.json_logs());
        assert_eq!(config.kafka.kafka_hosts, "localhost:9092");
        assert_eq!(
            config.consumer.subscription().topic_refs(),
            vec!["application-messages"]
        );
        assert!(config.consumer.kafka_client_id.is_none());
        assert!(config.otel_url.is_none());
        assert_eq!(config.otel_sampling_rate, 1.0);
        assert_eq!(config.otel_service_name, "consumer-loop");
        assert_eq!(config.otel_export_timeout_secs, 5);
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("BIND_PORT".to_string(), "8080".to_string()),
            ("KAFKA_HOSTS".to_string(), "kafka:9092".to_string()),
            (
                "KAFKA_CONSUMER_TOPICS".to_string(),
                "orders,payments".to_string(),
            ),
            ("KAFKA_CLIENT_ID".to_string(), "consumer-0".to_string()),
            ("TRACE_HEADER".to_string(), "traceparent".to_string()),
            ("LOG_FORMAT".to_string(), "JSON".to_string()),
            (
                "OTEL_URL".to_string(),
                "http://otel-collector:4317".to_string(),
            ),
            ("OTEL_SAMPLING_RATE".to_string(), "0.25".to_string()),
        ]);

        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.kafka.kafka_hosts, "kafka:9092");
        assert_eq!(
            config.consumer.subscription().topic_refs(),
            vec!["orders", "payments"]
        );
        assert_eq!(config.consumer.kafka_client_id.as_deref(), Some("consumer-0"));
        assert_eq!(config.trace_header, "traceparent");
        assert!(config.json_logs());
        assert_eq!(
            config.otel_url.as_deref(),
            Some("http://otel-collector:4317")
        );
        assert_eq!(config.otel_sampling_rate, 0.25);
    }
}
