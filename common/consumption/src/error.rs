use rdkafka::error::KafkaError;
use thiserror::Error;

/// Problems the caller must fix before building or running an engine again.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("subscription must name at least one topic")]
    EmptySubscription,
    #[error("subscription contains a blank topic name")]
    BlankTopic,
    #[error("invalid broker client: {0}")]
    InvalidClient(String),
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("engine has stopped and cannot be restarted")]
    Stopped,
}

/// Failures reported by a broker client. None of these are retried by the engine.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("subscription rejected: {0}")]
    Subscription(String),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// Everything `ConsumptionEngine::run` can return besides a clean shutdown.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("record handler failed on {topic}:{partition} offset {offset}")]
    Handler {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl EngineError {
    pub(crate) fn handler(record: &crate::types::Record, error: anyhow::Error) -> Self {
        EngineError::Handler {
            topic: record.topic().to_string(),
            partition: record.partition_number(),
            offset: record.offset(),
            source: error.into(),
        }
    }

    pub fn is_handler_error(&self) -> bool {
        matches!(self, EngineError::Handler { .. })
    }
}
