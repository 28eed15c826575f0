pub mod client;
pub mod config;
pub mod context;

pub use client::{KafkaBrokerClient, KafkaPollOptions};
pub use config::{ConsumerConfig, ConsumerConfigBuilder, KafkaConfig};
pub use context::EngineConsumerContext;
