use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::error::BrokerError;
use crate::kafka::config::{ConsumerConfig, ConsumerConfigBuilder, KafkaConfig};
use crate::kafka::context::{EngineConsumerContext, ListenerSlot};
use crate::rebalance::RebalanceListener;
use crate::types::{GroupIdentity, Partition, Record, Subscription};

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

/// How a single `poll` assembles its batch.
#[derive(Clone, Debug)]
pub struct KafkaPollOptions {
    /// Upper bound on the records returned by one poll
    pub max_poll_records: usize,
    /// How long to keep collecting after the first record arrived
    pub linger: Duration,
}

impl Default for KafkaPollOptions {
    fn default() -> Self {
        Self {
            max_poll_records: 500,
            linger: Duration::from_millis(50),
        }
    }
}

impl From<&ConsumerConfig> for KafkaPollOptions {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            max_poll_records: config.kafka_max_poll_records.max(1),
            linger: Duration::from_millis(config.kafka_poll_linger_ms),
        }
    }
}

/// `BrokerClient` backed by an rdkafka `StreamConsumer` in a consumer group.
///
/// Offsets are stored only when the engine comes back for the next batch, so
/// a record is never committed before its handler returned. With auto-commit
/// disabled, stored offsets are also committed: asynchronously at every poll,
/// synchronously before a revocation and on close.
pub struct KafkaBrokerClient {
    consumer: StreamConsumer<EngineConsumerContext>,
    identity: GroupIdentity,
    listener: ListenerSlot,
    options: KafkaPollOptions,
    manual_commit: bool,

    // next offset to store per partition, from the last batch handed out
    unacked: HashMap<Partition, i64>,
    // error hit after a batch was already partially collected
    held_error: Option<BrokerError>,
    closed: bool,
}

impl KafkaBrokerClient {
    /// Create the consumer without touching the network.
    pub fn create(config: ClientConfig, options: KafkaPollOptions) -> Result<Self, BrokerError> {
        let group_id = config.get("group.id").unwrap_or_default().to_string();
        let member_id = config.get("client.id").map(str::to_string);
        let manual_commit = config.get("enable.auto.commit") == Some("false");

        let listener: ListenerSlot = Arc::new(Mutex::new(None));
        let context = EngineConsumerContext::new(listener.clone(), manual_commit);
        let consumer: StreamConsumer<EngineConsumerContext> =
            config.create_with_context(context)?;

        Ok(Self {
            consumer,
            identity: GroupIdentity::new(group_id, member_id),
            listener,
            options,
            manual_commit,
            unacked: HashMap::new(),
            held_error: None,
            closed: false,
        })
    }

    /// Create the consumer from env config and make sure the brokers answer.
    pub async fn connect(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
    ) -> Result<Self, BrokerError> {
        let config = ConsumerConfigBuilder::from_env_config(kafka, consumer).build();
        let client = Self::create(config, KafkaPollOptions::from(consumer))?;

        // ping the brokers
        let ping = client.consumer.fetch_metadata(None, METADATA_TIMEOUT);
        if let Err(e) = ping {
            return Err(BrokerError::Unavailable(format!(
                "could not fetch metadata from {}: {e}",
                kafka.kafka_hosts
            )));
        }

        info!(
            hosts = %kafka.kafka_hosts,
            group_id = %client.identity.group_id,
            "Connected to Kafka"
        );
        Ok(client)
    }

    /// Store the offsets of the batch handed out by the previous poll.
    fn acknowledge_previous_batch(&mut self) {
        if self.unacked.is_empty() {
            return;
        }

        let mut tpl = TopicPartitionList::new();
        for (partition, next_offset) in self.unacked.drain() {
            if let Err(e) = tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(next_offset),
            ) {
                warn!("Failed to build offset list for {:?}: {}", partition, e);
            }
        }

        // fails for partitions revoked in the meantime, their new owner re-reads them
        if let Err(e) = self.consumer.store_offsets(&tpl) {
            warn!("Failed to store offsets for {} partitions: {}", tpl.count(), e);
        }

        // async here, the sync commits on revoke and close settle anything still in flight
        if self.manual_commit {
            match self.consumer.commit_consumer_state(CommitMode::Async) {
                Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
                Err(e) => warn!("Failed to queue commit of acknowledged offsets: {}", e),
            }
        }
    }

    async fn next_record(&self) -> Result<Record, BrokerError> {
        loop {
            match self.consumer.recv().await {
                Ok(message) => return Ok(Record::from_message(&message)),
                Err(KafkaError::PartitionEOF(partition)) => {
                    debug!("Reached end of partition {}", partition);
                }
                Err(e) => return Err(classify(e)),
            }
        }
    }

    async fn collect_batch(&mut self, first: Record) -> Vec<Record> {
        let mut batch = vec![first];
        let deadline = Instant::now() + self.options.linger;

        while batch.len() < self.options.max_poll_records {
            let next = tokio::time::timeout_at(deadline, self.next_record()).await;
            match next {
                Ok(Ok(record)) => batch.push(record),
                Ok(Err(e)) => {
                    self.held_error = Some(e);
                    break;
                }
                Err(_elapsed) => break,
            }
        }

        batch
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    fn group_identity(&self) -> GroupIdentity {
        self.identity.clone()
    }

    fn subscribe(
        &mut self,
        subscription: &Subscription,
        listener: RebalanceListener,
    ) -> Result<(), BrokerError> {
        *self
            .listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(listener);

        self.consumer
            .subscribe(&subscription.topic_refs())
            .map_err(|e| BrokerError::Subscription(e.to_string()))
    }

    async fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Record>, BrokerError> {
        self.acknowledge_previous_batch();

        if let Some(error) = self.held_error.take() {
            return Err(error);
        }

        let first = match timeout {
            Some(timeout) => {
                let next = tokio::time::timeout(timeout, self.next_record()).await;
                match next {
                    Ok(record) => record?,
                    Err(_elapsed) => return Ok(Vec::new()),
                }
            }
            None => self.next_record().await?,
        };

        let batch = self.collect_batch(first).await;
        for record in &batch {
            self.unacked
                .insert(record.partition().clone(), record.offset() + 1);
        }

        Ok(batch)
    }

    fn commit(&mut self) -> Result<(), BrokerError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // nothing stored since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let committed = if self.manual_commit {
            self.commit()
        } else {
            Ok(())
        };

        // librdkafka commits stored offsets itself on unsubscribe when auto-commit is on
        self.consumer.unsubscribe();
        info!(group_id = %self.identity.group_id, "Kafka consumer closed");

        committed
    }
}

fn classify(error: KafkaError) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::AllBrokersDown) | Some(RDKafkaErrorCode::BrokerTransportFailure) => {
            BrokerError::Unavailable(error.to_string())
        }
        _ => BrokerError::Kafka(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_config(auto_commit: bool, client_id: Option<&str>) -> ConsumerConfig {
        ConsumerConfig {
            kafka_consumer_group: "playground".to_string(),
            kafka_consumer_topics: "orders".to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_consumer_auto_commit: auto_commit,
            kafka_consumer_auto_commit_interval_ms: 5000,
            kafka_client_id: client_id.map(str::to_string),
            kafka_max_poll_records: 0,
            kafka_poll_linger_ms: 20,
            kafka_session_timeout_ms: 45000,
            kafka_heartbeat_interval_ms: 3000,
            kafka_max_poll_interval_ms: 300000,
        }
    }

    fn client_config(auto_commit: bool, client_id: Option<&str>) -> ClientConfig {
        let kafka = KafkaConfig {
            kafka_hosts: "localhost:1".to_string(),
            kafka_tls: false,
        };
        ConsumerConfigBuilder::from_env_config(&kafka, &consumer_config(auto_commit, client_id))
            .build()
    }

    #[tokio::test]
    async fn test_identity_comes_from_group_and_client_id() {
        let client = KafkaBrokerClient::create(
            client_config(true, Some("consumer-0")),
            KafkaPollOptions::default(),
        )
        .unwrap();

        let identity = client.group_identity();
        assert_eq!(identity.group_id, "playground");
        assert_eq!(identity.member_id.as_deref(), Some("consumer-0"));
        assert!(!client.manual_commit);
    }

    #[tokio::test]
    async fn test_manual_commit_follows_auto_commit_setting() {
        let client =
            KafkaBrokerClient::create(client_config(false, None), KafkaPollOptions::default())
                .unwrap();

        assert!(client.manual_commit);
        assert_eq!(client.group_identity().member_id, None);
    }

    #[test]
    fn test_poll_options_never_allow_empty_batches() {
        let options = KafkaPollOptions::from(&consumer_config(true, None));

        assert_eq!(options.max_poll_records, 1);
        assert_eq!(options.linger, Duration::from_millis(20));
    }

    #[test]
    fn test_transport_failures_are_unavailable() {
        let down = classify(KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown,
        ));
        assert!(matches!(down, BrokerError::Unavailable(_)));

        let other = classify(KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
        assert!(matches!(other, BrokerError::Kafka(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut client =
            KafkaBrokerClient::create(client_config(true, None), KafkaPollOptions::default())
                .unwrap();

        client.close().unwrap();
        client.close().unwrap();
        assert!(client.closed);
    }
}
