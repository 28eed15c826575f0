use std::sync::{Arc, Mutex, PoisonError};

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, warn};

use crate::rebalance::RebalanceListener;
use crate::types::Partition;

/// Slot the broker client fills on `subscribe`; empty until then.
pub(crate) type ListenerSlot = Arc<Mutex<Option<RebalanceListener>>>;

/// rdkafka context that turns librdkafka rebalance callbacks into
/// `RebalanceListener` calls.
///
/// Revocations are reported from `pre_rebalance`, while the partitions are
/// still owned. Assignments are reported from `post_rebalance`, once the new
/// partitions are in place but before any of their records are fetched.
pub struct EngineConsumerContext {
    listener: ListenerSlot,
    manual_commit: bool,
}

impl EngineConsumerContext {
    pub(crate) fn new(listener: ListenerSlot, manual_commit: bool) -> Self {
        Self {
            listener,
            manual_commit,
        }
    }

    fn with_listener(&self, f: impl FnOnce(&RebalanceListener)) {
        let slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(listener) => f(listener),
            None => warn!("Rebalance event before subscribe, no listener installed"),
        }
    }

    fn to_partitions(partitions: &TopicPartitionList) -> Vec<Partition> {
        partitions
            .elements()
            .into_iter()
            .map(Partition::from)
            .collect()
    }
}

impl ClientContext for EngineConsumerContext {}

impl ConsumerContext for EngineConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        debug!("Pre-rebalance event: {:?}", rebalance);

        match rebalance {
            Rebalance::Revoke(partitions) => {
                // hand over whatever was acknowledged before the partitions move
                if self.manual_commit && partitions.count() > 0 {
                    match base_consumer.commit_consumer_state(CommitMode::Sync) {
                        Ok(()) => {}
                        Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
                        Err(e) => warn!("Failed to commit offsets before revoke: {}", e),
                    }
                }
                self.with_listener(|listener| {
                    listener.partitions_revoked(Self::to_partitions(partitions))
                });
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        debug!("Post-rebalance event: {:?}", rebalance);

        match rebalance {
            Rebalance::Assign(partitions) => {
                self.with_listener(|listener| {
                    listener.partitions_assigned(Self::to_partitions(partitions))
                });
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}
