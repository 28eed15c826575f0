use std::collections::BTreeMap;
use std::sync::Mutex;

use common_consumption::{PartitionAssignment, RebalanceObserver};
use tracing::info;

const ASSIGNED_PARTITIONS_BY_TOPIC: &str = "consumer_loop_assigned_partitions";

/// Keeps a per-topic gauge of the partitions this member owns and logs each change.
#[derive(Default)]
pub struct AssignmentGaugeObserver {
    per_topic: Mutex<BTreeMap<String, usize>>,
}

impl AssignmentGaugeObserver {
    pub fn assigned_count(&self, topic: &str) -> usize {
        self.lock().get(topic).copied().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, usize>> {
        self.per_topic
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn apply(&self, change: &PartitionAssignment, added: bool) {
        let mut per_topic = self.lock();
        for partition in change.partitions() {
            let count = per_topic.entry(partition.topic().to_string()).or_default();
            *count = if added {
                *count + 1
            } else {
                count.saturating_sub(1)
            };
        }

        for (topic, count) in per_topic.iter() {
            metrics::gauge!(ASSIGNED_PARTITIONS_BY_TOPIC, "topic" => topic.clone())
                .set(*count as f64);
        }
    }
}

impl RebalanceObserver for AssignmentGaugeObserver {
    fn on_partitions_revoked(&self, revoked: &PartitionAssignment) {
        info!(
            member_id = %revoked.member().member_id_or_unknown(),
            partitions = ?revoked.partitions(),
            "partitions revoked"
        );
        self.apply(revoked, false);
    }

    fn on_partitions_assigned(&self, assigned: &PartitionAssignment) {
        info!(
            member_id = %assigned.member().member_id_or_unknown(),
            partitions = ?assigned.partitions(),
            "partitions assigned"
        );
        self.apply(assigned, true);
    }
}
