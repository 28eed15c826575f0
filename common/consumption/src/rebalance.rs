use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::metrics_consts::{ASSIGNED_PARTITIONS, REBALANCE_EMPTY_SKIPPED, REBALANCE_EVENTS};
use crate::types::{GroupIdentity, Partition, PartitionAssignment};

/// Optional collaborator told about partition ownership changes.
///
/// Both methods are called synchronously from within the broker client's
/// rebalance callback, before the rebalance completes. Keep them fast: the
/// consumer cannot make progress until they return.
pub trait RebalanceObserver: Send + Sync {
    /// Called before the partitions are taken away from this member.
    fn on_partitions_revoked(&self, _revoked: &PartitionAssignment) {}

    /// Called once the partitions belong to this member, before any of their
    /// records are delivered.
    fn on_partitions_assigned(&self, _assigned: &PartitionAssignment) {}
}

/// The engine's end of a rebalance: handed to `BrokerClient::subscribe` so the
/// client can report revocations and assignments as they happen.
///
/// Keeps the set of partitions currently owned (cooperative rebalancing only
/// ever adds or removes deltas) and forwards each non-empty event to the
/// observer, if there is one.
#[derive(Clone)]
pub struct RebalanceListener {
    member: GroupIdentity,
    observer: Option<Arc<dyn RebalanceObserver>>,
    owned: Arc<Mutex<BTreeSet<Partition>>>,
}

impl RebalanceListener {
    pub fn new(member: GroupIdentity, observer: Option<Arc<dyn RebalanceObserver>>) -> Self {
        Self {
            member,
            observer,
            owned: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub(crate) fn with_owned(
        member: GroupIdentity,
        observer: Option<Arc<dyn RebalanceObserver>>,
        owned: Arc<Mutex<BTreeSet<Partition>>>,
    ) -> Self {
        Self {
            member,
            observer,
            owned,
        }
    }

    pub fn partitions_revoked(&self, partitions: Vec<Partition>) {
        if partitions.is_empty() {
            debug!("Skipping empty revoke rebalance (cooperative-sticky no-op)");
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke").increment(1);
            return;
        }

        info!(
            group_id = %self.member.group_id,
            member_id = %self.member.member_id_or_unknown(),
            "Revoking {} partitions",
            partitions.len()
        );
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);

        let revoked = PartitionAssignment::new(self.member.clone(), partitions);
        if let Some(observer) = &self.observer {
            observer.on_partitions_revoked(&revoked);
        }

        let mut owned = self.owned_partitions_guard();
        for partition in revoked.partitions() {
            owned.remove(partition);
        }
        metrics::gauge!(ASSIGNED_PARTITIONS).set(owned.len() as f64);
    }

    pub fn partitions_assigned(&self, partitions: Vec<Partition>) {
        if partitions.is_empty() {
            debug!("Skipping empty assign rebalance (cooperative-sticky no-op)");
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign").increment(1);
            return;
        }

        info!(
            group_id = %self.member.group_id,
            member_id = %self.member.member_id_or_unknown(),
            "Assigned {} partitions",
            partitions.len()
        );
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);

        let assigned = PartitionAssignment::new(self.member.clone(), partitions);
        {
            let mut owned = self.owned_partitions_guard();
            owned.extend(assigned.partitions().iter().cloned());
            metrics::gauge!(ASSIGNED_PARTITIONS).set(owned.len() as f64);
        }

        if let Some(observer) = &self.observer {
            observer.on_partitions_assigned(&assigned);
        }
    }

    /// Snapshot of the partitions this member currently owns, in order.
    pub fn owned_partitions(&self) -> Vec<Partition> {
        self.owned_partitions_guard().iter().cloned().collect()
    }

    fn owned_partitions_guard(&self) -> std::sync::MutexGuard<'_, BTreeSet<Partition>> {
        // a panicking observer must not wedge later rebalances
        self.owned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
