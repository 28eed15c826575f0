use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::BrokerClient;
use crate::error::BrokerError;
use crate::handler::RecordHandler;
use crate::rebalance::{RebalanceListener, RebalanceObserver};
use crate::types::{GroupIdentity, Partition, PartitionAssignment, Record, Subscription};

/// One thing the scripted client does when polled.
pub enum ScriptStep {
    /// Return these records from the poll
    Batch(Vec<Record>),
    /// Report an assignment to the listener, then keep going
    Assign(Vec<Partition>),
    /// Report a revocation to the listener, then keep going
    Revoke(Vec<Partition>),
    /// Fail the poll
    Fail(BrokerError),
}

/// Shared view into what a `ScriptedBrokerClient` was asked to do.
#[derive(Default)]
pub struct ClientStats {
    subscribe_calls: AtomicUsize,
    polls_started: AtomicUsize,
    polls_in_flight: AtomicUsize,
    max_polls_in_flight: AtomicUsize,
    parked_polls: AtomicUsize,
    commit_calls: AtomicUsize,
    close_calls: AtomicUsize,
    subscribed_topics: Mutex<Vec<String>>,
    parked: Notify,
}

impl ClientStats {
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn polls_started(&self) -> usize {
        self.polls_started.load(Ordering::SeqCst)
    }

    pub fn max_polls_in_flight(&self) -> usize {
        self.max_polls_in_flight.load(Ordering::SeqCst)
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed_topics.lock().unwrap().clone()
    }

    /// Resolves once the client has run out of script and is blocking in `poll`.
    pub async fn wait_until_parked(&self) {
        loop {
            let notified = self.parked.notified();
            if self.parked_polls.load(Ordering::SeqCst) > 0 {
                return;
            }
            notified.await;
        }
    }
}

// decrements the in-flight count even when the poll future is dropped
struct InFlight<'a>(&'a ClientStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a ClientStats) -> Self {
        stats.polls_started.fetch_add(1, Ordering::SeqCst);
        let now = stats.polls_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_polls_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.polls_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory broker client that plays back a fixed script, then blocks in
/// `poll` forever (or returns empty batches when polled with a timeout).
pub struct ScriptedBrokerClient {
    identity: GroupIdentity,
    steps: VecDeque<ScriptStep>,
    listener: Option<RebalanceListener>,
    subscribe_error: Option<BrokerError>,
    stats: Arc<ClientStats>,
}

impl ScriptedBrokerClient {
    pub fn new(group_id: &str) -> (Self, Arc<ClientStats>) {
        let stats = Arc::new(ClientStats::default());
        let client = Self {
            identity: GroupIdentity::new(group_id, Some("member-1".to_string())),
            steps: VecDeque::new(),
            listener: None,
            subscribe_error: None,
            stats: stats.clone(),
        };
        (client, stats)
    }

    pub fn then(mut self, step: ScriptStep) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn then_batch(self, records: Vec<Record>) -> Self {
        self.then(ScriptStep::Batch(records))
    }

    pub fn failing_subscribe(mut self, error: BrokerError) -> Self {
        self.subscribe_error = Some(error);
        self
    }
}

#[async_trait]
impl BrokerClient for ScriptedBrokerClient {
    fn group_identity(&self) -> GroupIdentity {
        self.identity.clone()
    }

    fn subscribe(
        &mut self,
        subscription: &Subscription,
        listener: RebalanceListener,
    ) -> Result<(), BrokerError> {
        self.stats.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.listener = Some(listener);
        if let Some(error) = self.subscribe_error.take() {
            return Err(error);
        }
        *self.stats.subscribed_topics.lock().unwrap() = subscription.topics().to_vec();
        Ok(())
    }

    async fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Record>, BrokerError> {
        let _in_flight = InFlight::enter(&self.stats);

        while let Some(step) = self.steps.pop_front() {
            match step {
                ScriptStep::Batch(records) => return Ok(records),
                ScriptStep::Fail(error) => return Err(error),
                ScriptStep::Assign(partitions) => {
                    if let Some(listener) = &self.listener {
                        listener.partitions_assigned(partitions);
                    }
                }
                ScriptStep::Revoke(partitions) => {
                    if let Some(listener) = &self.listener {
                        listener.partitions_revoked(partitions);
                    }
                }
            }
        }

        match timeout {
            Some(timeout) => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
            None => {
                self.stats.parked_polls.fetch_add(1, Ordering::SeqCst);
                self.stats.parked.notify_waiters();
                std::future::pending().await
            }
        }
    }

    fn commit(&mut self) -> Result<(), BrokerError> {
        self.stats.commit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        self.stats.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records on one partition at the given offsets, valued `value-<offset>`.
pub fn records_at(topic: &str, partition: i32, offsets: &[i64]) -> Vec<Record> {
    offsets
        .iter()
        .map(|offset| {
            Record::new(topic, partition, *offset)
                .with_value(format!("value-{offset}").into_bytes())
        })
        .collect()
}

/// Handler that remembers every record it saw and can be told to fail on one offset.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<Record>>,
    fail_on_offset: Option<i64>,
}

impl RecordingHandler {
    pub fn failing_on(offset: i64) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_on_offset: Some(offset),
        }
    }

    pub fn seen(&self) -> Vec<Record> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_offsets(&self) -> Vec<i64> {
        self.seen().iter().map(Record::offset).collect()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, record: &Record) -> Result<()> {
        self.seen.lock().unwrap().push(record.clone());
        if self.fail_on_offset == Some(record.offset()) {
            return Err(anyhow!("refusing offset {}", record.offset()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    assigned: Mutex<Vec<PartitionAssignment>>,
    revoked: Mutex<Vec<PartitionAssignment>>,
}

impl RecordingObserver {
    pub fn assigned(&self) -> Vec<PartitionAssignment> {
        self.assigned.lock().unwrap().clone()
    }

    pub fn revoked(&self) -> Vec<PartitionAssignment> {
        self.revoked.lock().unwrap().clone()
    }
}

impl RebalanceObserver for RecordingObserver {
    fn on_partitions_revoked(&self, revoked: &PartitionAssignment) {
        self.revoked.lock().unwrap().push(revoked.clone());
    }

    fn on_partitions_assigned(&self, assigned: &PartitionAssignment) {
        self.assigned.lock().unwrap().push(assigned.clone());
    }
}
