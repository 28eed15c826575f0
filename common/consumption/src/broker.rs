use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::rebalance::RebalanceListener;
use crate::types::{GroupIdentity, Record, Subscription};

/// Connection to a partitioned log broker, driven by a single `ConsumptionEngine`.
///
/// The engine owns the client exclusively while it runs: it never calls `poll`
/// while another `poll` is outstanding, and it always calls `close` exactly once
/// when the loop ends.
///
/// There is no explicit wakeup call. The engine interrupts a blocked `poll` by
/// dropping its future, so `poll` must be cancel safe: records not yet
/// returned when the future is dropped must stay un-acknowledged.
#[async_trait]
pub trait BrokerClient: Send {
    /// Group and member this client consumes as.
    fn group_identity(&self) -> GroupIdentity;

    /// Join the group for the given topics. The listener must be in place
    /// before any partition can be assigned, so implementations install it
    /// before issuing the subscription.
    fn subscribe(
        &mut self,
        subscription: &Subscription,
        listener: RebalanceListener,
    ) -> Result<(), BrokerError>;

    /// Wait for the next batch of records. `None` waits until data arrives;
    /// with a timeout an empty batch is returned when it elapses.
    ///
    /// Calling `poll` acknowledges every record of the previous batch.
    async fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Record>, BrokerError>;

    /// Commit acknowledged offsets now.
    fn commit(&mut self) -> Result<(), BrokerError>;

    /// Leave the group and release the connection, committing pending offsets
    /// according to the client's own commit policy.
    fn close(&mut self) -> Result<(), BrokerError>;
}
