use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::error::{BrokerError, ConfigError, EngineError};
use crate::handler::RecordHandler;
use crate::metrics_consts::{
    BROKER_ERRORS, HANDLER_ERRORS, POLLS, POLLS_INTERRUPTED, POLL_BATCH_SIZE, RECORDS_DISPATCHED,
};
use crate::rebalance::{RebalanceListener, RebalanceObserver};
use crate::state::{EngineState, StateCell};
use crate::types::{GroupIdentity, Partition, Record, Subscription};

/// What a single poll ended with.
enum PollOutcome {
    Records(Vec<Record>),
    /// Shutdown was requested while waiting; the pending poll was abandoned.
    ConsumptionInterrupted,
}

/// Runs a subscription against a broker client: polls, hands every record to
/// the record handler, and stops cleanly when asked to.
///
/// `run` is meant to occupy its own task. `shutdown` (or a [`ShutdownHandle`])
/// can be called from anywhere, any number of times.
///
/// ```text
/// Created ──run()──► Running ──shutdown()/error──► ShuttingDown ──client closed──► Stopped
/// ```
pub struct ConsumptionEngine<C: BrokerClient> {
    subscription: Subscription,
    identity: GroupIdentity,

    // taken by `run`, so only one loop can ever own the client
    client: Mutex<Option<C>>,

    handler: Arc<dyn RecordHandler>,
    observer: Option<Arc<dyn RebalanceObserver>>,

    // partitions currently owned, maintained by the rebalance listener
    owned: Arc<Mutex<BTreeSet<Partition>>>,

    poll_timeout: Option<Duration>,
    state: StateCell,
    shutdown: CancellationToken,
}

impl<C: BrokerClient> ConsumptionEngine<C> {
    pub fn new(
        subscription: Subscription,
        client: C,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<Self, ConfigError> {
        if subscription.is_empty() {
            return Err(ConfigError::EmptySubscription);
        }
        if subscription
            .topics()
            .iter()
            .any(|topic| topic.trim().is_empty())
        {
            return Err(ConfigError::BlankTopic);
        }

        let identity = client.group_identity();
        if identity.group_id.trim().is_empty() {
            return Err(ConfigError::InvalidClient(
                "broker client has no consumer group id".to_string(),
            ));
        }

        Ok(Self {
            subscription,
            identity,
            client: Mutex::new(Some(client)),
            handler,
            observer: None,
            owned: Arc::new(Mutex::new(BTreeSet::new())),
            poll_timeout: None,
            state: StateCell::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_rebalance_observer(mut self, observer: Arc<dyn RebalanceObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Bound each poll. An expired poll returns no records and the loop polls again.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn group_identity(&self) -> &GroupIdentity {
        &self.identity
    }

    /// Partitions the broker currently has assigned to this engine.
    pub fn assignment(&self) -> Vec<Partition> {
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Ask the loop to stop. Unblocks the current or next poll; a record that
    /// is already being handled finishes first. Safe before `run`, after it
    /// returned, and when called repeatedly or concurrently.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(
                group_id = %self.identity.group_id,
                "Shutdown requested for consumption engine"
            );
        }
        self.shutdown.cancel();
    }

    /// Consume until shutdown is requested or something fails.
    ///
    /// Returns `Ok(())` after a requested shutdown. Handler and broker errors
    /// are returned as they happened, without retry. The client is closed on
    /// every path out of here. An engine runs at most once; calling `run`
    /// again returns a `ConfigError`.
    pub async fn run(&self) -> Result<(), EngineError> {
        let client = self.take_client()?;
        let mut lease = ClientLease {
            client,
            state: &self.state,
        };

        let result = self.consume(&mut lease.client).await;
        drop(lease);

        match &result {
            Ok(()) => info!(
                group_id = %self.identity.group_id,
                "Consumption engine stopped"
            ),
            Err(e) => error!(
                group_id = %self.identity.group_id,
                error = ?e,
                "Consumption engine stopped with error"
            ),
        }

        result
    }

    fn take_client(&self) -> Result<C, ConfigError> {
        let mut slot = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            Some(client) => Ok(client),
            None if self.state.get() >= EngineState::ShuttingDown => Err(ConfigError::Stopped),
            None => Err(ConfigError::AlreadyRunning),
        }
    }

    async fn consume(&self, client: &mut C) -> Result<(), EngineError> {
        let listener = RebalanceListener::with_owned(
            self.identity.clone(),
            self.observer.clone(),
            self.owned.clone(),
        );
        client.subscribe(&self.subscription, listener)?;

        self.state.advance(EngineState::Running);
        info!(
            topics = ?self.subscription.topics(),
            group_id = %self.identity.group_id,
            member_id = %self.identity.member_id_or_unknown(),
            "Starting consumption"
        );

        loop {
            match self.poll_or_interrupt(client).await {
                Ok(PollOutcome::ConsumptionInterrupted) => {
                    info!("Shutdown signal received, leaving consumption loop");
                    metrics::counter!(POLLS_INTERRUPTED).increment(1);
                    self.state.advance(EngineState::ShuttingDown);
                    return Ok(());
                }
                Ok(PollOutcome::Records(batch)) => self.dispatch(batch).await?,
                Err(e) => {
                    metrics::counter!(BROKER_ERRORS).increment(1);
                    return Err(e.into());
                }
            }
        }
    }

    async fn poll_or_interrupt(&self, client: &mut C) -> Result<PollOutcome, BrokerError> {
        tokio::select! {
            // checked first so a shutdown requested before `run` never polls
            biased;

            _ = self.shutdown.cancelled() => Ok(PollOutcome::ConsumptionInterrupted),

            polled = client.poll(self.poll_timeout) => polled.map(PollOutcome::Records),
        }
    }

    async fn dispatch(&self, batch: Vec<Record>) -> Result<(), EngineError> {
        if batch.is_empty() {
            metrics::counter!(POLLS, "status" => "empty").increment(1);
            debug!("Poll returned no records");
            return Ok(());
        }

        metrics::counter!(POLLS, "status" => "records").increment(1);
        metrics::histogram!(POLL_BATCH_SIZE).record(batch.len() as f64);
        debug!("Dispatching {} records", batch.len());

        for record in &batch {
            if let Err(e) = self.handler.handle(record).await {
                metrics::counter!(HANDLER_ERRORS).increment(1);
                return Err(EngineError::handler(record, e));
            }
            metrics::counter!(RECORDS_DISPATCHED).increment(1);
        }

        Ok(())
    }
}

/// Cloneable way to stop an engine from another task without sharing the engine itself.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Exclusive hold on the client for one run of the loop. Dropping it closes
/// the client exactly once, whichever way `run` exits (including panics and
/// the run future being dropped).
struct ClientLease<'a, C: BrokerClient> {
    client: C,
    state: &'a StateCell,
}

impl<C: BrokerClient> Drop for ClientLease<'_, C> {
    fn drop(&mut self) {
        self.state.advance(EngineState::ShuttingDown);
        if let Err(e) = self.client.close() {
            warn!(error = ?e, "Failed to close broker client cleanly");
        }
        self.state.advance(EngineState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ClientStats, RecordingHandler, ScriptedBrokerClient};

    fn engine_with(
        subscription: Subscription,
        client: ScriptedBrokerClient,
    ) -> Result<ConsumptionEngine<ScriptedBrokerClient>, ConfigError> {
        ConsumptionEngine::new(subscription, client, Arc::new(RecordingHandler::default()))
    }

    #[test]
    fn test_empty_subscription_is_rejected() {
        let (client, _stats) = ScriptedBrokerClient::new("group");
        let result = engine_with(Subscription::new(Vec::<String>::new()), client);
        assert!(matches!(result, Err(ConfigError::EmptySubscription)));
    }

    #[test]
    fn test_blank_topic_is_rejected() {
        let (client, _stats) = ScriptedBrokerClient::new("group");
        let result = engine_with(Subscription::new(["orders", "  "]), client);
        assert!(matches!(result, Err(ConfigError::BlankTopic)));
    }

    #[test]
    fn test_client_without_group_is_rejected() {
        let (client, _stats) = ScriptedBrokerClient::new("");
        let result = engine_with(Subscription::new(["orders"]), client);
        assert!(matches!(result, Err(ConfigError::InvalidClient(_))));
    }

    #[test]
    fn test_new_engine_is_created_and_exposes_identity() {
        let (client, _stats) = ScriptedBrokerClient::new("group");
        let engine = engine_with(Subscription::new(["orders"]), client).unwrap();

        assert_eq!(engine.state(), EngineState::Created);
        assert_eq!(engine.group_identity().group_id, "group");
        assert_eq!(engine.subscription().topic_refs(), vec!["orders"]);
        assert!(engine.assignment().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_before_run_never_polls() {
        let (client, stats) = ScriptedBrokerClient::new("group");
        let engine = engine_with(Subscription::new(["orders"]), client).unwrap();

        engine.shutdown();
        engine.run().await.unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(stats.polls_started(), 0);
        assert_eq!(stats.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_second_run_after_stop_is_config_error() {
        let (client, stats) = ScriptedBrokerClient::new("group");
        let engine = engine_with(Subscription::new(["orders"]), client).unwrap();

        engine.shutdown();
        engine.run().await.unwrap();

        let second = engine.run().await;
        assert!(matches!(
            second,
            Err(EngineError::Config(ConfigError::Stopped))
        ));
        assert_eq!(stats.close_calls(), 1);
        assert_eq!(stats.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected_while_running() {
        let (client, stats) = ScriptedBrokerClient::new("group");
        let engine = Arc::new(engine_with(Subscription::new(["orders"]), client).unwrap());

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        stats.wait_until_parked().await;

        let second = engine.run().await;
        assert!(matches!(
            second,
            Err(EngineError::Config(ConfigError::AlreadyRunning))
        ));
        assert_eq!(engine.state(), EngineState::Running);

        engine.shutdown();
        running.await.unwrap().unwrap();
        assert_eq!(stats.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_failure_closes_client_and_stops() {
        let (client, stats) = ScriptedBrokerClient::new("group");
        let client =
            client.failing_subscribe(BrokerError::Subscription("unknown topic".to_string()));
        let engine = engine_with(Subscription::new(["orders"]), client).unwrap();

        let result = engine.run().await;

        assert!(matches!(
            result,
            Err(EngineError::Broker(BrokerError::Subscription(_)))
        ));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(stats.close_calls(), 1);
        assert_eq!(stats.polls_started(), 0);
    }

    #[tokio::test]
    async fn test_dropping_run_future_still_closes_client() {
        let (client, stats): (ScriptedBrokerClient, Arc<ClientStats>) =
            ScriptedBrokerClient::new("group");
        let engine = Arc::new(engine_with(Subscription::new(["orders"]), client).unwrap());

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        stats.wait_until_parked().await;

        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());

        assert_eq!(stats.close_calls(), 1);
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
