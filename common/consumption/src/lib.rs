//! Partition-aware consumption loop over a group-managed log broker.
//!
//! A [`ConsumptionEngine`] subscribes a [`BrokerClient`] to a set of topics,
//! hands every polled record to a [`RecordHandler`] and reports partition
//! ownership changes to an optional [`RebalanceObserver`]. It runs until
//! `shutdown()` is called or something fails, and always closes the client.
//! The Kafka implementation of the client lives in [`kafka`].
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` (full chain on one line, `outer: middle: root cause`).
//! - **Structured field:** `error = ?e` (full chain with `Caused by:` sections).
//!
//! Avoid `{}` / `%e` (Display) for handler errors, they only show the top-level message.

pub mod broker;
pub mod engine;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod metrics_consts;
pub mod rebalance;
pub mod state;
pub mod test_utils;
pub mod types;

// Re-export commonly used types for convenience
pub use broker::BrokerClient;
pub use engine::{ConsumptionEngine, ShutdownHandle};
pub use error::{BrokerError, ConfigError, EngineError};
pub use handler::RecordHandler;
pub use rebalance::{RebalanceListener, RebalanceObserver};
pub use state::EngineState;
pub use types::{GroupIdentity, Partition, PartitionAssignment, Record, Subscription};
