use anyhow::Result;
use async_trait::async_trait;

use crate::types::Record;

/// Business logic invoked once per delivered record.
///
/// The engine awaits each call before dispatching the next record, so an
/// implementation sees records in delivery order and never concurrently.
/// Returning an error stops the engine: the error is handed back to the caller
/// of `run`, and the remaining records of the batch are not dispatched.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record) -> Result<()>;
}
