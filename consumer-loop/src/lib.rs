//! Demo service: consumes the configured topics with a `ConsumptionEngine` and
//! logs every record with its trace context.

pub mod config;
pub mod handler;
pub mod observer;
pub mod serve;
