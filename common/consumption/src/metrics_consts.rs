// ==== Consumption loop metrics ====
/// Counter for records handed to the record handler
pub const RECORDS_DISPATCHED: &str = "consumption_records_dispatched_total";

/// Counter for record handler failures (each one ends the loop)
pub const HANDLER_ERRORS: &str = "consumption_handler_errors_total";

/// Counter for completed polls, labelled by whether they returned records
pub const POLLS: &str = "consumption_polls_total";

/// Histogram for the number of records returned by a single poll
pub const POLL_BATCH_SIZE: &str = "consumption_poll_batch_size";

/// Counter for polls abandoned because shutdown was requested
pub const POLLS_INTERRUPTED: &str = "consumption_polls_interrupted_total";

/// Counter for broker errors that ended the loop
pub const BROKER_ERRORS: &str = "consumption_broker_errors_total";

/// Gauge for the engine state (0 created, 1 running, 2 shutting down, 3 stopped)
pub const ENGINE_STATE: &str = "consumption_engine_state";

// ==== Rebalance metrics ====
/// Counter for rebalance callbacks, labelled by event type
pub const REBALANCE_EVENTS: &str = "consumption_rebalance_events_total";

/// Counter for empty rebalance callbacks (cooperative-sticky no-ops)
pub const REBALANCE_EMPTY_SKIPPED: &str = "consumption_rebalance_empty_skipped_total";

/// Gauge for partitions currently assigned to this engine
pub const ASSIGNED_PARTITIONS: &str = "consumption_assigned_partitions";
