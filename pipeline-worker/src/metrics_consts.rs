/// Counter for messages taken from the source.
pub const MESSAGES_RECEIVED: &str = "pipeline_messages_received_total";

/// Gauge for the share of concurrency permits in use.
pub const ENGINE_SATURATION: &str = "pipeline_engine_saturation_percent";

/// Counter for fatal engine errors, labelled by reason kind.
pub const ENGINE_FATAL: &str = "pipeline_engine_fatal_total";

/// Counter for messages dropped by a mapping on request.
pub const MAPPING_DELETED: &str = "pipeline_mapping_deleted_total";

/// Counter for dedupe lookups, labelled by result (new/duplicate/error).
pub const DEDUPE_RESULT: &str = "pipeline_dedupe_result_total";

/// Counter for batch flushes, labelled by trigger (count/period/shutdown).
pub const BATCH_FLUSHED: &str = "pipeline_batches_flushed_total";

/// Histogram for the number of messages per flushed batch.
pub const BATCH_SIZE: &str = "pipeline_batch_size_messages";

/// Histogram for time spent waiting on the token bucket.
pub const RATE_LIMIT_WAIT: &str = "pipeline_rate_limit_wait_seconds";

/// Counter for messages that never got a token in time.
pub const RATE_LIMIT_EXCEEDED: &str = "pipeline_rate_limit_exceeded_total";

/// Counter for delivery attempts, labelled by output and status.
pub const BROKER_ATTEMPTS: &str = "pipeline_broker_attempts_total";

/// Counter for deliveries that met their quorum with some outputs failing.
pub const BROKER_PARTIAL: &str = "pipeline_broker_partial_deliveries_total";

/// Histogram for end-to-end delivery time across all outputs of a broker.
pub const BROKER_DURATION: &str = "pipeline_broker_delivery_duration_seconds";

/// Counter for envelopes diverted to an error route, labelled by kind and route.
pub const ERRORS_DIVERTED: &str = "pipeline_errors_diverted_total";
