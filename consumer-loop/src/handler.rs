use anyhow::Result;
use async_trait::async_trait;
use common_consumption::{GroupIdentity, Record, RecordHandler};
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing::{debug, info, info_span, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

const MESSAGES_CONSUMED: &str = "consumer_loop_messages_consumed_total";

/// Record headers seen as a W3C trace context carrier.
struct RecordHeaders<'a>(&'a Record);

impl Extractor for RecordHeaders<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .header(key)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.headers().keys().map(String::as_str).collect()
    }
}

/// Logs every consumed record inside a span carrying its coordinates.
///
/// A `traceparent` header on the record makes the span a child of the
/// producer's trace. The configured trace header is recorded verbatim as
/// `trace.carrier` for vendors that do not speak W3C trace context.
pub struct TracingRecordHandler {
    identity: GroupIdentity,
    trace_header: String,
    propagator: TraceContextPropagator,
}

impl TracingRecordHandler {
    pub fn new(identity: GroupIdentity, trace_header: impl Into<String>) -> Self {
        Self {
            identity,
            trace_header: trace_header.into(),
            propagator: TraceContextPropagator::new(),
        }
    }

    /// Trace context propagated by the producer, if the record has any.
    pub fn trace_carrier(&self, record: &Record) -> Option<String> {
        record
            .header(&self.trace_header)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    /// Upstream context extracted from the record headers. Invalid or missing
    /// headers give a context without a valid span.
    pub fn upstream_context(&self, record: &Record) -> Context {
        self.propagator.extract(&RecordHeaders(record))
    }

    pub fn record_span(&self, record: &Record, parent: &Context) -> Span {
        let carrier = self.trace_carrier(record);
        let span = info_span!(
            "consume_record",
            kafka.consumer.record.topic = record.topic(),
            kafka.consumer.record.partition = record.partition_number(),
            kafka.consumer.record.offset = record.offset(),
            kafka.consumer.record.timestamp = record.timestamp(),
            trace.carrier = carrier.as_deref(),
        );

        if parent.span().span_context().is_valid() {
            span.set_parent(parent.clone());
        }
        span
    }
}

#[async_trait]
impl RecordHandler for TracingRecordHandler {
    async fn handle(&self, record: &Record) -> Result<()> {
        let parent = self.upstream_context(record);
        let upstream = parent.span().span_context().clone();
        let span = self.record_span(record, &parent);

        span.in_scope(|| {
            let value = record
                .value()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();

            // unsampled upstream traces stay out of the info log
            if upstream.is_valid() && !upstream.is_sampled() {
                debug!(
                    member_id = %self.identity.member_id_or_unknown(),
                    group_id = %self.identity.group_id,
                    value = %value,
                    "consumed message"
                );
            } else {
                info!(
                    member_id = %self.identity.member_id_or_unknown(),
                    group_id = %self.identity.group_id,
                    value = %value,
                    "consumed message"
                );
            }
        });

        metrics::counter!(MESSAGES_CONSUMED, "topic" => record.topic().to_string()).increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{SpanId, TraceId, TracerProvider as _};
    use opentelemetry_sdk::trace::TracerProvider;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn handler() -> TracingRecordHandler {
        TracingRecordHandler::new(
            GroupIdentity::new("playground", Some("consumer-0".to_string())),
            "newrelic",
        )
    }

    #[test]
    fn test_trace_carrier_from_configured_header() {
        let record = Record::new("application-messages", 0, 4)
            .with_header("newrelic", b"{\"d\":{\"tr\":\"abc\"}}".to_vec())
            .with_header("traceparent", b"ignored".to_vec());

        assert_eq!(
            handler().trace_carrier(&record).as_deref(),
            Some("{\"d\":{\"tr\":\"abc\"}}")
        );
    }

    #[test]
    fn test_trace_carrier_missing() {
        let record = Record::new("application-messages", 0, 4);
        assert_eq!(handler().trace_carrier(&record), None);
    }

    #[test]
    fn test_upstream_context_from_traceparent() {
        let record = Record::new("application-messages", 0, 4)
            .with_header("traceparent", TRACEPARENT.as_bytes().to_vec());

        let cx = handler().upstream_context(&record);
        let upstream = cx.span().span_context().clone();

        assert!(upstream.is_valid());
        assert!(upstream.is_remote());
        assert!(upstream.is_sampled());
        assert_eq!(
            upstream.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
        assert_eq!(
            upstream.span_id(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap()
        );
    }

    #[test]
    fn test_upstream_context_ignores_malformed_header() {
        let record = Record::new("application-messages", 0, 4)
            .with_header("traceparent", b"not-a-trace".to_vec());

        let cx = handler().upstream_context(&record);

        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn test_record_span_is_child_of_upstream_trace() {
        let provider = TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("consumer-loop")));

        let record = Record::new("application-messages", 2, 11)
            .with_header("traceparent", TRACEPARENT.as_bytes().to_vec());
        let handler = handler();

        let consumed = tracing::subscriber::with_default(subscriber, || {
            let parent = handler.upstream_context(&record);
            let span = handler.record_span(&record, &parent);
            span.context().span().span_context().clone()
        });

        assert_eq!(
            consumed.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
        assert_ne!(
            consumed.span_id(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap()
        );
        assert!(!consumed.is_remote());
    }

    #[tokio::test]
    async fn test_handle_accepts_records_with_and_without_value() {
        let handler = handler();

        let with_value = Record::new("application-messages", 1, 7)
            .with_timestamp(1_700_000_000_000)
            .with_value(b"hello".to_vec());
        let tombstone = Record::new("application-messages", 1, 8);
        let traced = Record::new("application-messages", 1, 9)
            .with_header("traceparent", TRACEPARENT.as_bytes().to_vec());

        handler.handle(&with_value).await.unwrap();
        handler.handle(&tombstone).await.unwrap();
        handler.handle(&traced).await.unwrap();
    }
}
