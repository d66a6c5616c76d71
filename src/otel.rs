// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module propagates trace context through message headers. Publishers inject
//! the current context before a message leaves; consumers extract it again and open
//! a consumer span around the handler, so one trace covers both services.

use crate::headers::{HeaderValue, Headers};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Name of the tracer used for consumer spans.
pub(crate) const TRACER_NAME: &str = "amqp consumer";

/// Adapts message headers to the OpenTelemetry `Injector` and `Extractor` traits.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

/// Read-only view used on the consuming side.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Headers,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes `ctx` into `headers` using the globally installed propagator.
pub(crate) fn inject(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(headers))
    });
}

/// Reads the trace context carried by `headers`.
pub(crate) fn extract(headers: &Headers) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor { headers }))
}

/// Creates a consumer span for a delivery, parented on the context found in its headers.
///
/// Returns the extracted context alongside the span.
pub(crate) fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = extract(headers);

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Headers::new();
        HeaderPropagator::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(headers["traceparent"], HeaderValue::from("00-abc"));
    }

    #[test]
    fn extractor_only_reads_string_values() {
        let headers = Headers::from([
            ("traceparent".to_owned(), HeaderValue::from("00-abc")),
            ("retryCount".to_owned(), HeaderValue::Int(1)),
        ]);
        let extractor = HeaderExtractor { headers: &headers };

        assert_eq!(extractor.get("traceparent"), Some("00-abc"));
        assert_eq!(extractor.get("retryCount"), None);
        assert_eq!(extractor.keys().len(), 2);
    }
}
