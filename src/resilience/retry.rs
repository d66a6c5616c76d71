// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Delayed re-publishing of failed deliveries.
//!
//! A failed delivery is published again with the same envelope id, an incremented
//! `retryCount` header and an `x-delay` header, then acked. Exchanges of kind
//! `x-delayed-message` hold the copy back for the `x-delay` milliseconds; other
//! exchanges route it immediately. Once `max_retries` is reached the delivery is
//! rejected without requeue, which dead-letters it.

use crate::{
    adapter::AmqpAdapter,
    consumer::Delivery,
    errors::AmqpError,
    headers::{self, HeaderValue, HEADER_DELAY, HEADER_RETRY_COUNT},
    publisher::PublishOptions,
    retry::RetryPolicy,
};
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff schedule of re-published deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl BackoffConfig {
    /// Delay applied to retry number `retry`, counted from 1.
    pub fn delay_for(&self, retry: u32) -> Duration {
        RetryPolicy::exponential(self.initial_delay, self.multiplier, self.max_delay)
            .delay_for(retry)
    }
}

/// Where retried deliveries are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTarget {
    exchange: String,
    routing_key: String,
}

impl RetryTarget {
    /// Straight to `queue` through the default exchange.
    pub fn queue(queue: &str) -> RetryTarget {
        RetryTarget {
            exchange: String::new(),
            routing_key: queue.to_owned(),
        }
    }

    pub fn exchange(exchange: &str, routing_key: &str) -> RetryTarget {
        RetryTarget {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Published again as retry number `retry`, delayed by `delay`.
    Retried { retry: u32, delay: Duration },
    /// Rejected without requeue after `retries` retries.
    Exhausted { retries: u32 },
}

/// Settles `delivery` by scheduling a retry, or dead-letters it once the retries
/// configured in `config` are used up.
pub async fn retry_with_backoff(
    adapter: &AmqpAdapter,
    delivery: &Delivery,
    target: &RetryTarget,
    config: &BackoffConfig,
) -> Result<RetryOutcome, AmqpError> {
    let retries = headers::retry_count(delivery.headers());
    if retries >= config.max_retries {
        warn!(
            queue = delivery.queue(),
            retries, "retries exhausted, sending msg to dlq"
        );
        delivery.reject(false).await?;
        return Ok(RetryOutcome::Exhausted { retries });
    }

    let retry = retries + 1;
    let delay = config.delay_for(retry);
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

    let mut envelope = delivery.envelope::<serde_json::Value>()?;
    envelope
        .headers
        .insert(HEADER_RETRY_COUNT.to_owned(), HeaderValue::from(retry));
    envelope
        .headers
        .insert(HEADER_DELAY.to_owned(), HeaderValue::Int(delay_ms));

    let mut options = PublishOptions::new();
    if let Some(priority) = envelope.metadata.priority {
        options = options.priority(priority);
    }
    if let Some(reply_to) = &delivery.properties().reply_to {
        options = options.reply_to(reply_to);
    }

    adapter
        .publish_envelope(&target.exchange, &target.routing_key, &envelope, options)
        .await?;
    debug!(
        "msg {} scheduled for retry {} in {}ms",
        envelope.id, retry, delay_ms
    );

    delivery.ack().await?;
    Ok(RetryOutcome::Retried { retry, delay })
}
