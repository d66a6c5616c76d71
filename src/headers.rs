// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Header and Argument Values
//!
//! Transport-neutral representation of AMQP field values. The same type carries
//! message headers, declare arguments and the `headers` map of the JSON envelope.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header name carrying the retry counter maintained by the retry helper
pub const HEADER_RETRY_COUNT: &str = "retryCount";
/// Header name read by `x-delayed-message` exchanges
pub const HEADER_DELAY: &str = "x-delay";
/// Header name written by the broker when dead-lettering a message
pub const HEADER_X_DEATH: &str = "x-death";

/// Ordered map of header (or argument) names to values.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single AMQP field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<HeaderValue>),
    Table(Headers),
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::String(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Headers> {
        match self {
            HeaderValue::Table(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HeaderValue]> {
        match self {
            HeaderValue::Array(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(value.into())
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(value.into())
    }
}

impl From<u8> for HeaderValue {
    fn from(value: u8) -> Self {
        HeaderValue::Int(value.into())
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

/// Reads the `retryCount` header, treating a missing or malformed value as zero.
pub fn retry_count(headers: &Headers) -> u32 {
    headers
        .get(HEADER_RETRY_COUNT)
        .and_then(HeaderValue::as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or_default()
}

/// Reads the total dead-letter count from the first `x-death` entry.
pub fn death_count(headers: &Headers) -> i64 {
    headers
        .get(HEADER_X_DEATH)
        .and_then(HeaderValue::as_array)
        .and_then(|arr| arr.first())
        .and_then(HeaderValue::as_table)
        .and_then(|table| table.get("count"))
        .and_then(HeaderValue::as_i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_json_keeps_numeric_kinds() {
        let headers: Headers =
            serde_json::from_str(r#"{"a":5,"b":1.5,"c":"x","d":true,"e":[1],"f":{"g":2}}"#)
                .unwrap();

        assert_eq!(headers["a"], HeaderValue::Int(5));
        assert_eq!(headers["b"], HeaderValue::Float(1.5));
        assert_eq!(headers["c"], HeaderValue::from("x"));
        assert_eq!(headers["d"], HeaderValue::Bool(true));
        assert_eq!(headers["e"], HeaderValue::Array(vec![HeaderValue::Int(1)]));
        assert_eq!(headers["f"].as_table().unwrap()["g"], HeaderValue::Int(2));
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        let mut headers = Headers::new();
        assert_eq!(retry_count(&headers), 0);

        headers.insert(HEADER_RETRY_COUNT.into(), HeaderValue::from("3"));
        assert_eq!(retry_count(&headers), 3);

        headers.insert(HEADER_RETRY_COUNT.into(), HeaderValue::Int(-1));
        assert_eq!(retry_count(&headers), 0);
    }

    #[test]
    fn reads_death_count_from_first_entry() {
        let mut death = Headers::new();
        death.insert("count".into(), HeaderValue::Int(2));
        let mut headers = Headers::new();
        headers.insert(
            HEADER_X_DEATH.into(),
            HeaderValue::Array(vec![HeaderValue::Table(death)]),
        );

        assert_eq!(death_count(&headers), 2);
    }
}
