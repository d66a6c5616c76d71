// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Every message body is a JSON envelope wrapping the caller's opaque payload:
//!
//! ```json
//! {
//!   "id": "6c1f…",
//!   "correlationId": "req-42",
//!   "payload": { "...": "..." },
//!   "metadata": { "timestamp": "2025-01-01T00:00:00Z", "source": "call-router", "priority": 5 },
//!   "headers": { "tenant": "acme" }
//! }
//! ```

use crate::{errors::AmqpError, headers::Headers};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<P> {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: P,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
}

impl<P> Envelope<P> {
    /// Wraps `payload` under a fresh message id.
    pub fn new(payload: P, source: &str) -> Envelope<P> {
        Envelope {
            id: Uuid::new_v4().to_string(),
            correlation_id: None,
            payload,
            metadata: Metadata {
                timestamp: Utc::now(),
                source: source.to_owned(),
                priority: None,
            },
            headers: Headers::new(),
        }
    }
}

impl<P: Serialize> Envelope<P> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<P: DeserializeOwned> Envelope<P> {
    pub fn from_bytes(body: &[u8]) -> Result<Envelope<P>, AmqpError> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderValue;
    use serde_json::{json, Value};

    #[test]
    fn serializes_with_camel_case_and_omits_empty_fields() {
        let envelope = Envelope::new(json!({"call": 7}), "router");
        let value: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(value["payload"], json!({"call": 7}));
        assert_eq!(value["metadata"]["source"], "router");
        assert!(value.get("correlationId").is_none());
        assert!(value.get("headers").is_none());
        assert!(value["metadata"].get("priority").is_none());
    }

    #[test]
    fn decodes_what_other_services_send() {
        let body = br#"{
            "id": "abc",
            "correlationId": "req-1",
            "payload": "hello",
            "metadata": {"timestamp": "2025-03-01T10:00:00Z", "source": "billing", "priority": 4},
            "headers": {"tenant": "acme", "retryCount": 2}
        }"#;

        let envelope: Envelope<String> = Envelope::from_bytes(body).unwrap();
        assert_eq!(envelope.id, "abc");
        assert_eq!(envelope.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(envelope.payload, "hello");
        assert_eq!(envelope.metadata.priority, Some(4));
        assert_eq!(envelope.headers["retryCount"], HeaderValue::Int(2));
    }

    #[test]
    fn ids_are_unique_per_envelope() {
        let a = Envelope::new((), "s");
        let b = Envelope::new((), "s");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn malformed_body_is_a_serialization_error() {
        let err = Envelope::<String>::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, AmqpError::Serialization(_)));
    }
}
