//! Envelope: the message unit exchanged between the host runtime, the
//! broker worker and the broker itself.
//!
//! This module contains:
//! - `Envelope`: routing, correlation and tracing metadata plus a body
//! - `Body`: structured JSON value or raw bytes
//! - Header name constants shared by the worker and the host
//! - `codec`: binary wire format used across the worker boundary

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

mod codec;

pub use codec::CodecError;

/// Control/message type header.
pub const TYPE_HEADER: &str = "type";
/// Resource path header carried by the `init` control message.
pub const RESOURCE_PATH_HEADER: &str = "resource.path";
/// Destination topic header of an outbound-intent message.
pub const TOPIC_HEADER: &str = "topic";
/// Consumer id header of an exception envelope.
pub const CLIENT_HEADER: &str = "client";
/// Broker header carrying the distributed trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Consumer id of the inbound broker message.
pub const META_CLIENT: &str = "_client";
/// Resolved target (route name or workflow reference).
pub const META_TARGET: &str = "_target";
/// Originating topic.
pub const META_TOPIC: &str = "_topic";
/// Originating partition.
pub const META_PARTITION: &str = "_partition";
/// Originating offset.
pub const META_OFFSET: &str = "_offset";

/// Annotation holding a handler's execution time in milliseconds.
pub const EXEC_TIME_ANNOTATION: &str = "exec_time";

/// Adapter-internal headers stamped on inbound broker messages.
///
/// Never forwarded to broker headers and never exposed to workflows.
pub const RESERVED_METADATA: [&str; 5] =
    [META_CLIENT, META_TARGET, META_TOPIC, META_PARTITION, META_OFFSET];

/// Returns true for adapter-internal metadata header names.
pub fn is_reserved_metadata(key: &str) -> bool {
    RESERVED_METADATA.contains(&key)
}

/// Envelope body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Structured data: mapping, sequence or scalar (including text).
    Value(Value),
    /// Opaque binary content, preserved byte-exact.
    Bytes(Vec<u8>),
}

impl Body {
    /// Text body.
    pub fn text(s: impl Into<String>) -> Self {
        Body::Value(Value::String(s.into()))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Body::Value(v) => Some(v),
            Body::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(b) => Some(b),
            Body::Value(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    /// True when the body is a mapping.
    pub fn is_object(&self) -> bool {
        matches!(self, Body::Value(Value::Object(_)))
    }

    /// Look up a field of a mapping body.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.as_value().and_then(|v| v.get(key))
    }
}

impl From<Value> for Body {
    fn from(v: Value) -> Self {
        Body::Value(v)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Body::Bytes(b)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::text(s)
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::text(s)
    }
}

/// Structured message with routing, correlation and tracing metadata.
///
/// Optional fields distinguish "unset" from "set to empty string"; the wire
/// codec preserves the distinction.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Unique message id.
    pub id: String,
    /// Destination route.
    pub to: Option<String>,
    /// Route that should receive a response.
    pub reply_to: Option<String>,
    /// Sender route.
    pub from: Option<String>,
    /// Matches responses and acknowledgements to their request.
    pub correlation_id: Option<String>,
    /// Distributed trace id, propagated end to end.
    pub trace_id: Option<String>,
    /// Human-readable trace path (e.g. `TOPIC hello.notice`).
    pub trace_path: Option<String>,
    /// Application headers.
    pub headers: HashMap<String, String>,
    /// Message body.
    pub body: Option<Body>,
    /// Absent for normal messages; >= 400 signals failure.
    pub status: Option<i32>,
    /// Transport-internal annotations, meaningful only inside the context
    /// that produced them (e.g. [`EXEC_TIME_ANNOTATION`]). Dropped by
    /// [`Envelope::sanitized_copy`].
    pub annotations: HashMap<String, String>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            id: new_id(),
            to: None,
            reply_to: None,
            from: None,
            correlation_id: None,
            trace_id: None,
            trace_path: None,
            headers: HashMap::new(),
            body: None,
            status: None,
            annotations: HashMap::new(),
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_correlation_id(mut self, cid: impl Into<String>) -> Self {
        self.correlation_id = Some(cid.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, trace_path: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.trace_path = Some(trace_path.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Value of the `type` header.
    pub fn message_type(&self) -> Option<&str> {
        self.header(TYPE_HEADER)
    }

    /// True when status signals failure.
    pub fn is_error(&self) -> bool {
        self.status.is_some_and(|s| s >= 400)
    }

    /// Copy for crossing the worker boundary.
    ///
    /// Transport-internal annotations are dropped so the receiver never sees
    /// fields meaningful only inside the originating context.
    pub fn sanitized_copy(&self) -> Envelope {
        Envelope {
            id: self.id.clone(),
            to: self.to.clone(),
            reply_to: self.reply_to.clone(),
            from: self.from.clone(),
            correlation_id: self.correlation_id.clone(),
            trace_id: self.trace_id.clone(),
            trace_path: self.trace_path.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            status: self.status,
            annotations: HashMap::new(),
        }
    }

    /// Headers with adapter-internal metadata removed.
    pub fn external_headers(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .filter(|(k, _)| !is_reserved_metadata(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Generate a compact unique id.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}
