//! Binary wire format for envelopes crossing the worker boundary.
//!
//! Protobuf (prost) with explicit presence on every optional scalar, so an
//! unset destination and an empty destination survive the round trip as
//! different values. Structured bodies travel as JSON text, binary bodies
//! travel untouched.

use std::collections::HashMap;

use bytes::Bytes;
use prost::Message;

use super::{Body, Envelope};

/// Errors decoding a wire envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid envelope bytes: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Invalid structured body: {0}")]
    Body(#[from] serde_json::Error),
}

#[derive(Clone, PartialEq, Message)]
struct WireEnvelope {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, optional, tag = "2")]
    to: Option<String>,
    #[prost(string, optional, tag = "3")]
    reply_to: Option<String>,
    #[prost(string, optional, tag = "4")]
    from: Option<String>,
    #[prost(string, optional, tag = "5")]
    correlation_id: Option<String>,
    #[prost(string, optional, tag = "6")]
    trace_id: Option<String>,
    #[prost(string, optional, tag = "7")]
    trace_path: Option<String>,
    #[prost(map = "string, string", tag = "8")]
    headers: HashMap<String, String>,
    #[prost(int32, optional, tag = "9")]
    status: Option<i32>,
    #[prost(map = "string, string", tag = "10")]
    annotations: HashMap<String, String>,
    #[prost(oneof = "WireBody", tags = "11, 12")]
    body: Option<WireBody>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
enum WireBody {
    /// JSON text of a structured value.
    #[prost(bytes, tag = "11")]
    Json(Vec<u8>),
    /// Raw binary content.
    #[prost(bytes, tag = "12")]
    Raw(Vec<u8>),
}

impl Envelope {
    /// Serialize to the wire format.
    pub fn to_bytes(&self) -> Bytes {
        let body = self.body.as_ref().map(|b| match b {
            Body::Value(v) => WireBody::Json(v.to_string().into_bytes()),
            Body::Bytes(raw) => WireBody::Raw(raw.clone()),
        });
        let wire = WireEnvelope {
            id: self.id.clone(),
            to: self.to.clone(),
            reply_to: self.reply_to.clone(),
            from: self.from.clone(),
            correlation_id: self.correlation_id.clone(),
            trace_id: self.trace_id.clone(),
            trace_path: self.trace_path.clone(),
            headers: self.headers.clone(),
            status: self.status,
            annotations: self.annotations.clone(),
            body,
        };
        Bytes::from(wire.encode_to_vec())
    }

    /// Deserialize from the wire format.
    pub fn from_bytes(buf: &[u8]) -> Result<Envelope, CodecError> {
        let wire = WireEnvelope::decode(buf)?;
        let body = match wire.body {
            Some(WireBody::Json(json)) => Some(Body::Value(serde_json::from_slice(&json)?)),
            Some(WireBody::Raw(raw)) => Some(Body::Bytes(raw)),
            None => None,
        };
        Ok(Envelope {
            id: wire.id,
            to: wire.to,
            reply_to: wire.reply_to,
            from: wire.from,
            correlation_id: wire.correlation_id,
            trace_id: wire.trace_id,
            trace_path: wire.trace_path,
            headers: wire.headers,
            body,
            status: wire.status,
            annotations: wire.annotations,
        })
    }
}
