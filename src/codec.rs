//! Wire message envelopes.
//!
//! All broker traffic is UTF-8 JSON text. Four frame shapes exist:
//! - request: `{id, data}` pushed onto a queue list
//! - response: `{id, response, ok: true}` or `{id, error, ok: false}`
//! - pub/sub frame: `{id, message}`
//! - worker wake-up notification: empty payload, never parsed
//!
//! Unknown top-level fields are ignored on parse; a missing required field is
//! a [`CodecError`]. Decode failures are protocol damage: consumers log them
//! at `warn!` and keep running, they never tear a participant down.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Errors produced while parsing a wire frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
}

/// Payload published on a wake-up notification channel. Carries no content;
/// the authoritative work signal is the queue list itself.
pub const NOTIFICATION_PAYLOAD: &str = "";

/// A request frame: one RPC call on its way to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub id: String,
    pub data: Value,
}

impl RequestEnvelope {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self { id: id.into(), data }
    }

    pub fn encode(&self) -> String {
        json!({ "id": self.id, "data": self.data }).to_string()
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut map = parse_object(text)?;
        Ok(Self {
            id: take_id(&mut map)?,
            data: map.remove("data").ok_or(CodecError::MissingField("data"))?,
        })
    }
}

/// The outcome carried by a response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Handler returned a value (`ok: true`).
    Success(Value),
    /// Handler raised (`ok: false`); the error travels normalized.
    Failure(ErrorPayload),
}

/// A response frame published on a request-specific response channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: String,
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn success(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            body: ResponseBody::Success(value),
        }
    }

    pub fn failure(id: impl Into<String>, error: ErrorPayload) -> Self {
        Self {
            id: id.into(),
            body: ResponseBody::Failure(error),
        }
    }

    pub fn encode(&self) -> String {
        match &self.body {
            ResponseBody::Success(value) => {
                json!({ "id": self.id, "response": value, "ok": true }).to_string()
            }
            ResponseBody::Failure(error) => {
                json!({ "id": self.id, "error": error, "ok": false }).to_string()
            }
        }
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut map = parse_object(text)?;
        let id = take_id(&mut map)?;
        let ok = match map.remove("ok") {
            Some(Value::Bool(ok)) => ok,
            Some(_) => return Err(CodecError::WrongType("ok")),
            None => return Err(CodecError::MissingField("ok")),
        };
        let body = if ok {
            let value = map
                .remove("response")
                .ok_or(CodecError::MissingField("response"))?;
            ResponseBody::Success(value)
        } else {
            let error = map.remove("error").ok_or(CodecError::MissingField("error"))?;
            ResponseBody::Failure(serde_json::from_value(error)?)
        };
        Ok(Self { id, body })
    }
}

/// A fan-out frame published on a user channel. The `id` exists only for
/// log correlation between publisher and subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEnvelope {
    pub id: String,
    pub message: Value,
}

impl ChannelEnvelope {
    pub fn new(id: impl Into<String>, message: Value) -> Self {
        Self {
            id: id.into(),
            message,
        }
    }

    pub fn encode(&self) -> String {
        json!({ "id": self.id, "message": self.message }).to_string()
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut map = parse_object(text)?;
        Ok(Self {
            id: take_id(&mut map)?,
            message: map
                .remove("message")
                .ok_or(CodecError::MissingField("message"))?,
        })
    }
}

/// A user error in transit.
///
/// A structured error is flattened to a plain record (`message`, `name`,
/// `stack`, remaining serializable fields) before transport; anything else
/// passes through verbatim. Non-serializable state is lost by design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Structured(StructuredError),
    Raw(Value),
}

impl ErrorPayload {
    /// A structured error carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Structured(StructuredError::new(message))
    }
}

impl From<StructuredError> for ErrorPayload {
    fn from(error: StructuredError) -> Self {
        Self::Structured(error)
    }
}

impl From<Value> for ErrorPayload {
    fn from(value: Value) -> Self {
        Self::Raw(value)
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structured(error) => write!(f, "{}", error.message),
            Self::Raw(value) => write!(f, "{value}"),
        }
    }
}

/// The normalized form of a structured error value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Remaining serializable fields of the original error.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StructuredError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            stack: None,
            fields: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

fn parse_object(text: &str) -> Result<Map<String, Value>, CodecError> {
    match serde_json::from_str(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(CodecError::WrongType("message")),
    }
}

fn take_id(map: &mut Map<String, Value>) -> Result<String, CodecError> {
    match map.remove("id") {
        Some(Value::String(id)) => Ok(id),
        Some(_) => Err(CodecError::WrongType("id")),
        None => Err(CodecError::MissingField("id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let request = RequestEnvelope::new("req-1", json!({ "n": 10 }));
        let decoded = RequestEnvelope::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_request_null_data_round_trips() {
        let request = RequestEnvelope::new("req-1", Value::Null);
        let decoded = RequestEnvelope::decode(&request.encode()).unwrap();
        assert_eq!(decoded.data, Value::Null);
    }

    #[test]
    fn test_request_missing_data_is_decode_error() {
        let err = RequestEnvelope::decode(r#"{"id":"req-1"}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("data")));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let decoded =
            RequestEnvelope::decode(r#"{"id":"req-1","data":1,"future_field":true}"#).unwrap();
        assert_eq!(decoded.id, "req-1");
        assert_eq!(decoded.data, json!(1));
    }

    #[test]
    fn test_response_success_round_trip() {
        let response = ResponseEnvelope::success("req-1", json!([1, 2, 3]));
        let text = response.encode();
        assert!(text.contains(r#""ok":true"#));
        assert_eq!(ResponseEnvelope::decode(&text).unwrap(), response);
    }

    #[test]
    fn test_response_failure_round_trip() {
        let error = StructuredError::new("boom")
            .with_name("ValidationError")
            .with_field("code", json!(42));
        let response = ResponseEnvelope::failure("req-1", error.clone().into());
        let decoded = ResponseEnvelope::decode(&response.encode()).unwrap();
        match decoded.body {
            ResponseBody::Failure(ErrorPayload::Structured(rehydrated)) => {
                assert_eq!(rehydrated, error);
            }
            other => panic!("expected structured failure, got {other:?}"),
        }
    }

    #[test]
    fn test_raw_error_passes_through_verbatim() {
        let response = ResponseEnvelope::failure("req-1", json!("data").into());
        let decoded = ResponseEnvelope::decode(&response.encode()).unwrap();
        assert_eq!(
            decoded.body,
            ResponseBody::Failure(ErrorPayload::Raw(json!("data")))
        );
    }

    #[test]
    fn test_response_success_requires_response_field() {
        let err = ResponseEnvelope::decode(r#"{"id":"req-1","ok":true}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("response")));
    }

    #[test]
    fn test_response_failure_requires_error_field() {
        let err = ResponseEnvelope::decode(r#"{"id":"req-1","ok":false}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("error")));
    }

    #[test]
    fn test_response_rejects_non_boolean_ok() {
        let err = ResponseEnvelope::decode(r#"{"id":"req-1","ok":1,"response":2}"#).unwrap_err();
        assert!(matches!(err, CodecError::WrongType("ok")));
    }

    #[test]
    fn test_channel_round_trip() {
        let frame = ChannelEnvelope::new("msg-1", json!("message"));
        assert_eq!(ChannelEnvelope::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        assert!(matches!(
            ChannelEnvelope::decode("not json"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_object_frame_is_decode_error() {
        assert!(matches!(
            RequestEnvelope::decode("[1,2]"),
            Err(CodecError::WrongType("message"))
        ));
    }
}
