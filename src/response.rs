use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::request::ResponseType;
use crate::transport::TransportResponse;

/// Decoded response body.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Bytes),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Binary(_) => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Binary(_) => None,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Json(value) => Bytes::from(value.to_string()),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// Successful response as seen by the post-response interceptors.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub payload: Payload,
    /// Served from the response cache without a transport call.
    pub from_cache: bool,
    /// Time since the request was started, set by the timing stage.
    pub elapsed: Option<Duration>,
}

impl Response {
    pub(crate) fn cached(payload: Value) -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            payload: Payload::Json(payload),
            from_cache: true,
            elapsed: None,
        }
    }

    pub(crate) fn from_transport(response: TransportResponse, response_type: ResponseType) -> Self {
        let payload = match response_type {
            ResponseType::Binary => Payload::Binary(response.body),
            ResponseType::Json => Payload::Json(decode_json(&response.body)),
        };
        Self {
            status: response.status,
            headers: response.headers,
            payload,
            from_cache: false,
            elapsed: None,
        }
    }
}

/// Parses a JSON body; empty bodies become `null` and non-JSON text is kept as a string.
fn decode_json(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Result of inspecting a payload for the standard `{code, message, data}` wrapper.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// `code == 200`; carries `data` (or `null`).
    Success(Value),
    /// Any other code.
    Failure { code: i64, message: String },
    /// Not an envelope; passed through untouched.
    Plain(Value),
}

impl Envelope {
    /// An object with a numeric `code` field is treated as an envelope.
    pub fn open(value: Value) -> Self {
        let Some(code) = value.get("code").and_then(Value::as_i64) else {
            return Self::Plain(value);
        };
        let mut map = match value {
            Value::Object(map) => map,
            other => return Self::Plain(other),
        };
        if code == 200 {
            return Self::Success(map.remove("data").unwrap_or(Value::Null));
        }
        let message = map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("request failed with code {code}"));
        Self::Failure { code, message }
    }

    pub fn is_failure(value: &Value) -> bool {
        value
            .get("code")
            .and_then(Value::as_i64)
            .is_some_and(|code| code != 200)
    }
}
