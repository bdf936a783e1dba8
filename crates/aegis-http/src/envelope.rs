//! Response normalization.
//!
//! Backend responses arrive as `{data, error, status}` envelopes, bare JSON,
//! or empty bodies. Everything is folded into `ApiResponse` on success and
//! `ApiError` on failure; `Envelope` is the uniform shape handed to UI code.

use crate::error::{ApiError, HttpResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Successful (2xx) response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Unwrapped payload; `None` for empty bodies or `"data": null`.
    pub data: Option<Value>,
}

impl ApiResponse {
    /// Deserialize the payload into a typed value.
    pub fn json<T: DeserializeOwned>(&self) -> HttpResult<T> {
        let value = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| ApiError::malformed(Some(self.status), e))
    }
}

/// Uniform result shape: `{success, data?, error?, status}`.
///
/// `status` is 0 when no response was received (timeout, network).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope<T = Value> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub status: u16,
}

impl From<HttpResult<ApiResponse>> for Envelope {
    fn from(result: HttpResult<ApiResponse>) -> Self {
        match result {
            Ok(response) => Self {
                success: true,
                data: response.data,
                error: None,
                code: None,
                status: response.status,
            },
            Err(err) => Self {
                success: false,
                data: None,
                error: Some(err.message),
                code: err.code,
                status: err.status.unwrap_or(0),
            },
        }
    }
}

/// Normalize a raw status/body pair.
pub(crate) fn normalize(status: u16, body: &[u8]) -> HttpResult<ApiResponse> {
    let is_empty = body.iter().all(u8::is_ascii_whitespace);

    if (200..300).contains(&status) {
        if is_empty {
            return Ok(ApiResponse { status, data: None });
        }
        let value: Value =
            serde_json::from_slice(body).map_err(|e| ApiError::malformed(Some(status), e))?;
        return Ok(ApiResponse {
            status,
            data: unwrap_data(value),
        });
    }

    if is_empty {
        return Err(ApiError::from_status(status));
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(value) => Err(parse_error_body(status, &value)),
        Err(_) => Err(ApiError::from_status(status)),
    }
}

fn unwrap_data(value: Value) -> Option<Value> {
    match value {
        Value::Object(mut map) if map.contains_key("data") => match map.remove("data") {
            Some(Value::Null) | None => None,
            data => data,
        },
        Value::Null => None,
        other => Some(other),
    }
}

fn parse_error_body(status: u16, body: &Value) -> ApiError {
    let nested = body.get("error");

    let message = nested
        .and_then(|e| {
            e.as_str()
                .map(str::to_string)
                .or_else(|| e.get("message").and_then(Value::as_str).map(str::to_string))
        })
        .or_else(|| body.get("message").and_then(Value::as_str).map(str::to_string))
        .or_else(|| body.get("detail").and_then(Value::as_str).map(str::to_string));

    let code = body
        .get("code")
        .or_else(|| nested.and_then(|e| e.get("code")))
        .and_then(code_to_string);

    let base = ApiError::from_status(status);
    match message {
        Some(message) => ApiError { message, ..base }.with_code(code),
        None => base.with_code(code),
    }
}

fn code_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
