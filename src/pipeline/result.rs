use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::timestamp::Timestamp;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FunctionNotFound,
    ComponentNotFound,
    ActionNotFound,
    Unauthorized,
    Forbidden,
    RateLimitExceeded,
    ExecutionError,
    ResponseTimeout,
    NotInitialized,
    AlreadyRegistered,
    InvalidParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CallError {
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMeta {
    pub duration_ms: u64,
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
}

impl CallMeta {
    /// Metadata for an outcome decided without running anything.
    pub fn instant() -> Self {
        let now = Timestamp::now();
        Self {
            duration_ms: 0,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn since(started_at: Timestamp) -> Self {
        let completed_at = Timestamp::now();
        Self {
            duration_ms: completed_at.millis_since(&started_at),
            started_at,
            completed_at,
        }
    }
}

/// Terminal value of every invocation. `data` is present iff `success`,
/// `error` iff not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    pub meta: CallMeta,
}

impl CallResult {
    pub fn ok(data: Value, meta: CallMeta) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta,
        }
    }

    pub fn failure(error: CallError, meta: CallMeta) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            meta,
        }
    }

    /// Failure decided before execution, duration zero.
    pub fn rejected<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self::failure(CallError::new(code, message), CallMeta::instant())
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    pub fn into_result(self) -> Result<Value, CallError> {
        match (self.success, self.data, self.error) {
            (true, data, _) => Ok(data.unwrap_or(Value::Null)),
            (false, _, Some(error)) => Err(error),
            (false, _, None) => Err(CallError::new(
                ErrorCode::ExecutionError,
                "call failed without an error description",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorCode::RateLimitExceeded).unwrap(),
            json!("RATE_LIMIT_EXCEEDED")
        );
        assert_eq!(ErrorCode::FunctionNotFound.to_string(), "FUNCTION_NOT_FOUND");
        assert_eq!(
            ErrorCode::from_str("RESPONSE_TIMEOUT").unwrap(),
            ErrorCode::ResponseTimeout
        );
    }

    #[test]
    fn test_rejected_has_zero_duration() {
        let result = CallResult::rejected(ErrorCode::FunctionNotFound, "nope");
        assert!(!result.success);
        assert!(result.data.is_none());
        assert_eq!(result.meta.duration_ms, 0);
        assert_eq!(result.meta.started_at, result.meta.completed_at);
        assert_eq!(result.error_code(), Some(ErrorCode::FunctionNotFound));
    }

    #[test]
    fn test_success_serializes_without_error() {
        let result = CallResult::ok(json!(5), CallMeta::instant());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["data"], json!(5));
        assert!(value.get("error").is_none());
        assert!(value["meta"].get("durationMs").is_some());
    }

    #[test]
    fn test_into_result() {
        assert_eq!(
            CallResult::ok(json!("x"), CallMeta::instant()).into_result(),
            Ok(json!("x"))
        );
        let err = CallResult::rejected(ErrorCode::Forbidden, "admin only")
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Forbidden);
    }
}
