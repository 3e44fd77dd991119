//! Wire protocol types for parent-worker communication.
//!
//! One JSON object per line in each direction:
//! - **Incoming**: [`Request`] — a method invocation with a correlation id
//! - **Outgoing**: [`Envelope`] — response/progress/event/error replies
//!
//! Every request with a valid id gets exactly one terminal reply (response or
//! error); progress and event envelopes never substitute for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic names for events the worker itself emits.
pub mod topic {
    /// Sent once when the worker loop starts accepting requests.
    pub const READY: &str = "worker.ready";
    /// Sent once after drain, immediately before the output stream closes.
    pub const SHUTDOWN: &str = "worker.shutdown";
    /// Carries a [`LogRecord`](super::LogRecord) forwarded from worker logging.
    pub const LOG: &str = "log";
}

/// Incoming method invocation.
///
/// `id` is an opaque correlation token chosen by the parent, unique per
/// outstanding request. `params` is opaque to the protocol layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Reserved protocol error codes.
///
/// Closed enumeration owned by the dispatch layer. Application failures are
/// reported as `data` inside a normal response and never use these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Line was not valid JSON, not an object, or missing a required field.
    MalformedMessage,
    /// No handler registered for the requested method.
    MethodNotFound,
    /// Handler returned an error or panicked.
    HandlerFailed,
    /// Reply could not be serialized.
    EncodingFailed,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            Self::MalformedMessage => -32700,
            Self::MethodNotFound => -32601,
            Self::HandlerFailed => -32603,
            Self::EncodingFailed => -32000,
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::MalformedMessage => "malformed message",
            Self::MethodNotFound => "method not found",
            Self::HandlerFailed => "handler failed",
            Self::EncodingFailed => "reply encoding failed",
        }
    }
}

/// Error payload of an error envelope.
///
/// `code` and `message` come from the reserved [`ErrorCode`] table; `data`
/// may carry diagnostic context, subject to the worker's disclosure setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ErrorBody {
    pub fn reserved(code: ErrorCode, data: Value) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data,
        }
    }
}

/// Outgoing protocol message.
///
/// `timestamp` records transmission time and is stamped by the writer task at
/// write time unless the caller already set it; `created_at` optionally
/// records payload-construction time and is always preserved verbatim. `seq`
/// is a writer-assigned position in the output stream, strictly increasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Terminal reply correlated to a request.
    Response {
        id: String,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        created_at: Option<DateTime<Utc>>,
    },

    /// Non-terminal in-flight update correlated to a request.
    Progress {
        id: String,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        created_at: Option<DateTime<Utc>>,
    },

    /// Unsolicited notification; `method` acts as a topic name.
    Event {
        method: String,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        created_at: Option<DateTime<Utc>>,
    },

    /// Terminal reply signaling a protocol-layer failure.
    ///
    /// `id` is absent only when no correlation id could be recovered from a
    /// malformed line.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: ErrorBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        created_at: Option<DateTime<Utc>>,
    },
}

impl Envelope {
    pub fn response(id: impl Into<String>, data: Value) -> Self {
        Self::Response {
            id: id.into(),
            data,
            timestamp: None,
            seq: None,
            created_at: None,
        }
    }

    pub fn progress(id: impl Into<String>, data: Value) -> Self {
        Self::Progress {
            id: id.into(),
            data,
            timestamp: None,
            seq: None,
            created_at: None,
        }
    }

    pub fn event(method: impl Into<String>, data: Value) -> Self {
        Self::Event {
            method: method.into(),
            data,
            timestamp: None,
            seq: None,
            created_at: None,
        }
    }

    pub fn error(id: Option<String>, error: ErrorBody) -> Self {
        Self::Error {
            id,
            error,
            timestamp: None,
            seq: None,
            created_at: None,
        }
    }

    /// Correlation id, if this envelope carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Response { id, .. } | Self::Progress { id, .. } => Some(id),
            Self::Event { .. } => None,
            Self::Error { id, .. } => id.as_deref(),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let (timestamp, _, _) = self.stamp_fields();
        *timestamp
    }

    pub fn seq(&self) -> Option<u64> {
        let (_, seq, _) = self.stamp_fields();
        *seq
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let (_, _, created_at) = self.stamp_fields();
        *created_at
    }

    /// Whether this envelope ends a request's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Response { .. } | Self::Error { .. })
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        let (timestamp, _, _) = self.stamp_fields_mut();
        *timestamp = Some(ts);
        self
    }

    pub fn with_created_at(mut self, ts: DateTime<Utc>) -> Self {
        let (_, _, created_at) = self.stamp_fields_mut();
        *created_at = Some(ts);
        self
    }

    /// Assign the stream position and fill in the transmission time.
    ///
    /// A caller-supplied `timestamp` is kept; `seq` is always writer-owned.
    pub(crate) fn stamp(&mut self, seq: u64, now: DateTime<Utc>) {
        let (timestamp, seq_field, _) = self.stamp_fields_mut();
        if timestamp.is_none() {
            *timestamp = Some(now);
        }
        *seq_field = Some(seq);
    }

    fn stamp_fields(&self) -> (&Option<DateTime<Utc>>, &Option<u64>, &Option<DateTime<Utc>>) {
        match self {
            Self::Response {
                timestamp,
                seq,
                created_at,
                ..
            }
            | Self::Progress {
                timestamp,
                seq,
                created_at,
                ..
            }
            | Self::Event {
                timestamp,
                seq,
                created_at,
                ..
            }
            | Self::Error {
                timestamp,
                seq,
                created_at,
                ..
            } => (timestamp, seq, created_at),
        }
    }

    fn stamp_fields_mut(
        &mut self,
    ) -> (
        &mut Option<DateTime<Utc>>,
        &mut Option<u64>,
        &mut Option<DateTime<Utc>>,
    ) {
        match self {
            Self::Response {
                timestamp,
                seq,
                created_at,
                ..
            }
            | Self::Progress {
                timestamp,
                seq,
                created_at,
                ..
            }
            | Self::Event {
                timestamp,
                seq,
                created_at,
                ..
            }
            | Self::Error {
                timestamp,
                seq,
                created_at,
                ..
            } => (timestamp, seq, created_at),
        }
    }
}

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Payload of a `log` event.
///
/// Opaque to the protocol layer; a typed convenience for the common case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            target: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Payload of a progress envelope for count-of-total work.
///
/// Opaque to the protocol layer, like [`LogRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Completion in `0.0..=1.0`.
    pub ratio: f64,
    pub current: f64,
    pub total: f64,
    /// What is being counted, e.g. "items" or "bytes".
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
}

impl ProgressUpdate {
    pub fn new(ratio: f64, current: f64, total: f64, unit: impl Into<String>) -> Self {
        Self {
            ratio,
            current,
            total,
            unit: unit.into(),
            stage: None,
            message: None,
            eta_ms: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_eta_ms(mut self, eta_ms: u64) -> Self {
        self.eta_ms = Some(eta_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn response_serializes() {
        let env = Envelope::response("1", json!({"x": 1}));
        insta::assert_json_snapshot!(env, @r###"
        {
          "type": "response",
          "id": "1",
          "data": {
            "x": 1
          }
        }
        "###);
    }

    #[test]
    fn method_not_found_error_serializes() {
        let env = Envelope::error(
            Some("2".to_string()),
            ErrorBody::reserved(ErrorCode::MethodNotFound, serde_json::Value::Null),
        );
        insta::assert_json_snapshot!(env, @r###"
        {
          "type": "error",
          "id": "2",
          "error": {
            "code": -32601,
            "message": "method not found"
          }
        }
        "###);
    }

    #[test]
    fn event_serializes_without_id() {
        let env = Envelope::event("worker.ready", json!("hello"));
        insta::assert_json_snapshot!(env, @r###"
        {
          "type": "event",
          "method": "worker.ready",
          "data": "hello"
        }
        "###);
    }

    #[test]
    fn error_without_id_omits_field() {
        let env = Envelope::error(
            None,
            ErrorBody::reserved(ErrorCode::MalformedMessage, serde_json::Value::Null),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["error"]["code"], json!(-32700));
    }

    #[test]
    fn stamp_fills_unset_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        let mut env = Envelope::response("1", json!(null));
        env.stamp(7, now);
        assert_eq!(env.seq(), Some(7));
        assert_eq!(env.timestamp(), Some(now));
    }

    #[test]
    fn stamp_preserves_caller_timestamp() {
        let supplied = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        let mut env = Envelope::progress("1", json!(null)).with_timestamp(supplied);
        env.stamp(1, now);
        assert_eq!(env.timestamp(), Some(supplied));
    }

    #[test]
    fn created_at_is_preserved_alongside_timestamp() {
        let created = Utc.with_ymd_and_hms(2024, 1, 15, 8, 59, 0).unwrap();
        let supplied = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let mut env = Envelope::progress("1", json!(null))
            .with_created_at(created)
            .with_timestamp(supplied);
        env.stamp(3, Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap());

        let value = serde_json::to_value(&env).unwrap();
        let parsed: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.created_at(), Some(created));
        assert_eq!(parsed.timestamp(), Some(supplied));
    }

    #[test]
    fn terminal_classification() {
        assert!(Envelope::response("1", json!(null)).is_terminal());
        assert!(
            Envelope::error(None, ErrorBody::reserved(ErrorCode::HandlerFailed, json!(null)))
                .is_terminal()
        );
        assert!(!Envelope::progress("1", json!(null)).is_terminal());
        assert!(!Envelope::event("log", json!(null)).is_terminal());
    }

    #[test]
    fn reserved_codes_are_distinct() {
        let codes = [
            ErrorCode::MalformedMessage,
            ErrorCode::MethodNotFound,
            ErrorCode::HandlerFailed,
            ErrorCode::EncodingFailed,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn request_params_default_to_null() {
        let req: Request = serde_json::from_str(r#"{"id":"1","method":"ping"}"#).unwrap();
        assert_eq!(req.params, serde_json::Value::Null);
    }

    #[test]
    fn progress_update_optional_fields_are_omitted() {
        let update = ProgressUpdate::new(0.5, 5.0, 10.0, "items");
        let value = serde_json::to_value(&update).unwrap();
        assert!(value.get("stage").is_none());
        assert!(value.get("eta_ms").is_none());

        let staged = ProgressUpdate::new(0.5, 5.0, 10.0, "items").with_stage("transform");
        let value = serde_json::to_value(&staged).unwrap();
        assert_eq!(value["stage"], json!("transform"));
    }

    #[test]
    fn log_record_levels_serialize_lowercase() {
        let record = LogRecord::warn("disk almost full").with_target("app::store");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["level"], json!("warn"));
        assert_eq!(value["target"], json!("app::store"));
    }
}
