//! Wire types shared by the relay daemon and its clients.
//!
//! Every frame is a JSON object `{ "type": <string>, "data": <object> }`. Correlated exchanges
//! carry `data.requestId`; the `error` type is reserved for protocol-level rejections.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message type reserved for protocol rejections.
pub const ERROR_KIND: &str = "error";
/// Field inside `data` that correlates a request with its stage and terminal messages.
pub const REQUEST_ID_FIELD: &str = "requestId";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Stage notification carrying nothing but the correlation id.
    pub fn stage(kind: &str, request_id: &str) -> Self {
        Self::new(kind, Map::new()).with_request_id(request_id)
    }

    /// Protocol rejection. The request id is echoed when the offending frame had one.
    pub fn error(message: impl Into<String>, request_id: Option<&str>) -> Self {
        let mut data = Map::new();
        data.insert("message".into(), Value::String(message.into()));
        let msg = Self::new(ERROR_KIND, data);
        match request_id {
            Some(id) => msg.with_request_id(id),
            None => msg,
        }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.data.insert(
            REQUEST_ID_FIELD.into(),
            Value::String(request_id.to_string()),
        );
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.data.get(REQUEST_ID_FIELD).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.kind == ERROR_KIND
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format: expected a JSON object")]
    NotAnObject,
    #[error("Invalid message format: missing or invalid \"type\" field")]
    InvalidType,
    #[error("Invalid message format: \"data\" must be an object")]
    InvalidData,
}

/// Validates the minimal shape of a decoded frame and turns it into a [`Message`].
///
/// `type` must be a non-empty string. A missing `data` becomes an empty object; any other
/// non-object `data` is rejected.
pub fn parse_message(value: Value) -> Result<Message, ProtocolError> {
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let kind = match obj.remove("type") {
        Some(Value::String(kind)) if !kind.is_empty() => kind,
        _ => return Err(ProtocolError::InvalidType),
    };

    let data = match obj.remove("data") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(data)) => data,
        Some(_) => return Err(ProtocolError::InvalidData),
    };

    Ok(Message { kind, data })
}

/// Best-effort extraction of `data.requestId` from a frame that failed validation.
pub fn request_id_hint(value: &Value) -> Option<&str> {
    value
        .get("data")
        .and_then(|data| data.get(REQUEST_ID_FIELD))
        .and_then(Value::as_str)
}

/// Application-defined names of the request and of its stage/terminal messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionKinds {
    pub request: String,
    pub queued: String,
    pub processing: String,
    pub response: String,
}

impl Default for ActionKinds {
    fn default() -> Self {
        Self {
            request: "run".into(),
            queued: "queued".into(),
            processing: "processing".into(),
            response: "response".into(),
        }
    }
}

impl ActionKinds {
    /// `<action>Queued`, `<action>Processing`, `<action>Response`, with `<action>` itself as the
    /// request type.
    pub fn prefixed(action: &str) -> Self {
        Self {
            request: action.to_string(),
            queued: format!("{action}Queued"),
            processing: format!("{action}Processing"),
            response: format!("{action}Response"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Success,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Success => "success",
        }
    }
}

/// Structured result of one executed task, carried in the terminal message's `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            severity: Severity::Success,
            message: None,
            extra: Map::new(),
        }
    }

    pub fn failure(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            success: false,
            severity,
            message: Some(message.into()),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Builds the terminal message for `request_id` under the given response type.
    pub fn into_message(self, kind: &str, request_id: Option<&str>) -> Message {
        let data = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let msg = Message::new(kind, data);
        match request_id {
            Some(id) => msg.with_request_id(id),
            None => msg,
        }
    }

    /// Reads an outcome back out of a terminal message; the correlation id is not kept.
    pub fn from_message(msg: &Message) -> Result<Self, serde_json::Error> {
        let mut outcome: TaskOutcome = serde_json::from_value(Value::Object(msg.data.clone()))?;
        outcome.extra.remove(REQUEST_ID_FIELD);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_rejects_missing_or_empty_type() {
        assert_eq!(
            parse_message(json!({"data": {}})),
            Err(ProtocolError::InvalidType)
        );
        assert_eq!(
            parse_message(json!({"type": "", "data": {}})),
            Err(ProtocolError::InvalidType)
        );
        assert_eq!(
            parse_message(json!({"type": 7})),
            Err(ProtocolError::InvalidType)
        );
        assert_eq!(parse_message(json!([1, 2])), Err(ProtocolError::NotAnObject));
    }

    #[test]
    fn parse_defaults_missing_data() {
        let msg = parse_message(json!({"type": "run"})).unwrap();
        assert_eq!(msg.kind, "run");
        assert!(msg.data.is_empty());
        assert_eq!(
            parse_message(json!({"type": "run", "data": "x"})),
            Err(ProtocolError::InvalidData)
        );
    }

    #[test]
    fn error_message_echoes_request_id() {
        let msg = Message::error("Invalid JSON format", Some("r9"));
        assert!(msg.is_error());
        assert_eq!(msg.request_id(), Some("r9"));
        assert_eq!(msg.error_message(), Some("Invalid JSON format"));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "error", "data": {"message": "Invalid JSON format", "requestId": "r9"}})
        );
    }

    #[test]
    fn prefixed_kinds_follow_action_name() {
        let kinds = ActionKinds::prefixed("whitelist");
        assert_eq!(kinds.queued, "whitelistQueued");
        assert_eq!(kinds.processing, "whitelistProcessing");
        assert_eq!(kinds.response, "whitelistResponse");
    }

    #[test]
    fn outcome_terminal_message_shape() {
        let msg = TaskOutcome::failure(Severity::Warning, "Rate limited")
            .with_extra("audioId", json!(42))
            .into_message("response", Some("r1"));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "response",
                "data": {
                    "success": false,
                    "severity": "warning",
                    "message": "Rate limited",
                    "audioId": 42,
                    "requestId": "r1"
                }
            })
        );

        let back = TaskOutcome::from_message(&msg).unwrap();
        assert_eq!(back.severity, Severity::Warning);
        assert_eq!(back.extra.get("audioId"), Some(&json!(42)));
        assert!(back.extra.get(REQUEST_ID_FIELD).is_none());
    }
}
