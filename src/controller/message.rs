//! Request and reply envelopes exchanged with client handles

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

use super::error::DispatchError;

/// A client request: an opaque id, a command name and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation token chosen by the client, echoed in the reply
    pub id: Value,
    /// Command name looked up in the command table
    pub command: String,
    /// Command parameters
    #[serde(default)]
    pub params: Params,
}

impl Request {
    /// Build a request from parts
    pub fn new(id: impl Into<Value>, command: impl Into<String>, params: Params) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            params,
        }
    }
}

/// Key-value request payload with typed accessors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Value>);

impl Params {
    /// Empty parameter set
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insertion
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Raw access to a parameter
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Required string parameter
    pub fn require_str(&self, key: &str) -> Result<&str, DispatchError> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::invalid_param(key))
    }

    /// Required non-negative integer parameter
    pub fn require_u64(&self, key: &str) -> Result<u64, DispatchError> {
        self.get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| DispatchError::invalid_param(key))
    }

    /// Required signed integer parameter
    pub fn require_i64(&self, key: &str) -> Result<i64, DispatchError> {
        self.get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| DispatchError::invalid_param(key))
    }

    /// Required list of strings
    pub fn require_str_list(&self, key: &str) -> Result<Vec<String>, DispatchError> {
        let items = self
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| DispatchError::invalid_param(key))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| DispatchError::invalid_param(key))
            })
            .collect()
    }

    /// Optional string parameter; present-but-mistyped is an error
    pub fn optional_str(&self, key: &str) -> Result<Option<&str>, DispatchError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| DispatchError::invalid_param(key)),
        }
    }

    /// Optional non-negative integer parameter
    pub fn optional_u64(&self, key: &str) -> Result<Option<u64>, DispatchError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| DispatchError::invalid_param(key)),
        }
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Reply delivered to the client that sent the matching request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Id copied from the request
    pub id: Value,
    /// Command name copied from the request
    pub command: String,
    /// Result payload, or an error object with `"error": true`
    pub data: Value,
}

impl Reply {
    /// Successful reply echoing the request's id and command
    pub fn success(request: &Request, data: Value) -> Self {
        Self {
            id: request.id.clone(),
            command: request.command.clone(),
            data,
        }
    }

    /// Error reply carrying a code and a human-readable message
    pub fn failure(id: Value, command: impl Into<String>, error: &DispatchError) -> Self {
        Self {
            id,
            command: command.into(),
            data: json!({
                "error": true,
                "code": error.code(),
                "message": error.to_string(),
            }),
        }
    }

    /// Whether the payload is an error object
    pub fn is_error(&self) -> bool {
        self.data
            .get("error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Error code, if this is an error reply
    pub fn error_code(&self) -> Option<&str> {
        if self.is_error() {
            self.data.get("code").and_then(Value::as_str)
        } else {
            None
        }
    }

    /// Error message, if this is an error reply
    pub fn error_message(&self) -> Option<&str> {
        if self.is_error() {
            self.data.get("message").and_then(Value::as_str)
        } else {
            None
        }
    }
}

/// What a client handle yields when asked for its next input
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A well-formed request
    Request(Request),
    /// Input that could not be decoded into a request
    Malformed {
        /// Decoder message
        reason: String,
    },
    /// The handle was closed; no further input will arrive
    Closed,
}

/// Flow-transfer outcome of a command, consumed by the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    /// Tear down this controller instance and start a fresh one
    Restart,
    /// Tear down this controller instance and exit
    Shutdown,
}

impl ControlSignal {
    /// Combine two signals raised in the same round; shutdown wins
    pub fn merge(self, other: ControlSignal) -> ControlSignal {
        match (self, other) {
            (ControlSignal::Shutdown, _) | (_, ControlSignal::Shutdown) => ControlSignal::Shutdown,
            _ => ControlSignal::Restart,
        }
    }

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Restart => "restart",
            ControlSignal::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_params_default_to_empty() {
        let request: Request = serde_json::from_str(r#"{"id": 7, "command": "ping"}"#).unwrap();
        assert_eq!(request.id, json!(7));
        assert_eq!(request.params, Params::new());
    }

    #[test]
    fn typed_accessors_report_the_key() {
        let params = Params::new()
            .with("paperID", "PMC1")
            .with("lineNum", 3)
            .with("groundings", json!(["go:1", 2]));

        assert_eq!(params.require_str("paperID").unwrap(), "PMC1");
        assert_eq!(params.require_u64("lineNum").unwrap(), 3);
        let err = params.require_str_list("groundings").unwrap_err();
        assert!(err.to_string().contains("groundings"));
        assert!(params.require_u64("paperID").is_err());
        assert_eq!(params.optional_str("missing").unwrap(), None);
    }

    #[test]
    fn failure_reply_echoes_id_and_command() {
        let reply = Reply::failure(json!("abc"), "frobnicate", &DispatchError::InvalidCommand("frobnicate".into()));
        assert_eq!(reply.id, json!("abc"));
        assert_eq!(reply.command, "frobnicate");
        assert!(reply.is_error());
        assert_eq!(reply.error_code(), Some("invalid_command"));
    }

    #[test]
    fn shutdown_dominates_restart() {
        assert_eq!(
            ControlSignal::Restart.merge(ControlSignal::Shutdown),
            ControlSignal::Shutdown
        );
        assert_eq!(
            ControlSignal::Restart.merge(ControlSignal::Restart),
            ControlSignal::Restart
        );
    }
}
