//! Wire protocol between the bridge and its workers
//!
//! Both directions speak UTF-8 JSON, one object per line, LF terminated.
//! The first line the bridge writes is a [`CredentialsMessage`]; the first
//! line the worker emits is an [`InitMessage`]. Every subsequent stdout line
//! answers exactly one request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command name of the non-responding shutdown request
pub const TERMINATE: &str = "terminate";

/// A request line: `{"type": <command>, "params": <object>}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub command: String,
    /// Opaque argument object; absent and `{}` are equivalent
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(command: impl Into<String>, params: Value) -> Self {
        Self {
            command: command.into(),
            params,
        }
    }

    /// The ordered-shutdown request; the worker never answers it
    pub fn terminate() -> Self {
        Self::new(TERMINATE)
    }

    pub fn is_terminate(&self) -> bool {
        self.command == TERMINATE
    }

    /// Params normalized to an object so handlers can deserialize directly
    pub fn params_object(&self) -> Value {
        if self.params.is_null() {
            Value::Object(Default::default())
        } else {
            self.params.clone()
        }
    }
}

/// A response line: `{"type": ..., "success": bool, "result"?, "error"?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Echo of the request's command name, best-effort
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    /// Successful response carrying a result (which may be JSON null)
    pub fn ok(command: impl Into<String>, result: Value) -> Self {
        Self {
            command: Some(command.into()),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response for a known command
    pub fn err(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Failed response where no command name could be determined
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            command: None,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// First line the worker emits after spawn
///
/// `error` and `mt5_pid` are always present on the wire (null when absent),
/// matching what session managers historically parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub mt5_pid: Option<u32>,
}

impl InitMessage {
    pub fn success(mt5_pid: Option<u32>) -> Self {
        Self {
            kind: "init".into(),
            success: true,
            error: None,
            mt5_pid,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            kind: "init".into(),
            success: false,
            error: Some(error.into()),
            mt5_pid: None,
        }
    }
}

/// First line the bridge writes to a fresh worker's stdin
///
/// Keeps the password off the worker's argv, where any local user could read
/// it from the process listing. The parent owns both ends of the pipe, so no
/// further authentication of this message is needed.
#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub password: String,
}

impl CredentialsMessage {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            kind: "credentials".into(),
            password: password.into(),
        }
    }

    pub fn is_credentials(&self) -> bool {
        self.kind == "credentials"
    }
}
