// core/src/rpc/message.rs
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Request line sent by the client: `{token, method, params}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Request {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(token: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Request { token: token.into(), method: method.into(), params }
    }

    /// Params as an object; anything else counts as empty.
    pub fn params_object(&self) -> Map<String, Value> {
        match &self.params {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({"token": self.token, "method": self.method, "params": self.params})
    }
}

/// Stable machine-readable error vocabulary shared by RPC and task errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RpcBadRequest,
    RpcUnauthorized,
    RpcUnknownMethod,
    RpcDeprecatedMethod,
    RpcInvalidParams,
    TaskKindUnsupported,
    TaskNotFound,
    TaskCancelled,
    TaskRuntimeError,
    EnvFileLocked,
    DaemonEnvLocked,
    EnvInUse,
    TorchvisionMissing,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RpcBadRequest => "RPC_BAD_REQUEST",
            ErrorCode::RpcUnauthorized => "RPC_UNAUTHORIZED",
            ErrorCode::RpcUnknownMethod => "RPC_UNKNOWN_METHOD",
            ErrorCode::RpcDeprecatedMethod => "RPC_DEPRECATED_METHOD",
            ErrorCode::RpcInvalidParams => "RPC_INVALID_PARAMS",
            ErrorCode::TaskKindUnsupported => "TASK_KIND_UNSUPPORTED",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::TaskCancelled => "TASK_CANCELLED",
            ErrorCode::TaskRuntimeError => "TASK_RUNTIME_ERROR",
            ErrorCode::EnvFileLocked => "ENV_FILE_LOCKED",
            ErrorCode::DaemonEnvLocked => "DAEMON_ENV_LOCKED",
            ErrorCode::EnvInUse => "ENV_IN_USE",
            ErrorCode::TorchvisionMissing => "TORCHVISION_MISSING",
        }
    }

    /// Default `error_type` reported alongside the code.
    pub fn default_error_type(&self) -> &'static str {
        match self {
            ErrorCode::RpcUnauthorized => "PermissionError",
            ErrorCode::RpcUnknownMethod | ErrorCode::RpcDeprecatedMethod => "NotImplementedError",
            ErrorCode::TaskNotFound => "FileNotFoundError",
            ErrorCode::TaskCancelled => "CancelledError",
            ErrorCode::RpcBadRequest | ErrorCode::RpcInvalidParams | ErrorCode::TaskKindUnsupported => "ValueError",
            _ => "RuntimeError",
        }
    }

    pub fn parse(raw: &str) -> Option<ErrorCode> {
        serde_json::from_value(Value::String(raw.to_string())).ok()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for `ok:false` reply lines.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub error: String,
    pub error_type: String,
    pub error_code: Option<ErrorCode>,
    pub details: Option<Map<String, Value>>,
    pub traceback: Option<String>,
}

impl ErrorReply {
    pub fn new(error: impl Into<String>, error_type: impl Into<String>) -> Self {
        ErrorReply {
            error: error.into(),
            error_type: error_type.into(),
            error_code: None,
            details: None,
            traceback: None,
        }
    }

    /// Reply carrying `code` and its default error type.
    pub fn coded(error: impl Into<String>, code: ErrorCode) -> Self {
        ErrorReply::new(error, code.default_error_type()).code(code)
    }

    pub fn code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        if let Value::Object(map) = details {
            self.details = Some(map);
        }
        self
    }

    pub fn traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("ok".into(), Value::Bool(false));
        out.insert("error".into(), Value::String(self.error.clone()));
        out.insert("error_type".into(), Value::String(self.error_type.clone()));
        if let Some(code) = self.error_code {
            out.insert("error_code".into(), Value::String(code.as_str().into()));
        }
        if let Some(details) = &self.details {
            out.insert("details".into(), Value::Object(details.clone()));
        }
        if let Some(tb) = &self.traceback {
            out.insert("traceback".into(), Value::String(tb.clone()));
        }
        Value::Object(out)
    }
}

/// Builds an `ok:true` reply from an object of extra fields.
pub fn ok_reply(fields: Value) -> Value {
    let mut out = Map::new();
    out.insert("ok".into(), Value::Bool(true));
    if let Value::Object(map) = fields {
        out.extend(map);
    }
    Value::Object(out)
}

/// Reads the `ok` flag of a reply; missing or non-bool counts as false.
pub fn reply_is_ok(reply: &Map<String, Value>) -> bool {
    reply.get("ok").and_then(Value::as_bool).unwrap_or(false)
}

/// String field helper used on both sides of the wire.
pub fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> &'a str {
    map.get(key).and_then(Value::as_str).unwrap_or("")
}
