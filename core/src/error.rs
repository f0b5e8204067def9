// core/src/error.rs
use crate::rpc::message::ErrorCode;
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure raised from inside a task. The worker maps each variant onto the
/// task's terminal fields.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Deliberate failure with a stable code and diagnostic details.
    #[error("{message}")]
    Rpc {
        message: String,
        code: ErrorCode,
        error_type: String,
        details: Map<String, Value>,
    },
    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,
    /// Anything else; classified as TASK_RUNTIME_ERROR.
    #[error("{message}")]
    Runtime { message: String, error_type: String },
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

impl TaskError {
    pub fn rpc(message: impl Into<String>, code: ErrorCode) -> Self {
        TaskError::Rpc {
            message: message.into(),
            code,
            error_type: code.default_error_type().to_string(),
            details: Map::new(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        TaskError::rpc(message, ErrorCode::RpcInvalidParams)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        TaskError::Runtime { message: message.into(), error_type: "RuntimeError".to_string() }
    }

    /// Attaches details; a no-op for variants without a details map.
    pub fn with_details(mut self, extra: Value) -> Self {
        if let (TaskError::Rpc { details, .. }, Value::Object(map)) = (&mut self, extra) {
            details.extend(map);
        }
        self
    }

    pub fn with_error_type(mut self, kind: impl Into<String>) -> Self {
        match &mut self {
            TaskError::Rpc { error_type, .. } | TaskError::Runtime { error_type, .. } => *error_type = kind.into(),
            TaskError::Cancelled => {}
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            TaskError::Rpc { code, .. } => *code,
            TaskError::Cancelled => ErrorCode::TaskCancelled,
            TaskError::Runtime { .. } => ErrorCode::TaskRuntimeError,
        }
    }

    pub fn error_type(&self) -> &str {
        match self {
            TaskError::Rpc { error_type, .. } | TaskError::Runtime { error_type, .. } => error_type,
            TaskError::Cancelled => "CancelledError",
        }
    }

    pub fn details(&self) -> Option<&Map<String, Value>> {
        match self {
            TaskError::Rpc { details, .. } => Some(details),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TaskError>() {
            Ok(task_err) => task_err,
            Err(other) => {
                let error_type = if other.downcast_ref::<std::io::Error>().is_some() {
                    "OSError"
                } else {
                    "RuntimeError"
                };
                TaskError::Runtime { message: format!("{:#}", other), error_type: error_type.to_string() }
            }
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::Runtime { message: err.to_string(), error_type: "OSError".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_error_carries_code_and_details() {
        let err = TaskError::invalid_params("unknown layer(s): FOO")
            .with_details(json!({"unknown_layers": ["FOO"]}));
        assert_eq!(err.code(), ErrorCode::RpcInvalidParams);
        assert_eq!(err.error_type(), "ValueError");
        assert_eq!(err.to_string(), "unknown layer(s): FOO");
        assert_eq!(err.details().unwrap()["unknown_layers"], json!(["FOO"]));
    }

    #[test]
    fn anyhow_round_trip_keeps_task_error() {
        let original = TaskError::rpc("locked", ErrorCode::EnvFileLocked);
        let wrapped = anyhow::Error::new(original);
        let back = TaskError::from(wrapped);
        assert_eq!(back.code(), ErrorCode::EnvFileLocked);
    }

    #[test]
    fn foreign_errors_become_runtime() {
        let err = TaskError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.code(), ErrorCode::TaskRuntimeError);
        assert_eq!(err.error_type(), "RuntimeError");
        assert!(TaskError::Cancelled.is_cancelled());
        assert_eq!(TaskError::Cancelled.code(), ErrorCode::TaskCancelled);
    }
}
