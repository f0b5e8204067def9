// daemon/src/daemon/handlers/mod.rs
pub mod model_handler;
pub mod task_handler;

pub use model_handler::{handle_health, handle_model_status, handle_warmup};
pub use task_handler::{handle_task_cancel, handle_task_status, handle_task_submit};

use crate::daemon::state::DaemonState;
use anyhow::Result;
use serde_json::{json, Map, Value};
use snipper_core::error::TaskError;
use snipper_core::rpc::contract::{
    ContractRegistry, METHOD_HEALTH, METHOD_MODEL_STATUS, METHOD_SHUTDOWN, METHOD_TASK_CANCEL, METHOD_TASK_STATUS,
    METHOD_TASK_SUBMIT, METHOD_WARMUP,
};
use snipper_core::rpc::message::ErrorCode;
use std::thread;

fn param_missing(params: &Map<String, Value>, key: &str) -> bool {
    match params.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Routes one authorized request. Coded failures come back as a
/// [`TaskError`] inside the `anyhow::Error`.
pub fn dispatch(state: &DaemonState, method: &str, params: &Map<String, Value>) -> Result<Value> {
    let contract = ContractRegistry::global();

    if contract.is_deprecated_method(method) {
        return Err(TaskError::rpc(
            format!("method '{0}' is deprecated; use task_submit(kind='{0}') + task_status", method),
            ErrorCode::RpcDeprecatedMethod,
        )
        .with_details(json!({"replacement": "task_submit + task_status", "removal_target": "2.0.0"}))
        .into());
    }

    if let Some(key) = contract.method_params_required(method).iter().find(|k| param_missing(params, k)) {
        return Err(TaskError::invalid_params(format!("{} missing", key)).into());
    }

    match method {
        METHOD_HEALTH => handle_health(state),
        METHOD_WARMUP => handle_warmup(state),
        METHOD_MODEL_STATUS => handle_model_status(state),
        METHOD_TASK_SUBMIT => handle_task_submit(state, params),
        METHOD_TASK_STATUS => handle_task_status(state, params),
        METHOD_TASK_CANCEL => handle_task_cancel(state, params),
        METHOD_SHUTDOWN => handle_shutdown(state),
        _ => {
            let hint = if contract.is_known_method(method) {
                "known method but unsupported in server implementation".to_string()
            } else {
                format!("known={}", contract.known_methods().join(","))
            };
            Err(TaskError::rpc(format!("unknown method: {} ({})", method, hint), ErrorCode::RpcUnknownMethod).into())
        }
    }
}

/// Replies at once; stopping the worker can block on the model lock, so it
/// happens on its own thread.
pub fn handle_shutdown(state: &DaemonState) -> Result<Value> {
    log::info!("shutdown_requested");
    let state = state.clone();
    thread::Builder::new()
        .name("snipper-shutdown".into())
        .spawn(move || state.begin_stop())?;
    Ok(json!({"ok": true}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::state::testing::stub_services;
    use std::time::{Duration, Instant};

    fn rpc_error(state: &DaemonState, method: &str, params: Value) -> TaskError {
        let params = params.as_object().cloned().unwrap_or_default();
        let err = dispatch(state, method, &params).unwrap_err();
        err.downcast::<TaskError>().unwrap()
    }

    #[test]
    fn deprecated_method_points_to_tasks() {
        let (state, rx) = DaemonState::new("", stub_services(1));
        let err = rpc_error(&state, "predict_image", json!({"image_path": "a.png"}));
        assert_eq!(err.code(), ErrorCode::RpcDeprecatedMethod);
        assert_eq!(err.error_type(), "NotImplementedError");
        assert_eq!(err.details().unwrap()["removal_target"], "2.0.0");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_method_lists_known_ones() {
        let (state, _rx) = DaemonState::new("", stub_services(1));
        let err = rpc_error(&state, "reboot", json!({}));
        assert_eq!(err.code(), ErrorCode::RpcUnknownMethod);
        assert!(err.to_string().starts_with("unknown method: reboot (known=health,warmup,"));
    }

    #[test]
    fn required_params_are_enforced() {
        let (state, _rx) = DaemonState::new("", stub_services(1));
        for (method, key) in [("task_status", "task_id"), ("task_cancel", "task_id"), ("task_submit", "kind")] {
            let err = rpc_error(&state, method, json!({key: ""}));
            assert_eq!(err.code(), ErrorCode::RpcInvalidParams);
            assert_eq!(err.to_string(), format!("{} missing", key));
        }
    }

    #[test]
    fn shutdown_marks_the_state_stopping() {
        let (state, _rx) = DaemonState::new("", stub_services(1));
        assert_eq!(dispatch(&state, "shutdown", &Map::new()).unwrap(), json!({"ok": true}));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !state.is_stopping() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(state.is_stopping());
    }
}
