// daemon/src/daemon/handlers/task_handler.rs
use crate::daemon::state::DaemonState;
use anyhow::Result;
use serde_json::{json, Map, Value};
use snipper_core::error::TaskError;
use snipper_core::rpc::contract::ContractRegistry;
use snipper_core::rpc::message::{str_field, ErrorCode};
use snipper_core::utils::models::TaskKind;

fn not_found(task_id: &str) -> anyhow::Error {
    TaskError::rpc(format!("task not found: {}", task_id), ErrorCode::TaskNotFound)
        .with_details(json!({"task_id": task_id}))
        .into()
}

/// Queues a task. Params are validated by the worker when the task runs,
/// so a bad payload surfaces as a failed task rather than a failed submit.
pub fn handle_task_submit(state: &DaemonState, params: &Map<String, Value>) -> Result<Value> {
    let raw_kind = str_field(params, "kind").trim();
    let kind = TaskKind::parse(raw_kind).filter(|_| ContractRegistry::global().is_supported_task_kind(raw_kind));
    let Some(kind) = kind else {
        return Err(TaskError::rpc(format!("unsupported task kind: {}", raw_kind), ErrorCode::TaskKindUnsupported)
            .with_details(json!({"kind": raw_kind}))
            .into());
    };
    let task_params = match params.get("params") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let task_id = state.create_task(kind, task_params);
    Ok(json!({"ok": true, "task_id": task_id}))
}

pub fn handle_task_status(state: &DaemonState, params: &Map<String, Value>) -> Result<Value> {
    let task_id = str_field(params, "task_id");
    match state.task(task_id) {
        Some(task) => Ok(json!({"ok": true, "task": task})),
        None => Err(not_found(task_id)),
    }
}

/// Flags the task; the worker notices at its next checkpoint.
pub fn handle_task_cancel(state: &DaemonState, params: &Map<String, Value>) -> Result<Value> {
    let task_id = str_field(params, "task_id");
    let Some(task) = state.request_cancel(task_id) else {
        return Err(not_found(task_id));
    };
    log::info!("task_cancel_requested task_id={} status={}", task_id, task.status);
    Ok(json!({"ok": true, "task_id": task_id}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::state::testing::stub_services;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn code_of(err: &anyhow::Error) -> ErrorCode {
        err.downcast_ref::<TaskError>().map(TaskError::code).unwrap()
    }

    #[test]
    fn submit_then_poll_and_cancel() {
        let (state, rx) = DaemonState::new("", stub_services(1));
        let reply = handle_task_submit(&state, &obj(json!({"kind": "predict_pdf", "params": {"pdf_path": "a.pdf"}}))).unwrap();
        let id = reply["task_id"].as_str().unwrap().to_string();
        assert_eq!(rx.try_recv().unwrap(), id);

        let status = handle_task_status(&state, &obj(json!({"task_id": id}))).unwrap();
        assert_eq!(status["task"]["status"], "queued");
        assert_eq!(status["task"]["kind"], "predict_pdf");
        assert_eq!(state.task_params(&id).unwrap()["pdf_path"], "a.pdf");

        for _ in 0..2 {
            let cancel = handle_task_cancel(&state, &obj(json!({"task_id": id}))).unwrap();
            assert_eq!(cancel["task_id"], id.as_str());
        }
        let status = handle_task_status(&state, &obj(json!({"task_id": id}))).unwrap();
        assert_eq!(status["task"]["cancel_requested"], true);
        assert_eq!(status["task"]["status"], "cancelled");
    }

    #[test]
    fn unknown_kind_and_unknown_id() {
        let (state, rx) = DaemonState::new("", stub_services(1));
        let err = handle_task_submit(&state, &obj(json!({"kind": "transcode"}))).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::TaskKindUnsupported);
        assert_eq!(err.downcast_ref::<TaskError>().unwrap().details().unwrap()["kind"], "transcode");
        assert!(rx.try_recv().is_err());

        let err = handle_task_status(&state, &obj(json!({"task_id": "deadbeef"}))).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::TaskNotFound);
        assert_eq!(err.to_string(), "task not found: deadbeef");
        let err = handle_task_cancel(&state, &obj(json!({"task_id": "deadbeef"}))).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::TaskNotFound);
    }
}
