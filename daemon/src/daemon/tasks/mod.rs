// daemon/src/daemon/tasks/mod.rs
pub mod deps;
pub mod log_tail;
pub mod predict;

use crate::daemon::state::DaemonState;
use serde_json::{Map, Value};
use snipper_core::error::{TaskError, TaskResult};
use snipper_core::utils::models::TaskRequest;

/// Fails with `Cancelled` once the task has been flagged.
pub(crate) fn check_cancel(state: &DaemonState, task_id: &str) -> TaskResult<()> {
    if state.should_cancel(task_id) {
        return Err(TaskError::Cancelled);
    }
    Ok(())
}

/// Runs one task body to completion and returns its `output`.
pub fn run(state: &DaemonState, task_id: &str, request: &TaskRequest) -> TaskResult<Map<String, Value>> {
    match request {
        TaskRequest::PredictImage(params) => predict::predict_image(state, task_id, params),
        TaskRequest::PredictPdf(params) => predict::predict_pdf(state, task_id, params),
        TaskRequest::InstallDeps(params) => deps::install_deps(state, task_id, params),
        TaskRequest::SwitchCpuGpu(params) => deps::switch_cpu_gpu(state, task_id, params),
    }
}
