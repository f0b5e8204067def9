// daemon/src/daemon/worker.rs
use crate::daemon::state::DaemonState;
use crate::daemon::tasks;
use log::{error, info, warn};
use snipper_core::error::TaskError;
use snipper_core::utils::models::{TaskRequest, TaskStatus};
use snipper_core::utils::now_ts;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

const POLL: Duration = Duration::from_millis(200);

/// Drains the task queue one task at a time until the daemon stops or the
/// queue is closed.
pub fn run_worker(state: DaemonState, rx: Receiver<String>) {
    info!("task worker started");
    loop {
        if state.is_stopping() {
            break;
        }
        match rx.recv_timeout(POLL) {
            Ok(task_id) => run_one(&state, &task_id),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("task worker stopped");
}

fn run_one(state: &DaemonState, task_id: &str) {
    let Some(params) = state.task_params(task_id) else {
        warn!("dequeued unknown task {}", task_id);
        return;
    };

    // Cancelled while still queued: never starts.
    let started = state.update_task(task_id, |t| {
        if t.cancel_requested {
            t.mark_failed(&TaskError::Cancelled, now_ts());
            None
        } else if t.mark_running(now_ts()) {
            Some(t.kind)
        } else {
            None
        }
    });
    let kind = match started.flatten() {
        Some(kind) => kind,
        None => {
            if state.task(task_id).map(|t| t.status) == Some(TaskStatus::Cancelled) {
                info!("task_cancelled task_id={} stage=queued", task_id);
            }
            return;
        }
    };
    info!("task_started task_id={} kind={}", task_id, kind.as_str());

    let result = TaskRequest::parse(kind, &params).and_then(|request| {
        panic::catch_unwind(AssertUnwindSafe(|| tasks::run(state, task_id, &request)))
            .unwrap_or_else(|_| Err(TaskError::runtime("task panicked")))
    });

    match result {
        Ok(output) => {
            state.update_task(task_id, |t| t.mark_success(output, now_ts()));
            info!("task_succeeded task_id={} kind={}", task_id, kind.as_str());
        }
        Err(err) if err.is_cancelled() => {
            state.update_task(task_id, |t| t.mark_failed(&err, now_ts()));
            info!("task_cancelled task_id={} kind={}", task_id, kind.as_str());
        }
        Err(err) => {
            state.update_task(task_id, |t| t.mark_failed(&err, now_ts()));
            error!(
                "task_failed task_id={} kind={} error_code={} error_type={} error={}",
                task_id,
                kind.as_str(),
                err.code(),
                err.error_type(),
                err
            );
        }
    }
}
