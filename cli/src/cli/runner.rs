// cli/src/cli/runner.rs
use crate::client::{DaemonClient, WaitOptions};
use anyhow::{anyhow, Context, Result};
use colored::*;
use serde_json::{Map, Value};
use snipper_core::utils::models::{TaskKind, TaskRequest};
use snipper_daemon::daemon::tasks;
use snipper_daemon::{DaemonState, Services};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Selects the in-process engine when set to `0/false/no/off`.
pub const USE_DAEMON_ENV: &str = "LATEXSNIPPER_USE_DAEMON";

/// Only an explicit "off" value disables the daemon.
pub fn use_daemon_from(raw: Option<&str>) -> bool {
    match raw {
        Some(v) => !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off"),
        None => true,
    }
}

/// Runs tasks either through a spawned daemon or on an in-process engine.
pub enum TaskRunner {
    Daemon(DaemonClient),
    Local { state: DaemonState, _queue: Receiver<String> },
}

/// "finished at HH:MM:SS after N.Ns" from the snapshot timestamps.
fn finished_line(task: &Map<String, Value>) -> Option<String> {
    let ended = task.get("ended_at").and_then(Value::as_f64).filter(|t| *t > 0.0)?;
    let started = task.get("started_at").and_then(Value::as_f64).filter(|t| *t > 0.0).unwrap_or(ended);
    let at = chrono::DateTime::from_timestamp(ended as i64, 0)?.with_timezone(&chrono::Local);
    Some(format!("finished at {} after {:.1}s", at.format("%H:%M:%S"), ended - started))
}

fn print_progress(current: u64, total: u64) {
    if total > 0 {
        println!("{} progress {}/{}", "[INFO]".blue(), current, total);
    }
}

impl TaskRunner {
    pub fn daemon(model: &str, config: Option<PathBuf>) -> Result<TaskRunner> {
        let client = DaemonClient::new(model)
            .context("Failed to reserve a daemon port")?
            .with_daemon_config(config);
        Ok(TaskRunner::Daemon(client))
    }

    pub fn local(deps_dir: Option<PathBuf>, mirror: bool) -> TaskRunner {
        let (state, queue) = DaemonState::new("", Services::production(deps_dir, mirror));
        TaskRunner::Local { state, _queue: queue }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, TaskRunner::Local { .. })
    }

    /// Runs one task to completion and returns its `output`.
    pub fn run(&mut self, kind: TaskKind, params: Map<String, Value>, timeout: Duration) -> Result<Map<String, Value>> {
        match self {
            TaskRunner::Daemon(client) => {
                client.start(None).context("Failed to start the daemon")?;
                let task_id = client.submit_task(kind.as_str(), Value::Object(params))?;
                println!("{} submitted {} task {}", "[INFO]".blue(), kind.as_str(), task_id.cyan());
                let opts = WaitOptions { timeout, ..WaitOptions::default() };
                let mut task = client.wait_task(&task_id, opts, |c, t, _| print_progress(c, t), || false)?;
                if let Some(line) = finished_line(&task) {
                    println!("{} task {} {}", "[INFO]".blue(), task_id.cyan(), line);
                }
                match task.remove("output") {
                    Some(Value::Object(output)) => Ok(output),
                    _ => Err(anyhow!("task {} finished without output", task_id)),
                }
            }
            TaskRunner::Local { state, .. } => {
                let request = TaskRequest::parse(kind, &params)?;
                let task_id = state.create_task(kind, params);
                let output = tasks::run(state, &task_id, &request)?;
                if let Some(task) = state.task(&task_id) {
                    print_progress(task.progress_current, task.progress_total);
                }
                Ok(output)
            }
        }
    }

    pub fn shutdown(&mut self) {
        match self {
            TaskRunner::Daemon(client) => client.stop(false),
            TaskRunner::Local { state, .. } => state.begin_stop(),
        }
    }
}
