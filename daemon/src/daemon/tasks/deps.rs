// daemon/src/daemon/tasks/deps.rs
//! Dependency-layer installs run as tasks: gates, install attempts with the
//! file-lock retry, then the verification gate that records the state file.

use super::log_tail::TaskLogTail;
use crate::daemon::state::DaemonState;
use serde_json::{json, Map, Value};
use snipper_core::deps::cuda::plan_for_tag;
use snipper_core::deps::diagnose::classify_install_failure;
use snipper_core::deps::installer::{ensure_env_not_in_use, ensure_pip};
use snipper_core::deps::layers::layer_names;
use snipper_core::deps::python::{cleanup_torch_leftovers, resolve_python_for_deps};
use snipper_core::deps::verify::verify_and_record;
use snipper_core::deps::{resolve_plan, DepsState, InstallObserver, Layer, LayerInstaller};
use snipper_core::error::{TaskError, TaskResult};
use snipper_core::rpc::message::ErrorCode;
use snipper_core::utils::models::{InstallDepsParams, SwitchParams};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 2;
const LOCK_BACKOFF: Duration = Duration::from_millis(1200);
const FAILURE_TAIL_LINES: usize = 40;

struct InstallRequest<'a> {
    layers: &'a [Layer],
    deps_dir: Option<&'a Path>,
    mirror: bool,
    strict: bool,
    cuda_tag: Option<&'a str>,
}

struct InstallSummary {
    python: PathBuf,
    deps_dir: PathBuf,
    layers: Vec<Layer>,
    cuda_tag: &'static str,
    state: DepsState,
}

fn to_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn same_interpreter(a: &Path, b: &Path) -> bool {
    let norm = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    norm(a) == norm(b)
}

/// The daemon's own inference worker must not hold the interpreter being changed.
fn release_own_worker(state: &DaemonState, pyexe: &Path) -> TaskResult<()> {
    let Some(Some((worker_pid, worker_python))) = state.with_existing_wrapper(|w| w.worker()) else {
        return Ok(());
    };
    if !same_interpreter(&worker_python, pyexe) {
        return Ok(());
    }
    log::info!("stopping inference worker pid={} before touching {}", worker_pid, pyexe.display());
    let stopped = state.with_existing_wrapper(|w| w.stop_worker()).unwrap_or(true);
    if stopped {
        return Ok(());
    }
    Err(TaskError::rpc(
        "daemon runtime already loaded torch stack; restart daemon and retry install",
        ErrorCode::DaemonEnvLocked,
    )
    .with_details(json!({"worker_pid": worker_pid, "pid": std::process::id()})))
}

fn note_leftovers(state: &DaemonState, task_id: &str, pyexe: &Path) {
    let removed = cleanup_torch_leftovers(pyexe);
    if removed.is_empty() {
        return;
    }
    let shown: Vec<String> = removed.iter().rev().take(20).rev().map(|p| p.display().to_string()).collect();
    state.merge_details(task_id, to_object(json!({"cleaned_leftovers": shown})));
}

fn install_layers(state: &DaemonState, task_id: &str, req: InstallRequest<'_>) -> TaskResult<InstallSummary> {
    let services = state.services();
    let ctx = &services.installer;
    let deps_dir = req.deps_dir.or(services.deps_dir.as_deref());
    let (python, deps_dir) = resolve_python_for_deps(deps_dir)?;
    let plan = resolve_plan(req.layers, ctx.gpu_plan(), req.cuda_tag, req.mirror)?;
    log::info!(
        "install_plan task_id={} layers={} torch={} python={}",
        task_id,
        layer_names(&plan.layers).join(","),
        plan.torch,
        python.display()
    );

    ensure_pip(ctx, &python)?;
    release_own_worker(state, &python)?;
    ensure_env_not_in_use(&python)?;
    note_leftovers(state, task_id, &python);

    let tail = TaskLogTail::new(state, task_id);
    let mut attempt = 1;
    let failure = loop {
        tail.log(&format!("[INFO] install attempt {}/{}", attempt, MAX_ATTEMPTS));
        let outcome = LayerInstaller::new(ctx, &python, &deps_dir, &tail).run(&plan);
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                tail.flush();
                return Err(err);
            }
        };
        if outcome.all_ok() {
            break None;
        }
        let (primary, code) = classify_install_failure(&tail.lines());
        if code == ErrorCode::EnvFileLocked && attempt < MAX_ATTEMPTS {
            tail.log("[WARN] install hit a file lock, retrying once after a short backoff");
            thread::sleep(LOCK_BACKOFF);
            cleanup_torch_leftovers(&python);
            attempt += 1;
            continue;
        }
        break Some((primary, code));
    };
    tail.flush();

    if let Some((primary, code)) = failure {
        state.set_progress(task_id, 99, 100);
        let lines = tail.lines();
        let recent = &lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..];
        return Err(TaskError::rpc(format!("dependency install failed: {}", primary), code).with_details(json!({
            "layers": layer_names(&plan.layers),
            "primary_error": primary,
            "log_tail": recent.join("\n"),
            "attempts": attempt,
        })));
    }

    let recorded = verify_and_record(ctx, &python, &deps_dir, &plan.layers, req.strict, &tail);
    tail.flush();
    let recorded = recorded.inspect_err(|_| state.set_progress(task_id, 99, 100))?;
    state.set_progress(task_id, 100, 100);
    Ok(InstallSummary { python, deps_dir, cuda_tag: plan.cuda_tag(), layers: plan.layers, state: recorded })
}

pub fn install_deps(state: &DaemonState, task_id: &str, params: &InstallDepsParams) -> TaskResult<Map<String, Value>> {
    let mirror = params.mirror || state.services().mirror;
    let summary = install_layers(
        state,
        task_id,
        InstallRequest {
            layers: &params.layers,
            deps_dir: params.deps_dir.as_deref(),
            mirror,
            strict: params.force_verify,
            cuda_tag: None,
        },
    )?;
    Ok(to_object(json!({
        "message": "dependencies installed",
        "deps_dir": summary.deps_dir.display().to_string(),
        "layers": layer_names(&summary.layers),
        "installed_layers": layer_names(&summary.state.installed_layers),
        "failed_layers": layer_names(&summary.state.failed_layers),
        "python": summary.python.display().to_string(),
        "mirror": if mirror { "tuna" } else { "official" },
    })))
}

pub fn switch_cpu_gpu(state: &DaemonState, task_id: &str, params: &SwitchParams) -> TaskResult<Map<String, Value>> {
    if let Some(tag) = params.cuda_tag.as_deref() {
        if plan_for_tag(tag).is_none() {
            return Err(TaskError::invalid_params(format!("unsupported cuda_tag: {}", tag))
                .with_details(json!({"cuda_tag": tag})));
        }
    }
    let summary = install_layers(
        state,
        task_id,
        InstallRequest {
            layers: &[params.target.heavy_layer()],
            deps_dir: params.deps_dir.as_deref(),
            mirror: params.mirror || state.services().mirror,
            strict: true,
            cuda_tag: params.cuda_tag.as_deref(),
        },
    )?;
    Ok(to_object(json!({
        "message": format!("switched to {}", params.target.as_str()),
        "target": params.target.as_str(),
        "cuda_tag": summary.cuda_tag,
        "deps_dir": summary.deps_dir.display().to_string(),
        "layers": layer_names(&summary.layers),
        "installed_layers": layer_names(&summary.state.installed_layers),
        "failed_layers": layer_names(&summary.state.failed_layers),
        "python": summary.python.display().to_string(),
    })))
}
