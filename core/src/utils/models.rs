// core/src/utils/models.rs
use crate::deps::layers::{normalize_layers, Layer};
use crate::error::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_MODEL_NAME: &str = "pix2text";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error | TaskStatus::Cancelled)
    }

    /// queued -> running -> terminal; queued may also end directly.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (_, TaskStatus::Queued) => false,
            (TaskStatus::Queued, _) => true,
            (TaskStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    PredictImage,
    PredictPdf,
    InstallDeps,
    SwitchCpuGpu,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::PredictImage,
        TaskKind::PredictPdf,
        TaskKind::InstallDeps,
        TaskKind::SwitchCpuGpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::PredictImage => "predict_image",
            TaskKind::PredictPdf => "predict_pdf",
            TaskKind::InstallDeps => "install_deps",
            TaskKind::SwitchCpuGpu => "switch_cpu_gpu",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskKind> {
        TaskKind::ALL.into_iter().find(|k| k.as_str() == raw.trim())
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Typed task parameters ---

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Path(PathBuf),
    Base64(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictImageParams {
    pub source: ImageSource,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictPdfParams {
    pub pdf_path: PathBuf,
    /// 0 means every page.
    pub max_pages: u32,
    pub model_name: String,
    pub output_format: String,
    pub dpi: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallDepsParams {
    pub layers: Vec<Layer>,
    pub deps_dir: Option<PathBuf>,
    pub mirror: bool,
    pub force_verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeTarget {
    Cpu,
    Gpu,
}

impl ComputeTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeTarget::Cpu => "cpu",
            ComputeTarget::Gpu => "gpu",
        }
    }

    pub fn heavy_layer(&self) -> Layer {
        match self {
            ComputeTarget::Cpu => Layer::HeavyCpu,
            ComputeTarget::Gpu => Layer::HeavyGpu,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchParams {
    pub target: ComputeTarget,
    pub cuda_tag: Option<String>,
    pub deps_dir: Option<PathBuf>,
    pub mirror: bool,
}

/// A submitted task with its parameters decoded for its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRequest {
    PredictImage(PredictImageParams),
    PredictPdf(PredictPdfParams),
    InstallDeps(InstallDepsParams),
    SwitchCpuGpu(SwitchParams),
}

const TRUTHY: [&str; 8] = ["1", "true", "yes", "on", "mirror", "tuna", "tsinghua", "cn"];

/// Truthiness used by boolean-ish task params.
pub fn param_flag(params: &Map<String, Value>, key: &str) -> bool {
    match params.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Some(Value::String(s)) => TRUTHY.contains(&s.trim().to_lowercase().as_str()),
        _ => false,
    }
}

/// Trimmed string param; empty strings count as absent.
pub fn param_str(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer param accepting numbers or numeric strings.
pub fn param_u64(params: &Map<String, Value>, key: &str, default: u64) -> TaskResult<u64> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
            .or_else(|| n.as_i64().map(|_| 0))
            .ok_or_else(|| TaskError::invalid_params(format!("{} must be a non-negative integer", key))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(default),
        Some(Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(v) => Ok(v.max(0) as u64),
            Err(_) => Err(TaskError::invalid_params(format!("{} must be an integer: {}", key, s))),
        },
        Some(_) => Err(TaskError::invalid_params(format!("{} must be an integer", key))),
    }
}

fn model_name(params: &Map<String, Value>) -> String {
    param_str(params, "model_name").unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string())
}

impl TaskRequest {
    /// Decodes raw params for `kind`. Validation failures become task errors.
    pub fn parse(kind: TaskKind, params: &Map<String, Value>) -> TaskResult<TaskRequest> {
        match kind {
            TaskKind::PredictImage => {
                let source = if let Some(path) = param_str(params, "image_path") {
                    ImageSource::Path(PathBuf::from(path))
                } else if let Some(b64) = param_str(params, "image_b64") {
                    ImageSource::Base64(b64)
                } else {
                    return Err(TaskError::invalid_params("image_path/image_b64 missing"));
                };
                Ok(TaskRequest::PredictImage(PredictImageParams { source, model_name: model_name(params) }))
            }
            TaskKind::PredictPdf => {
                let pdf_path = param_str(params, "pdf_path")
                    .map(PathBuf::from)
                    .ok_or_else(|| TaskError::invalid_params("pdf_path missing"))?;
                let output_format = param_str(params, "output_format")
                    .map(|s| s.to_lowercase())
                    .unwrap_or_else(|| "markdown".to_string());
                Ok(TaskRequest::PredictPdf(PredictPdfParams {
                    pdf_path,
                    max_pages: param_u64(params, "max_pages", 0)?.min(u32::MAX as u64) as u32,
                    model_name: model_name(params),
                    output_format,
                    dpi: param_u64(params, "dpi", 200)?.clamp(36, 1200) as u32,
                }))
            }
            TaskKind::InstallDeps => Ok(TaskRequest::InstallDeps(InstallDepsParams {
                layers: normalize_layers(params.get("layers"))?,
                deps_dir: param_str(params, "deps_dir").map(PathBuf::from),
                mirror: param_flag(params, "mirror"),
                force_verify: param_flag(params, "force_verify"),
            })),
            TaskKind::SwitchCpuGpu => {
                let raw = param_str(params, "target").unwrap_or_default().to_lowercase();
                let target = match raw.as_str() {
                    "cpu" => ComputeTarget::Cpu,
                    "gpu" => ComputeTarget::Gpu,
                    _ => {
                        return Err(TaskError::invalid_params("target must be 'cpu' or 'gpu'")
                            .with_details(serde_json::json!({"target": raw})))
                    }
                };
                Ok(TaskRequest::SwitchCpuGpu(SwitchParams {
                    target,
                    cuda_tag: param_str(params, "cuda_tag").map(|s| s.to_lowercase()),
                    deps_dir: param_str(params, "deps_dir").map(PathBuf::from),
                    mirror: param_flag(params, "mirror"),
                }))
            }
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRequest::PredictImage(_) => TaskKind::PredictImage,
            TaskRequest::PredictPdf(_) => TaskKind::PredictPdf,
            TaskRequest::InstallDeps(_) => TaskKind::InstallDeps,
            TaskRequest::SwitchCpuGpu(_) => TaskKind::SwitchCpuGpu,
        }
    }
}

// --- Task record as exchanged on the wire ---

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub started_at: f64,
    #[serde(default)]
    pub ended_at: f64,
    #[serde(default)]
    pub progress_current: u64,
    #[serde(default)]
    pub progress_total: u64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl TaskSnapshot {
    pub fn new(task_id: impl Into<String>, kind: TaskKind, created_at: f64) -> Self {
        TaskSnapshot {
            task_id: task_id.into(),
            kind,
            status: TaskStatus::Queued,
            created_at,
            started_at: 0.0,
            ended_at: 0.0,
            progress_current: 0,
            progress_total: 0,
            error: String::new(),
            error_type: String::new(),
            error_code: String::new(),
            details: Map::new(),
            output: Map::new(),
            cancel_requested: false,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            log::warn!(
                "task_transition_rejected task_id={} from={} to={}",
                self.task_id,
                self.status,
                next
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn mark_running(&mut self, now: f64) -> bool {
        if !self.transition(TaskStatus::Running) {
            return false;
        }
        self.started_at = now;
        self.error.clear();
        self.error_type.clear();
        self.error_code.clear();
        self.output.clear();
        true
    }

    pub fn mark_success(&mut self, output: Map<String, Value>, now: f64) -> bool {
        if !self.transition(TaskStatus::Success) {
            return false;
        }
        self.ended_at = now;
        self.output = output;
        true
    }

    /// Records a failure; cancellation maps to `cancelled`, everything else to `error`.
    pub fn mark_failed(&mut self, err: &TaskError, now: f64) -> bool {
        let next = if err.is_cancelled() { TaskStatus::Cancelled } else { TaskStatus::Error };
        if !self.transition(next) {
            return false;
        }
        self.ended_at = now;
        self.output.clear();
        self.error = err.to_string();
        self.error_type = err.error_type().to_string();
        self.error_code = err.code().as_str().to_string();
        if let Some(details) = err.details() {
            self.merge_details(details.clone());
        }
        true
    }

    /// Neither field moves backwards within a task, and current never
    /// exceeds total.
    pub fn set_progress(&mut self, current: u64, total: u64) {
        self.progress_current = self.progress_current.max(current);
        self.progress_total = self.progress_total.max(total).max(self.progress_current);
    }

    pub fn merge_details(&mut self, patch: Map<String, Value>) {
        self.details.extend(patch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn status_transitions_are_one_way() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Success));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Error));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn terminal_state_is_reached_once() {
        let mut task = TaskSnapshot::new("t", TaskKind::PredictImage, 1.0);
        assert!(task.mark_running(2.0));
        assert!(task.mark_success(obj(json!({"result": "x"})), 3.0));
        assert!(!task.mark_failed(&TaskError::runtime("late"), 4.0));
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.error.is_empty());
        assert_eq!(task.output["result"], "x");
    }

    #[test]
    fn failure_fills_error_fields_only() {
        let mut task = TaskSnapshot::new("t", TaskKind::InstallDeps, 1.0);
        task.mark_running(2.0);
        task.merge_details(obj(json!({"log_tail": ["a"]})));
        let err = TaskError::rpc("locked", crate::rpc::message::ErrorCode::EnvFileLocked)
            .with_details(json!({"attempts": 2}));
        assert!(task.mark_failed(&err, 3.0));
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error_code, "ENV_FILE_LOCKED");
        assert!(task.output.is_empty());
        assert_eq!(task.details["attempts"], 2);
        assert_eq!(task.details["log_tail"], json!(["a"]));

        let mut cancelled = TaskSnapshot::new("c", TaskKind::PredictPdf, 1.0);
        cancelled.mark_running(2.0);
        cancelled.mark_failed(&TaskError::Cancelled, 3.0);
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.error, "cancelled");
        assert_eq!(cancelled.error_type, "CancelledError");
        assert_eq!(cancelled.error_code, "TASK_CANCELLED");
    }

    #[test]
    fn progress_is_monotonic() {
        let mut task = TaskSnapshot::new("t", TaskKind::PredictPdf, 1.0);
        task.set_progress(3, 10);
        task.set_progress(1, 10);
        assert_eq!((task.progress_current, task.progress_total), (3, 10));
    }

    #[test]
    fn progress_total_never_shrinks() {
        let mut task = TaskSnapshot::new("t", TaskKind::InstallDeps, 1.0);
        task.set_progress(3, 5);
        task.set_progress(0, 2);
        assert_eq!((task.progress_current, task.progress_total), (3, 5));
        task.set_progress(1, 1);
        assert_eq!((task.progress_current, task.progress_total), (3, 5));
        task.set_progress(99, 100);
        assert_eq!((task.progress_current, task.progress_total), (99, 100));
    }

    #[test]
    fn snapshot_wire_names() {
        let task = TaskSnapshot::new("abc", TaskKind::SwitchCpuGpu, 5.5);
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["kind"], "switch_cpu_gpu");
        assert_eq!(value["status"], "queued");
        assert_eq!(value["details"], json!({}));
        let back: TaskSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn parse_predict_image_params() {
        let req = TaskRequest::parse(TaskKind::PredictImage, &obj(json!({"image_path": "/tmp/a.png"}))).unwrap();
        assert_eq!(
            req,
            TaskRequest::PredictImage(PredictImageParams {
                source: ImageSource::Path(PathBuf::from("/tmp/a.png")),
                model_name: "pix2text".into(),
            })
        );
        let err = TaskRequest::parse(TaskKind::PredictImage, &Map::new()).unwrap_err();
        assert_eq!(err.to_string(), "image_path/image_b64 missing");
    }

    #[test]
    fn parse_pdf_params_with_strings() {
        let req = TaskRequest::parse(
            TaskKind::PredictPdf,
            &obj(json!({"pdf_path": "a.pdf", "max_pages": "3", "output_format": "LaTeX"})),
        )
        .unwrap();
        match req {
            TaskRequest::PredictPdf(p) => {
                assert_eq!(p.max_pages, 3);
                assert_eq!(p.dpi, 200);
                assert_eq!(p.output_format, "latex");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_switch_rejects_unknown_target() {
        let err = TaskRequest::parse(TaskKind::SwitchCpuGpu, &obj(json!({"target": "tpu"}))).unwrap_err();
        assert_eq!(err.to_string(), "target must be 'cpu' or 'gpu'");
        assert_eq!(err.details().unwrap()["target"], "tpu");
    }

    #[test]
    fn mirror_flag_accepts_aliases() {
        assert!(param_flag(&obj(json!({"mirror": "Tuna"})), "mirror"));
        assert!(param_flag(&obj(json!({"mirror": true})), "mirror"));
        assert!(!param_flag(&obj(json!({"mirror": "official"})), "mirror"));
        assert!(!param_flag(&Map::new(), "mirror"));
    }
}
