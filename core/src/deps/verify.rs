// core/src/deps/verify.rs
use super::context::{InstallObserver, InstallerContext};
use super::layers::{layer_names, Layer};
use super::state::{state_path, DepsState};
use super::torch_env::{detect_torch_info, TorchInfo};
use crate::error::{TaskError, TaskResult};
use crate::rpc::message::ErrorCode;
use crate::utils::process::run_captured;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

const VERIFY_TAIL_LINES: usize = 15;
const SMOKE_TAIL_LINES: usize = 12;

const BASIC_PROBE: &str = "import numpy\nimport PIL\nimport requests\nimport lxml\nprint('BASIC OK')\n";

const CORE_PROBE: &str =
    "import pix2text\nimport latex2mathml.converter\nimport matplotlib\nimport fitz\nprint('CORE OK')\n";

const HEAVY_CPU_PROBE: &str = "import torch\nprint('torch version:', torch.__version__)\nprint('HEAVY_CPU OK')\n";

const HEAVY_GPU_PROBE: &str = "import torch\n\
if not torch.cuda.is_available():\n    raise RuntimeError('CUDA not available')\n\
print('CUDA device:', torch.cuda.get_device_name(0))\nprint('HEAVY_GPU OK')\n";

// Builds a real model; only used when verification is forced.
const CORE_STRICT_PROBE: &str = "from PIL import Image\nfrom pix2text import Pix2Text\n\
img = Image.new('RGB', (64, 64), (255, 255, 255))\nmodel = Pix2Text()\nprint('CORE STRICT OK')\n";

const TORCH_STACK_SMOKE: &str = "import torch\n\
import torchvision\n\
from torchvision import extension as _tv_ext\n\
from torchvision import ops as _tv_ops\n\
if not getattr(_tv_ext, '_HAS_OPS', False):\n    raise RuntimeError('torchvision ops backend not loaded')\n\
boxes = torch.tensor([[0.0, 0.0, 10.0, 10.0]], dtype=torch.float32)\n\
scores = torch.tensor([0.9], dtype=torch.float32)\n\
_ = _tv_ops.nms(boxes, scores, 0.5)\n\
print('torch', torch.__version__)\n\
print('torchvision', torchvision.__version__)\n";

fn probe_code(layer: Layer, strict: bool) -> &'static str {
    match (layer, strict) {
        (Layer::Core, true) => CORE_STRICT_PROBE,
        (Layer::Basic, _) => BASIC_PROBE,
        (Layer::Core, false) => CORE_PROBE,
        (Layer::HeavyCpu, _) => HEAVY_CPU_PROBE,
        (Layer::HeavyGpu, _) => HEAVY_GPU_PROBE,
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Runs `code` in the target interpreter; the error is the useful tail.
fn run_probe(pyexe: &Path, code: &str, timeout: Duration, tail: usize, timeout_msg: &str) -> Result<(), String> {
    let mut cmd = Command::new(pyexe);
    cmd.arg("-c").arg(code).env("PYTHONUTF8", "1").env("PYTHONIOENCODING", "utf-8");
    match run_captured(&mut cmd, timeout) {
        Ok(out) if out.success() => Ok(()),
        Ok(out) if out.timed_out => Err(timeout_msg.to_string()),
        Ok(out) => {
            let text = out.combined().replace('\r', "");
            if text.is_empty() {
                Err(format!("probe exited with {:?} and printed nothing", out.code))
            } else {
                Err(last_lines(&text, tail))
            }
        }
        Err(e) => Err(e.to_string()),
    }
}

/// Import probe for one layer. Strict probes get at least the strict timeout.
pub fn verify_layer(ctx: &InstallerContext, pyexe: &Path, layer: Layer, strict: bool) -> Result<(), String> {
    let mut timeout = ctx.timeouts.verify;
    if strict && layer == Layer::Core {
        timeout = timeout.max(ctx.timeouts.strict_verify);
    }
    run_probe(pyexe, probe_code(layer, strict), timeout, VERIFY_TAIL_LINES, "verify timeout")
}

/// Imports torch and torchvision and runs one `nms` call to catch ABI
/// mismatches that a bare import misses.
pub fn torch_stack_smoke(ctx: &InstallerContext, pyexe: &Path) -> Result<(), String> {
    run_probe(pyexe, TORCH_STACK_SMOKE, ctx.timeouts.smoke, SMOKE_TAIL_LINES, "torch stack verify timeout")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub verified: Vec<Layer>,
    pub failed: BTreeMap<Layer, String>,
}

impl VerifyReport {
    pub fn failed_layers(&self) -> Vec<Layer> {
        self.failed.keys().copied().collect()
    }

    pub fn failures_value(&self) -> Value {
        let map: Map<String, Value> = self
            .failed
            .iter()
            .map(|(l, msg)| (l.as_str().to_string(), Value::String(msg.chars().take(1200).collect())))
            .collect();
        Value::Object(map)
    }
}

pub fn verify_layers(
    ctx: &InstallerContext,
    pyexe: &Path,
    layers: &[Layer],
    strict: bool,
    observer: &dyn InstallObserver,
) -> VerifyReport {
    let mut report = VerifyReport::default();
    for layer in layers {
        match verify_layer(ctx, pyexe, *layer, strict) {
            Ok(()) => {
                observer.log(&format!("[OK] {} verified", layer));
                report.verified.push(*layer);
            }
            Err(msg) => {
                let short: String = msg.chars().take(200).collect();
                observer.log(&format!("[WARN] {} verification failed: {}", layer, short));
                report.failed.insert(*layer, msg);
            }
        }
    }
    report
}

/// Torch expectations of a HEAVY layer.
pub fn check_torch_info(layer: Layer, info: &TorchInfo) -> TaskResult<()> {
    let fail = |msg: String| Err(TaskError::rpc(msg, ErrorCode::TaskRuntimeError).with_details(json!({"torch_info": info.to_value()})));
    match layer {
        Layer::HeavyCpu | Layer::HeavyGpu if !info.present => fail(format!("torch not importable after {} install", layer)),
        Layer::HeavyGpu if !info.cuda_available => fail("HEAVY_GPU verify failed: CUDA not available".to_string()),
        _ => Ok(()),
    }
}

/// Final gate: probes each chosen layer, records the truthful split in the
/// state file and fails when any chosen layer did not verify.
pub fn verify_and_record(
    ctx: &InstallerContext,
    pyexe: &Path,
    deps_dir: &Path,
    chosen: &[Layer],
    strict: bool,
    observer: &dyn InstallObserver,
) -> TaskResult<DepsState> {
    let mut report = verify_layers(ctx, pyexe, chosen, strict, observer);

    let mut torch_error = None;
    if let Some(heavy) = chosen.iter().copied().find(|l| l.is_heavy() && report.verified.contains(l)) {
        let info = detect_torch_info(pyexe, ctx.timeouts.torch_info, None);
        if let Err(err) = check_torch_info(heavy, &info) {
            report.verified.retain(|l| *l != heavy);
            report.failed.insert(heavy, err.to_string());
            torch_error = Some(err);
        }
    }

    let path = state_path(deps_dir);
    let mut state = DepsState::load_sanitized(&path)?;
    state.merge(&report.verified, &report.failed_layers());
    state.save(&path)?;

    let summary = json!({
        "verify_fail": report.failures_value(),
        "layers": layer_names(chosen),
        "installed_layers": layer_names(&state.installed_layers),
        "failed_layers": layer_names(&state.failed_layers),
    });
    if let Some(err) = torch_error {
        return Err(err.with_details(summary));
    }
    if !report.failed.is_empty() {
        let names = layer_names(&report.failed_layers()).join(", ");
        return Err(TaskError::rpc(
            format!("layer verification failed after dependency install: {}", names),
            ErrorCode::TaskRuntimeError,
        )
        .with_details(summary));
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_only_changes_core() {
        assert_eq!(probe_code(Layer::Core, true), CORE_STRICT_PROBE);
        assert_eq!(probe_code(Layer::Basic, true), BASIC_PROBE);
        assert!(probe_code(Layer::HeavyGpu, false).contains("cuda.is_available"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = (1..=20).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(last_lines(&text, 3), "18\n19\n20");
        assert_eq!(last_lines("a", 15), "a");
    }

    #[test]
    fn torch_info_expectations() {
        let absent = TorchInfo::default();
        let err = check_torch_info(Layer::HeavyCpu, &absent).unwrap_err();
        assert_eq!(err.to_string(), "torch not importable after HEAVY_CPU install");
        assert!(err.details().unwrap().contains_key("torch_info"));

        let cpu = TorchInfo { present: true, mode: "cpu".into(), ..Default::default() };
        assert!(check_torch_info(Layer::HeavyCpu, &cpu).is_ok());
        let err = check_torch_info(Layer::HeavyGpu, &cpu).unwrap_err();
        assert_eq!(err.to_string(), "HEAVY_GPU verify failed: CUDA not available");
        assert!(check_torch_info(Layer::Basic, &absent).is_ok());
    }
}
