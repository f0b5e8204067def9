// daemon/src/model/pix2text.rs
use super::worker_process::{extract_json, WorkerProcess};
use super::{ImageInput, RecognitionBackend, RecognitionMode};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use snipper_core::deps::python::resolve_python_for_deps;
use snipper_core::deps::torch_env::{inject_shared_torch_env, shared_torch_site_from_env};
use snipper_core::utils::process::run_captured;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(120);
const READY_TIMEOUT: Duration = Duration::from_secs(300);
const PREDICT_TIMEOUT: Duration = Duration::from_secs(300);

// Shared by the probe and the worker: makes a shared torch site importable.
const BOOTSTRAP_SHARED_TORCH: &str = r#"
def _bootstrap_shared_torch():
    import os, sys
    site = (os.environ.get('PIX2TEXT_SHARED_TORCH_SITE', '') or '').strip()
    if not (site and os.path.isdir(site)):
        return
    if site not in sys.path:
        sys.path.append(site)
    lib = os.path.join(site, 'torch', 'lib')
    if os.path.isdir(lib) and hasattr(os, 'add_dll_directory'):
        os.add_dll_directory(lib)
_bootstrap_shared_torch()
"#;

const PROBE_CODE: &str = r#"
import json
out = {"ok": False}
try:
    from importlib import metadata
    import pix2text
    out["ok"] = True
    out["version"] = metadata.version("pix2text")
except Exception as e:
    out["err"] = f"{e.__class__.__name__}: {e}"
print(json.dumps(out))
"#;

const WORKER_CODE: &str = r#"
import json, sys
from PIL import Image

def _pick_device():
    try:
        import torch
        return "cuda" if torch.cuda.is_available() else "cpu"
    except Exception:
        return "cpu"

def _build(dev, enable_table=False):
    from pix2text import Pix2Text
    try:
        return Pix2Text.from_config(device=dev, enable_table=enable_table)
    except Exception:
        return Pix2Text(device=dev, enable_table=enable_table)

def _as_text(obj):
    if isinstance(obj, str):
        return obj.strip()
    if isinstance(obj, dict):
        return str(obj.get("html") or obj.get("text") or obj)
    if isinstance(obj, list):
        parts = [str(i.get("text", i)) if isinstance(i, dict) else str(i) for i in obj]
        return " ".join(p.strip() for p in parts if p.strip())
    return str(obj)

def _run(model, table_model, img, mode):
    if mode == "text":
        return _as_text(model.recognize_text(img))
    if mode == "mixed":
        return _as_text(model.recognize(img))
    if mode == "page":
        return _as_text(model.recognize_page(img))
    if mode == "table":
        m = table_model if table_model is not None else model
        ocr = getattr(m, "table_ocr", None)
        if callable(ocr):
            return _as_text(ocr(img))
        return _as_text(m.recognize(img))
    return _as_text(model.recognize_formula(img))

model = None
table_model = None
device = _pick_device()
try:
    import warnings
    warnings.filterwarnings("ignore")
    model = _build(device)
    print(json.dumps({"ready": True, "ok": True, "device": device}), flush=True)
except Exception as e:
    print(json.dumps({"ready": True, "ok": False, "error": str(e)}), flush=True)

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    if line == "__quit__":
        break
    try:
        req = json.loads(line)
    except Exception:
        req = {"image": line, "mode": "formula"}
    if req.get("ping"):
        print(json.dumps({"ok": model is not None, "ready": model is not None}), flush=True)
        continue
    if model is None:
        print(json.dumps({"ok": False, "error": "pix2text not ready"}), flush=True)
        continue
    try:
        img = Image.open(req.get("image", ""))
    except Exception as e:
        print(json.dumps({"ok": False, "error": f"open image failed: {e}"}), flush=True)
        continue
    try:
        mode = req.get("mode", "formula")
        if mode == "table" and table_model is None:
            table_model = _build(device, enable_table=True)
        print(json.dumps({"ok": True, "result": _run(model, table_model, img, mode)}), flush=True)
    except Exception as e:
        print(json.dumps({"ok": False, "error": str(e)}), flush=True)
"#;

/// Runs pix2text in a resident worker process on the dependency interpreter.
pub struct Pix2TextBackend {
    deps_dir: Option<PathBuf>,
    python: Option<PathBuf>,
    worker: Option<WorkerProcess>,
    device: String,
    failure: Option<String>,
    scratch: Option<tempfile::TempDir>,
}

impl Pix2TextBackend {
    pub fn new(deps_dir: Option<PathBuf>) -> Self {
        Pix2TextBackend { deps_dir, python: None, worker: None, device: "cpu".to_string(), failure: None, scratch: None }
    }

    fn child_env() -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        let site = shared_torch_site_from_env().map(PathBuf::from);
        inject_shared_torch_env(&mut env, site.as_deref());
        env.insert("PYTHONUTF8".to_string(), "1".to_string());
        env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        env
    }

    fn python_command(python: &Path, code: &str) -> Command {
        let mut cmd = Command::new(python);
        cmd.arg("-u").arg("-c").arg(format!("{}{}", BOOTSTRAP_SHARED_TORCH, code));
        cmd.env_clear().envs(Self::child_env());
        cmd
    }

    fn probe(python: &Path) -> Result<String> {
        let out = run_captured(&mut Self::python_command(python, PROBE_CODE), PROBE_TIMEOUT)
            .context("pix2text probe could not start")?;
        if out.timed_out {
            bail!("pix2text probe timed out");
        }
        let info = out
            .stdout
            .lines()
            .rev()
            .find_map(extract_json)
            .ok_or_else(|| anyhow!("pix2text probe returned no JSON: {}", out.combined().chars().take(300).collect::<String>()))?;
        if info.get("ok").and_then(Value::as_bool) != Some(true) {
            bail!("{}", info.get("err").and_then(Value::as_str).unwrap_or("pix2text import failed"));
        }
        Ok(info.get("version").and_then(Value::as_str).unwrap_or("").to_string())
    }

    fn start(&mut self) -> Result<()> {
        let (python, _) = resolve_python_for_deps(self.deps_dir.as_deref()).map_err(|e| anyhow!("{}", e))?;
        let version = Self::probe(&python)?;
        log::info!("pix2text {} importable with {}", version, python.display());

        let worker = WorkerProcess::spawn(Self::python_command(&python, WORKER_CODE), READY_TIMEOUT)?;
        let hello = worker.hello();
        if hello.get("ok").and_then(Value::as_bool) != Some(true) {
            let err = hello.get("error").and_then(Value::as_str).unwrap_or("pix2text not ready").to_string();
            bail!("{}", err);
        }
        self.device = hello.get("device").and_then(Value::as_str).unwrap_or("cpu").to_string();
        log::info!("pix2text resident worker ready (pid={}, device={})", worker.pid(), self.device);
        self.python = Some(python);
        self.worker = Some(worker);
        Ok(())
    }

    /// The worker reads images from disk, so in-memory images are spilled first.
    fn image_path(&mut self, image: &ImageInput) -> Result<PathBuf> {
        if let Some(path) = &image.path {
            return Ok(path.clone());
        }
        if self.scratch.is_none() {
            self.scratch = Some(tempfile::Builder::new().prefix("latexsnipper-").tempdir()?);
        }
        let dir = self.scratch.as_ref().map(|d| d.path().to_path_buf()).unwrap_or_else(std::env::temp_dir);
        let path = dir.join(format!("{}.img", snipper_core::utils::new_hex_id()));
        fs::write(&path, &image.bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

impl RecognitionBackend for Pix2TextBackend {
    fn load(&mut self) -> Result<bool> {
        if self.worker.is_some() {
            return Ok(true);
        }
        if self.failure.is_some() {
            return Ok(false);
        }
        match self.start() {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("pix2text load failed: {:#}", e);
                self.failure = Some(format!("{:#}", e));
                Ok(false)
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.worker.is_some()
    }

    fn status_text(&self) -> String {
        match (&self.worker, &self.failure) {
            (Some(_), _) => format!("model ready (device={})", self.device),
            (None, Some(err)) => format!("model load failed: {}", err),
            (None, None) => "model not loaded".to_string(),
        }
    }

    fn predict(&mut self, image: &ImageInput, _model_name: &str, mode: RecognitionMode) -> Result<String> {
        let path = self.image_path(image)?;
        let worker = self.worker.as_mut().ok_or_else(|| anyhow!("pix2text not ready"))?;
        let reply = worker.request(&json!({"image": path, "mode": mode.as_str()}), PREDICT_TIMEOUT);
        if image.path.is_none() {
            let _ = fs::remove_file(&path);
        }
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                if !worker.is_alive() {
                    self.worker = None;
                }
                return Err(e);
            }
        };
        if reply.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(reply.get("result").and_then(Value::as_str).unwrap_or("").to_string())
        } else {
            bail!("{}", reply.get("error").and_then(Value::as_str).unwrap_or("pix2text error"))
        }
    }

    fn worker(&self) -> Option<(u32, PathBuf)> {
        let worker = self.worker.as_ref()?;
        Some((worker.pid(), self.python.clone()?))
    }

    fn stop_worker(&mut self) -> bool {
        if let Some(mut worker) = self.worker.take() {
            worker.terminate();
            return !worker.is_alive();
        }
        true
    }
}
