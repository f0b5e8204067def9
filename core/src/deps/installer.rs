// core/src/deps/installer.rs
use super::context::{InstallObserver, InstallerContext};
use super::cuda::{plan_for_tag, CudaPlan, TORCH_CPU_PLAN};
use super::layers::{
    auto_complete, check_exclusive, is_skipped_package, is_torch_family, layer_names, spec_name, Layer,
};
use super::pip::{
    install_captured, install_with_retries, installed_packages, manual_install_hint, uninstall, PipIndex, PipInstall,
};
use super::python::{processes_using_python, MAX_REPORTED_PROCESSES};
use super::verify::torch_stack_smoke;
use super::version::{spec_satisfied, torch_local_tag};
use crate::error::{TaskError, TaskResult};
use crate::rpc::message::ErrorCode;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;

const TORCH_TRIPLE: [&str; 3] = ["torch", "torchvision", "torchaudio"];

/// Pins applied after every install; pix2text's dependency tree tends to
/// pull these somewhere incompatible.
pub const CRITICAL_VERSIONS: [(&str, &str); 4] = [
    ("numpy", "numpy>=1.26.4,<2"),
    ("protobuf", "protobuf>=3.20,<5"),
    ("pydantic", "pydantic==2.9.2"),
    ("pydantic-core", "pydantic-core==2.23.4"),
];

/// Concrete install target derived from the requested layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallPlan {
    pub layers: Vec<Layer>,
    pub torch: CudaPlan,
    pub specs: Vec<String>,
    pub mirror: bool,
}

impl InstallPlan {
    pub fn wants_gpu(&self) -> bool {
        self.layers.contains(&Layer::HeavyGpu)
    }

    /// Whether the torch smoke test applies to this plan.
    pub fn touches_torch(&self) -> bool {
        self.layers.iter().any(|l| *l == Layer::Core || l.is_heavy())
    }

    pub fn cuda_tag(&self) -> &'static str {
        if self.torch.is_gpu() {
            self.torch.tag
        } else {
            ""
        }
    }

    pub fn torch_index(&self) -> PipIndex {
        PipIndex::Torch { url: self.torch.index_url(), extra_official: self.torch.is_gpu() }
    }

    pub fn index_for(&self, spec: &str) -> PipIndex {
        if is_torch_family(spec) {
            self.torch_index()
        } else {
            PipIndex::Default { mirror: self.mirror }
        }
    }
}

/// Resolves requested layers into pinned requirement specifiers. The same
/// input and CUDA state always yield the same plan.
pub fn resolve_plan(
    requested: &[Layer],
    gpu_plan: Option<&'static CudaPlan>,
    cuda_tag: Option<&str>,
    mirror: bool,
) -> TaskResult<InstallPlan> {
    let layers = auto_complete(requested, gpu_plan.is_some());
    check_exclusive(&layers)?;
    let want_gpu = layers.contains(&Layer::HeavyGpu);

    let torch = if want_gpu {
        match cuda_tag.map(str::trim).filter(|t| !t.is_empty()) {
            Some(tag) => *plan_for_tag(tag)
                .filter(|p| p.is_gpu())
                .ok_or_else(|| TaskError::invalid_params("unsupported cuda_tag").with_details(json!({"cuda_tag": tag})))?,
            None => *gpu_plan.ok_or_else(|| {
                TaskError::rpc("GPU plan unavailable", ErrorCode::TaskRuntimeError)
                    .with_details(json!({"reason": "no CUDA 11.8 or newer detected"}))
            })?,
        }
    } else {
        TORCH_CPU_PLAN
    };

    let mut specs: Vec<String> = Vec::new();
    for layer in &layers {
        for raw in layer.specs() {
            let name = spec_name(raw);
            if want_gpu && name == "onnxruntime" {
                continue;
            }
            if is_skipped_package(raw) {
                continue;
            }
            let spec = match name.as_str() {
                n if is_torch_family(n) => torch.spec_for(n).unwrap_or_else(|| raw.to_string()),
                "onnxruntime-gpu" => torch.onnxruntime_spec().to_string(),
                _ => raw.to_string(),
            };
            if !specs.contains(&spec) {
                specs.push(spec);
            }
        }
    }
    Ok(InstallPlan { layers, torch, specs, mirror })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    pub attempted: usize,
    pub skipped: Vec<String>,
    pub failed_packages: Vec<String>,
    pub runtime_ok: bool,
    pub runtime_error: String,
}

impl InstallOutcome {
    pub fn all_ok(&self) -> bool {
        self.failed_packages.is_empty() && self.runtime_ok
    }
}

/// Runs one install pass of a plan against one interpreter.
pub struct LayerInstaller<'a> {
    ctx: &'a InstallerContext,
    pyexe: &'a Path,
    deps_dir: &'a Path,
    observer: &'a dyn InstallObserver,
    force_reinstall: bool,
}

impl<'a> LayerInstaller<'a> {
    pub fn new(ctx: &'a InstallerContext, pyexe: &'a Path, deps_dir: &'a Path, observer: &'a dyn InstallObserver) -> Self {
        LayerInstaller { ctx, pyexe, deps_dir, observer, force_reinstall: false }
    }

    pub fn force_reinstall(mut self, yes: bool) -> Self {
        self.force_reinstall = yes;
        self
    }

    fn log(&self, line: impl AsRef<str>) {
        self.observer.log(line.as_ref());
    }

    fn check_cancel(&self) -> TaskResult<()> {
        if self.observer.should_cancel() {
            self.log("[CANCEL] install cancelled");
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    /// CPU and CUDA builds of torch and onnxruntime cannot share an
    /// environment, and neither can two CUDA builds. Returns true when a
    /// stale torch build could not be uninstalled, so the new one has to be
    /// force-installed over it.
    fn remove_conflicts(&self, plan: &InstallPlan, installed: &mut HashMap<String, String>) -> bool {
        let uninstall_timeout = self.ctx.timeouts.uninstall;
        if plan.wants_gpu() {
            if installed.contains_key("onnxruntime") {
                self.log("[INFO] removing CPU onnxruntime before installing onnxruntime-gpu");
                if uninstall(self.ctx, self.pyexe, &["onnxruntime"], uninstall_timeout, self.observer) {
                    installed.remove("onnxruntime");
                }
            }
            let torch = installed.get("torch").cloned().unwrap_or_default();
            let audio = installed.get("torchaudio").cloned().unwrap_or_default();
            let cpu_torch = torch.contains("+cpu") || audio.contains("+cpu") || (!torch.is_empty() && !torch.contains("+cu"));
            if cpu_torch {
                self.log(format!("[WARN] CPU torch build {} found, removing it before the CUDA build", torch));
                return !self.remove_torch_triple(installed);
            }
            // Plain `==` pins ignore local tags, so a cu126 wheel would pass for cu118.
            let stale = TORCH_TRIPLE.iter().find_map(|name| {
                let version = installed.get(*name)?;
                let tag = torch_local_tag(version)?;
                (tag.starts_with("cu") && tag != plan.torch.tag).then(|| format!("{} {}", name, version))
            });
            if let Some(stale) = stale {
                self.log(format!("[WARN] {} does not match {}, replacing the torch build", stale, plan.torch.tag));
                return !self.remove_torch_triple(installed);
            }
        } else if plan.layers.contains(&Layer::HeavyCpu) {
            let torch = installed.get("torch").cloned().unwrap_or_default();
            if torch.contains("+cu") {
                self.log(format!("[WARN] CUDA torch build {} found, removing it before the CPU build", torch));
                return !self.remove_torch_triple(installed);
            }
        }
        false
    }

    /// Uninstalls the torch triple. The packages are dropped from `installed`
    /// either way so their pins stay pending.
    fn remove_torch_triple(&self, installed: &mut HashMap<String, String>) -> bool {
        let present: Vec<&str> = TORCH_TRIPLE.iter().copied().filter(|p| installed.contains_key(*p)).collect();
        let removed = uninstall(self.ctx, self.pyexe, &present, self.ctx.timeouts.uninstall, self.observer);
        for p in present {
            installed.remove(p);
        }
        removed
    }

    fn pending_specs(&self, plan: &InstallPlan, installed: &HashMap<String, String>) -> (Vec<String>, Vec<String>) {
        if self.force_reinstall {
            self.log("[INFO] force reinstall: ignoring installed packages");
            return (plan.specs.clone(), Vec::new());
        }
        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        for spec in &plan.specs {
            let name = spec_name(spec);
            match installed.get(&name) {
                Some(cur) if spec_satisfied(spec, installed) => skipped.push(format!("{} ({})", name, cur)),
                Some(cur) => {
                    self.log(format!("[INFO] {} {} does not satisfy {}, reinstalling", name, cur, spec));
                    pending.push(spec.clone());
                }
                None => pending.push(spec.clone()),
            }
        }
        (pending, skipped)
    }

    fn pip_install(&self, plan: &InstallPlan, spec: &str, force: bool) -> TaskResult<bool> {
        let mut install = PipInstall::new(spec, plan.index_for(spec));
        install.force_reinstall = force;
        install_with_retries(self.ctx, self.pyexe, self.deps_dir, &install, self.observer)
    }

    /// Uninstalls and reinstalls the torch triple from the plan's index.
    pub fn repair_torch_stack(&self, plan: &InstallPlan) -> TaskResult<bool> {
        self.check_cancel()?;
        self.log("[INFO] reinstalling torch, torchvision and torchaudio");
        uninstall(self.ctx, self.pyexe, &TORCH_TRIPLE, self.ctx.timeouts.repair_uninstall, self.observer);
        for spec in plan.torch.torch_specs() {
            self.check_cancel()?;
            // torch wheels are huge; keep pip's cache for the repair.
            if !self.pip_install(plan, &spec, true)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Force-reinstalls the pinned critical packages that drifted.
    pub fn fix_critical_versions(&self, mirror: bool) {
        self.log("[INFO] checking critical package versions");
        let installed = installed_packages(self.ctx, self.pyexe);
        for (name, spec) in CRITICAL_VERSIONS {
            if let Some(cur) = installed.get(name) {
                if spec_satisfied(spec, &installed) {
                    self.log(format!("  [SKIP] {} {} satisfies {}", name, cur, spec));
                    continue;
                }
            }
            let mut install = PipInstall::new(spec, PipIndex::Default { mirror });
            install.force_reinstall = true;
            install.no_deps = true;
            let timeout = if name == "numpy" { 300 } else { 180 };
            match install_captured(self.ctx, self.pyexe, &install, std::time::Duration::from_secs(timeout)) {
                Ok(()) => self.log(format!("  [OK] pinned {}", spec)),
                Err(e) => self.log(format!("  [WARN] pinning {} failed: {}", spec, e)),
            }
        }
    }

    fn smoke_with_repair(&self, plan: &InstallPlan) -> TaskResult<(bool, String)> {
        match torch_stack_smoke(self.ctx, self.pyexe) {
            Ok(()) => Ok((true, String::new())),
            Err(first) => {
                self.log("[WARN] torch/torchvision binaries do not match, trying to repair");
                self.log(format!("[DIAG] {}", first.chars().take(400).collect::<String>()));
                if !self.repair_torch_stack(plan)? {
                    return Ok((false, first));
                }
                match torch_stack_smoke(self.ctx, self.pyexe) {
                    Ok(()) => {
                        self.log("[OK] torch stack repaired");
                        Ok((true, String::new()))
                    }
                    Err(again) => {
                        self.log(format!("[ERR] torch stack still broken: {}", again.chars().take(400).collect::<String>()));
                        Ok((false, again))
                    }
                }
            }
        }
    }

    /// One pass: conflicts, pending installs, torch smoke test and repair,
    /// critical pins, summary. Package failures do not stop the pass.
    pub fn run(&self, plan: &InstallPlan) -> TaskResult<InstallOutcome> {
        self.log(format!("[INFO] checking {} packages with {}", plan.specs.len(), self.pyexe.display()));
        let mut installed = installed_packages(self.ctx, self.pyexe);
        self.log(format!("[INFO] {} packages currently installed", installed.len()));
        if plan.wants_gpu() {
            self.log(format!("[INFO] torch build {}, onnxruntime {}", plan.torch, plan.torch.onnxruntime_spec()));
        }

        let force_torch = self.remove_conflicts(plan, &mut installed);
        let (pending, skipped) = self.pending_specs(plan, &installed);
        if !skipped.is_empty() {
            let shown: Vec<&str> = skipped.iter().take(10).map(String::as_str).collect();
            let more = if skipped.len() > 10 { "..." } else { "" };
            self.log(format!("[INFO] already satisfied: {}{}", shown.join(", "), more));
        }

        let mut outcome = InstallOutcome { skipped, runtime_ok: true, ..Default::default() };
        if pending.is_empty() {
            self.log("[INFO] all dependencies already installed");
            self.observer.progress(1, 1);
            return Ok(outcome);
        }

        let total = pending.len() as u64;
        self.log(format!("[INFO] installing {} packages ({} already satisfied)", total, outcome.skipped.len()));
        self.observer.progress(0, total);
        for (i, spec) in pending.iter().enumerate() {
            self.check_cancel()?;
            let force = self.force_reinstall || (force_torch && is_torch_family(spec));
            let ok = self.pip_install(plan, spec, force)?;
            outcome.attempted += 1;
            self.observer.progress(i as u64 + 1, total);
            if ok {
                self.log(format!("[OK] {} done", spec));
            } else {
                self.log(format!("[ERR] {} failed", spec));
                outcome.failed_packages.push(spec.clone());
            }
        }
        self.check_cancel()?;

        if plan.touches_torch() {
            let (ok, err) = self.smoke_with_repair(plan)?;
            outcome.runtime_ok = ok;
            outcome.runtime_error = err;
        }

        self.fix_critical_versions(plan.mirror);

        if plan.touches_torch() {
            match torch_stack_smoke(self.ctx, self.pyexe) {
                Ok(()) => {
                    if !outcome.runtime_ok {
                        self.log("[OK] torch stack verified after pinning critical versions");
                    }
                    outcome.runtime_ok = true;
                    outcome.runtime_error.clear();
                }
                Err(e) => {
                    self.log(format!("[WARN] torch stack still broken after pinning: {}", e.chars().take(400).collect::<String>()));
                    outcome.runtime_ok = false;
                    outcome.runtime_error = e;
                }
            }
        }

        self.summarize(&outcome, total);
        Ok(outcome)
    }

    fn summarize(&self, outcome: &InstallOutcome, total: u64) {
        if outcome.all_ok() {
            self.log("[OK] all dependencies installed");
        } else if outcome.failed_packages.is_empty() {
            self.log("[WARN] packages installed but runtime verification failed");
            if !outcome.runtime_error.is_empty() {
                self.log(format!("[DIAG] {}", outcome.runtime_error.chars().take(600).collect::<String>()));
            }
            self.log("[HINT] reinstall with only one of HEAVY_CPU or HEAVY_GPU selected");
        } else {
            let ok = total - outcome.failed_packages.len() as u64;
            self.log(format!("[WARN] {} of {} packages installed, {} failed", ok, total, outcome.failed_packages.len()));
            for spec in &outcome.failed_packages {
                self.log(format!("[HINT] install manually: {}", manual_install_hint(self.pyexe, spec)));
            }
        }
    }
}

// --- Pre-install gates ---

/// Fails when other processes are running the target interpreter.
pub fn ensure_env_not_in_use(pyexe: &Path) -> TaskResult<()> {
    let busy = processes_using_python(pyexe);
    if busy.is_empty() {
        return Ok(());
    }
    let shown: Vec<_> = busy.into_iter().take(MAX_REPORTED_PROCESSES).collect();
    Err(TaskError::rpc("target python is in use by other processes; close them and retry", ErrorCode::EnvInUse)
        .with_details(json!({"python": pyexe.display().to_string(), "processes": shown})))
}

/// Fails with pip's complaint when pip cannot run in the target interpreter.
pub fn ensure_pip(ctx: &InstallerContext, pyexe: &Path) -> TaskResult<()> {
    super::pip::pip_probe(ctx, pyexe).map(|_| ()).map_err(|probe| {
        TaskError::rpc("pip unavailable before dependency install", ErrorCode::TaskRuntimeError)
            .with_details(json!({"python": pyexe.display().to_string(), "pip_probe": probe}))
    })
}

/// Human-readable plan for `deps plan` style reports.
pub fn describe_plan(plan: &InstallPlan, pyexe: &str) -> serde_json::Value {
    json!({
        "layers": layer_names(&plan.layers),
        "torch": plan.torch,
        "index_url": plan.torch.index_url(),
        "onnxruntime": plan.torch.onnxruntime_spec(),
        "command": plan.torch.pip_command(pyexe),
        "specs": plan.specs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::cuda::pick_plan;

    #[test]
    fn resolution_is_idempotent() {
        let gpu = pick_plan((12, 6));
        let a = resolve_plan(&[Layer::Basic, Layer::Core], gpu, None, false).unwrap();
        let b = resolve_plan(&[Layer::Basic, Layer::Core], gpu, None, false).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.layers, vec![Layer::Basic, Layer::Core, Layer::HeavyGpu]);
        assert!(a.specs.contains(&"torch==2.7.1".to_string()));
        assert!(a.specs.contains(&"onnxruntime-gpu~=1.19.2".to_string()));
        assert!(!a.specs.iter().any(|s| spec_name(s) == "onnxruntime"));
    }

    #[test]
    fn cpu_resolution() {
        let plan = resolve_plan(&[Layer::Core], None, None, true).unwrap();
        assert_eq!(plan.layers, vec![Layer::Core, Layer::HeavyCpu]);
        assert_eq!(plan.torch.tag, "cpu");
        assert!(plan.specs.contains(&"torch==2.9.0".to_string()));
        assert!(plan.specs.contains(&"onnxruntime~=1.19.2".to_string()));
        assert_eq!(plan.index_for("torchvision==0.24.0"), PipIndex::Torch {
            url: "https://download.pytorch.org/whl/cpu".into(),
            extra_official: false
        });
        assert_eq!(plan.index_for("tqdm~=4.67.1"), PipIndex::Default { mirror: true });
        assert_eq!(plan.cuda_tag(), "");
    }

    #[test]
    fn explicit_cuda_tag_wins() {
        let plan = resolve_plan(&[Layer::HeavyGpu], pick_plan((12, 8)), Some("cu118"), false).unwrap();
        assert_eq!(plan.cuda_tag(), "cu118");
        assert!(plan.specs.contains(&"onnxruntime-gpu~=1.18.1".to_string()));

        let err = resolve_plan(&[Layer::HeavyGpu], None, Some("cu99"), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RpcInvalidParams);
        let err = resolve_plan(&[Layer::HeavyGpu], None, None, false).unwrap_err();
        assert_eq!(err.to_string(), "GPU plan unavailable");
    }

    #[test]
    fn exclusive_request_rejected() {
        let err = resolve_plan(&[Layer::HeavyCpu, Layer::HeavyGpu], None, None, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RpcInvalidParams);
    }

    #[test]
    fn plan_description() {
        let plan = resolve_plan(&[Layer::HeavyCpu], None, None, false).unwrap();
        let v = describe_plan(&plan, "py");
        assert_eq!(v["torch"]["tag"], "cpu");
        assert_eq!(v["layers"], json!(["HEAVY_CPU"]));
    }
}
