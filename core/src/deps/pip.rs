// core/src/deps/pip.rs
use super::context::{InstallObserver, InstallerContext, ObserverControl};
use super::cuda::{PIP_INDEX_OFFICIAL, PIP_INDEX_TUNA};
use super::diagnose::diagnose_pip_failure;
use super::layers::{normalize_pkg_name, spec_name};
use crate::error::{TaskError, TaskResult};
use crate::utils::process::{run_captured, run_streaming, StreamEnd};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

/// Retries after the first failed try.
pub const MAX_RETRIES: u32 = 2;

/// Always force-reinstalled because other packages tend to drag them to
/// incompatible versions.
const FORCE_REINSTALL_PKGS: [&str; 4] = ["numpy", "protobuf", "pydantic", "pydantic-core"];

const DIAG_TAIL_LINES: usize = 50;

/// Where pip should look for a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipIndex {
    /// `-i` tuna mirror or the official index.
    Default { mirror: bool },
    /// A torch wheel index; GPU indexes also consult PyPI for dependencies.
    Torch { url: String, extra_official: bool },
}

impl PipIndex {
    pub fn args(&self) -> Vec<String> {
        match self {
            PipIndex::Default { mirror } => {
                vec!["-i".to_string(), if *mirror { PIP_INDEX_TUNA } else { PIP_INDEX_OFFICIAL }.to_string()]
            }
            PipIndex::Torch { url, extra_official } => {
                let mut args = vec!["--index-url".to_string(), url.clone()];
                if *extra_official {
                    args.push("--extra-index-url".to_string());
                    args.push(PIP_INDEX_OFFICIAL.to_string());
                }
                args
            }
        }
    }
}

/// One `pip install` of a single requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipInstall {
    pub spec: String,
    pub index: PipIndex,
    pub force_reinstall: bool,
    pub no_cache: bool,
    pub no_deps: bool,
}

impl PipInstall {
    pub fn new(spec: impl Into<String>, index: PipIndex) -> Self {
        PipInstall { spec: spec.into(), index, force_reinstall: false, no_cache: false, no_deps: false }
    }

    pub fn args(&self) -> Vec<String> {
        let name = spec_name(&self.spec);
        let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string(), self.spec.clone()];
        if name == "numpy" {
            args.push("numpy<2.0.0".to_string());
        }
        args.push("--upgrade".to_string());
        if self.force_reinstall {
            args.push("--force-reinstall".to_string());
            if self.no_cache {
                args.push("--no-cache-dir".to_string());
            }
        } else if FORCE_REINSTALL_PKGS.contains(&name.as_str()) {
            args.push("--force-reinstall".to_string());
        }
        if self.no_deps {
            args.push("--no-deps".to_string());
        }
        args.extend(self.index.args());
        args
    }
}

/// Copy-pasteable fallback command for a package pip kept failing on.
pub fn manual_install_hint(pyexe: &Path, spec: &str) -> String {
    let quoted = shlex::try_quote(spec).map(|s| s.into_owned()).unwrap_or_else(|_| spec.to_string());
    format!("\"{}\" -m pip install {} --upgrade --user", pyexe.display(), quoted)
}

fn python_command(pyexe: &Path) -> Command {
    let mut cmd = Command::new(pyexe);
    cmd.env("PYTHONUTF8", "1").env("PYTHONIOENCODING", "utf-8");
    cmd
}

/// `pyexe -m pip --version`; the error carries pip's own complaint.
pub fn pip_probe(ctx: &InstallerContext, pyexe: &Path) -> Result<String, String> {
    let mut cmd = python_command(pyexe);
    cmd.args(["-m", "pip", "--version"]);
    let _guard = ctx.pip_guard();
    match run_captured(&mut cmd, ctx.timeouts.pip_probe) {
        Ok(out) if out.success() => Ok(out.stdout.trim().to_string()),
        Ok(out) if out.timed_out => Err("pip --version timed out".to_string()),
        Ok(out) => {
            let msg = out.combined();
            Err(if msg.is_empty() { format!("pip exited with {:?}", out.code) } else { msg.chars().take(300).collect() })
        }
        Err(e) => Err(e.to_string()),
    }
}

#[derive(Deserialize)]
struct PipListEntry {
    name: String,
    version: String,
}

/// Normalized package name -> version. Empty when pip cannot be queried.
pub fn installed_packages(ctx: &InstallerContext, pyexe: &Path) -> HashMap<String, String> {
    let mut cmd = python_command(pyexe);
    cmd.args(["-m", "pip", "list", "--format=json"]);
    let out = {
        let _guard = ctx.pip_guard();
        run_captured(&mut cmd, ctx.timeouts.pip_list)
    };
    let out = match out {
        Ok(out) if out.success() => out,
        Ok(out) => {
            log::warn!("pip list failed: {}", out.combined());
            return HashMap::new();
        }
        Err(e) => {
            log::warn!("pip list could not start: {}", e);
            return HashMap::new();
        }
    };
    match serde_json::from_str::<Vec<PipListEntry>>(out.stdout.trim()) {
        Ok(rows) => rows
            .into_iter()
            .filter(|r| !r.name.trim().is_empty())
            .map(|r| (normalize_pkg_name(&r.name), r.version.trim().to_string()))
            .collect(),
        Err(e) => {
            log::warn!("unreadable pip list output: {}", e);
            HashMap::new()
        }
    }
}

/// `pip uninstall -y`; failures are logged and reported, never raised.
pub fn uninstall(
    ctx: &InstallerContext,
    pyexe: &Path,
    packages: &[&str],
    timeout: Duration,
    observer: &dyn InstallObserver,
) -> bool {
    if packages.is_empty() {
        return true;
    }
    let mut cmd = python_command(pyexe);
    cmd.args(["-m", "pip", "uninstall", "-y"]).args(packages);
    let _guard = ctx.pip_guard();
    match run_captured(&mut cmd, timeout) {
        Ok(out) if out.success() => {
            observer.log(&format!("[OK] uninstalled {}", packages.join(", ")));
            true
        }
        Ok(out) => {
            let tail: String = out.combined().chars().take(240).collect();
            observer.log(&format!("[WARN] uninstall {} failed: {}", packages.join(", "), tail));
            false
        }
        Err(e) => {
            observer.log(&format!("[WARN] uninstall {} failed: {}", packages.join(", "), e));
            false
        }
    }
}

/// Captured (non-streaming) install used by the critical version fix.
pub fn install_captured(ctx: &InstallerContext, pyexe: &Path, install: &PipInstall, timeout: Duration) -> Result<(), String> {
    let mut cmd = python_command(pyexe);
    cmd.args(install.args());
    let _guard = ctx.pip_guard();
    match run_captured(&mut cmd, timeout) {
        Ok(out) if out.success() => Ok(()),
        Ok(out) if out.timed_out => Err("timed out".to_string()),
        Ok(out) => Err(out.combined().replace('\r', "").chars().take(240).collect()),
        Err(e) => Err(e.to_string()),
    }
}

fn constraints_file(deps_dir: &Path) -> Option<PathBuf> {
    let path = deps_dir.join("constraints.txt");
    path.is_file().then_some(path)
}

fn wait_while_paused(observer: &dyn InstallObserver) -> TaskResult<()> {
    while observer.is_paused() {
        if observer.should_cancel() {
            return Err(TaskError::Cancelled);
        }
        thread::sleep(Duration::from_millis(100));
    }
    if observer.should_cancel() {
        return Err(TaskError::Cancelled);
    }
    Ok(())
}

fn cancellable_sleep(total: Duration, observer: &dyn InstallObserver) -> TaskResult<()> {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total {
        if observer.should_cancel() {
            return Err(TaskError::Cancelled);
        }
        let chunk = step.min(total - slept);
        thread::sleep(chunk);
        slept += chunk;
    }
    Ok(())
}

/// Installs one requirement, streaming pip's output to the observer and
/// retrying up to [`MAX_RETRIES`] times. `Ok(false)` means pip gave up;
/// cancellation is an error.
pub fn install_with_retries(
    ctx: &InstallerContext,
    pyexe: &Path,
    deps_dir: &Path,
    install: &PipInstall,
    observer: &dyn InstallObserver,
) -> TaskResult<bool> {
    let args = install.args();
    let constraints = constraints_file(deps_dir);
    match &install.index {
        PipIndex::Torch { url, .. } => observer.log(&format!("[Source] torch wheels from {}", url)),
        PipIndex::Default { mirror: true } => observer.log("[Source] tuna mirror"),
        PipIndex::Default { mirror: false } => observer.log("[Source] official index"),
    }

    let mut retry = 0;
    loop {
        wait_while_paused(observer)?;

        let mut cmd = Command::new(pyexe);
        cmd.args(&args).env("PYTHONUNBUFFERED", "1").env("PYTHONUTF8", "1");
        if let Some(path) = &constraints {
            cmd.env("PIP_CONSTRAINT", path);
        }
        observer.log(&format!("[CMD] {} {}", pyexe.display(), args.join(" ")));

        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAG_TAIL_LINES);
        let end = {
            let _guard = ctx.pip_guard();
            run_streaming(&mut cmd, ctx.timeouts.pip_install, &ObserverControl(observer), &mut |line: &str| {
                observer.log(line);
                if tail.len() == DIAG_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            })
        };

        let (failed_code, reason) = match end {
            Ok(StreamEnd::Exited(Some(0))) => {
                observer.log(&format!("[OK] {} installed", install.spec));
                return Ok(true);
            }
            Ok(StreamEnd::Cancelled) => {
                observer.log("[CANCEL] install cancelled, pip terminated");
                return Err(TaskError::Cancelled);
            }
            Ok(StreamEnd::TimedOut) => (None, "pip timed out".to_string()),
            Ok(StreamEnd::Exited(code)) => {
                let joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
                (code, diagnose_pip_failure(&joined, code).to_string())
            }
            Err(e) => {
                observer.log(&format!("[FATAL] could not start pip for {}: {}", install.spec, e));
                return Ok(false);
            }
        };

        observer.log(&format!("[WARN] {} failed (returncode={:?})", install.spec, failed_code));
        observer.log(&format!("[DIAG] likely cause: {}", reason));
        retry += 1;
        if retry > MAX_RETRIES {
            observer.log(&format!("[ERR] {} failed: {}", install.spec, reason));
            observer.log(&format!("[HINT] install manually: {}", manual_install_hint(pyexe, &install.spec)));
            return Ok(false);
        }
        observer.log(&format!("[INFO] retry {} of {}", retry, MAX_RETRIES));
        wait_while_paused(observer)?;
        cancellable_sleep(ctx.timeouts.retry_delay, observer)?;
    }
}
