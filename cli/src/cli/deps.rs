// cli/src/cli/deps.rs
use super::Session;
use crate::client::ClientError;
use anyhow::{anyhow, Result};
use colored::*;
use serde_json::{json, Map, Value};
use snipper_core::deps::installer::describe_plan;
use snipper_core::deps::python::resolve_python_for_deps;
use snipper_core::deps::{check_installed, resolve_plan, CheckReport, InstallerContext, Layer, LogObserver};
use snipper_core::error::TaskError;
use snipper_core::gpu::monitor::GpuMonitor;
use snipper_core::utils::models::TaskKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use structopt::StructOpt;

/// Installs pull wheels from the network; allow them plenty of time.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(StructOpt, Debug)]
pub enum DepsCommand {
    /// Install dependency layers through the daemon
    #[structopt(name = "install")]
    Install {
        /// Comma separated layers, e.g. BASIC,CORE,HEAVY_CPU
        #[structopt(long, default_value = "BASIC,CORE")]
        layers: String,

        /// Directory holding the target interpreter
        #[structopt(long, parse(from_os_str))]
        deps_dir: Option<PathBuf>,

        /// Use the tuna mirror
        #[structopt(long)]
        mirror: bool,

        /// Run the strict import checks after installing
        #[structopt(long)]
        force_verify: bool,
    },

    /// Switch the torch build between CPU and GPU
    #[structopt(name = "switch")]
    Switch {
        /// cpu or gpu
        #[structopt(possible_values = &["cpu", "gpu"])]
        target: String,

        /// CUDA wheel tag such as cu126; detected when omitted
        #[structopt(long)]
        cuda_tag: Option<String>,

        #[structopt(long, parse(from_os_str))]
        deps_dir: Option<PathBuf>,

        #[structopt(long)]
        mirror: bool,
    },

    /// Re-verify the installed layers without touching the network
    #[structopt(name = "check")]
    Check {
        #[structopt(long, parse(from_os_str))]
        deps_dir: Option<PathBuf>,

        /// Strict verification (imports plus runtime smoke tests)
        #[structopt(long)]
        force_verify: bool,
    },

    /// Show the detected CUDA version and the torch plan it selects
    #[structopt(name = "plan")]
    Plan {
        #[structopt(long, parse(from_os_str))]
        deps_dir: Option<PathBuf>,
    },
}

fn path_param(dir: &Option<PathBuf>) -> Value {
    match dir {
        Some(dir) => Value::String(dir.display().to_string()),
        None => Value::Null,
    }
}

fn to_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn names(value: Option<&Value>) -> String {
    let list: Vec<&str> = value.and_then(Value::as_array).map(|a| a.iter().filter_map(Value::as_str).collect()).unwrap_or_default();
    if list.is_empty() {
        "-".to_string()
    } else {
        list.join(", ")
    }
}

fn print_install_output(output: &Map<String, Value>) {
    println!(
        "{} {}",
        "[SUCCESS]".green(),
        output.get("message").and_then(Value::as_str).unwrap_or("done")
    );
    println!("  python:    {}", output.get("python").and_then(Value::as_str).unwrap_or(""));
    println!("  deps dir:  {}", output.get("deps_dir").and_then(Value::as_str).unwrap_or(""));
    println!("  installed: {}", names(output.get("installed_layers")));
    let failed = names(output.get("failed_layers"));
    if failed != "-" {
        println!("{} layers failing verification: {}", "[WARN]".yellow(), failed.red());
    }
}

/// Prints the verified split and whether the required layers are present.
pub fn print_check_report(report: &CheckReport) {
    let layers = |ls: &[Layer]| {
        if ls.is_empty() {
            "-".to_string()
        } else {
            ls.iter().map(|l| l.as_str()).collect::<Vec<_>>().join(", ")
        }
    };
    println!("{} python: {}", "[INFO]".blue(), report.python.cyan());
    println!("{} installed: {}", "[INFO]".blue(), layers(&report.installed_layers));
    if !report.failed_layers.is_empty() {
        println!("{} failed verification: {}", "[WARN]".yellow(), layers(&report.failed_layers).red());
    }
    if report.missing_required.is_empty() {
        println!("{} required layers present", "[SUCCESS]".green());
    } else {
        println!("{} missing required layers: {}", "[WARN]".yellow(), layers(&report.missing_required).red());
    }
}

/// Offline verification of what the state file claims.
pub fn run_check(deps_dir: Option<&Path>, strict: bool) -> Result<CheckReport> {
    let (pyexe, deps_dir) = resolve_python_for_deps(deps_dir)?;
    let ctx = InstallerContext::new();
    Ok(check_installed(&ctx, &pyexe, &deps_dir, strict, &LogObserver)?)
}

impl DepsCommand {
    pub fn execute(self, session: &Session) -> Result<()> {
        match self {
            Self::Install { layers, deps_dir, mirror, force_verify } => {
                let deps_dir = deps_dir.or_else(|| session.config.deps_dir.clone());
                let params = to_object(json!({
                    "layers": layers,
                    "deps_dir": path_param(&deps_dir),
                    "mirror": mirror || session.config.mirror,
                    "force_verify": force_verify,
                }));
                Self::run_task(session, TaskKind::InstallDeps, params)
            }
            Self::Switch { target, cuda_tag, deps_dir, mirror } => {
                let deps_dir = deps_dir.or_else(|| session.config.deps_dir.clone());
                let params = to_object(json!({
                    "target": target,
                    "cuda_tag": cuda_tag,
                    "deps_dir": path_param(&deps_dir),
                    "mirror": mirror || session.config.mirror,
                }));
                Self::run_task(session, TaskKind::SwitchCpuGpu, params)
            }
            Self::Check { deps_dir, force_verify } => {
                let deps_dir = deps_dir.or_else(|| session.config.deps_dir.clone());
                let report = run_check(deps_dir.as_deref(), force_verify)?;
                print_check_report(&report);
                Ok(())
            }
            Self::Plan { deps_dir } => Self::handle_plan(deps_dir.or_else(|| session.config.deps_dir.clone())),
        }
    }

    fn run_task(session: &Session, kind: TaskKind, params: Map<String, Value>) -> Result<()> {
        let mut runner = session.runner()?;
        let result = runner.run(kind, params, INSTALL_TIMEOUT);
        runner.shutdown();
        match result {
            Ok(output) => {
                print_install_output(&output);
                Ok(())
            }
            Err(e) => {
                let details = match (e.downcast_ref::<ClientError>(), e.downcast_ref::<TaskError>()) {
                    (Some(ClientError::Task { details, .. }), _) => Some(details),
                    (_, Some(task_err)) => task_err.details(),
                    _ => None,
                };
                if let Some(tail) = details.and_then(|d| d.get("log_tail")).and_then(Value::as_str) {
                    let lines: Vec<&str> = tail.lines().collect();
                    for line in &lines[lines.len().saturating_sub(20)..] {
                        eprintln!("  {}", line.dimmed());
                    }
                }
                Err(e)
            }
        }
    }

    fn handle_plan(deps_dir: Option<PathBuf>) -> Result<()> {
        let ctx = InstallerContext::new();
        let detection = ctx.cuda();
        match detection.version {
            Some((major, minor)) => println!(
                "{} CUDA {}.{} detected via {}",
                "[INFO]".blue(),
                major,
                minor,
                detection.source
            ),
            None => println!("{} no usable CUDA found ({})", "[INFO]".blue(), detection.note),
        }

        match GpuMonitor::new().and_then(|m| m.devices()) {
            Ok(devices) => {
                for device in devices {
                    println!(
                        "  GPU {}: {} ({} MiB)",
                        device.index,
                        device.name.cyan(),
                        device.memory_total / (1024 * 1024)
                    );
                }
            }
            Err(e) => log::debug!("gpu listing unavailable: {:#}", e),
        }

        let layer = if ctx.gpu_plan().is_some() { Layer::HeavyGpu } else { Layer::HeavyCpu };
        let plan = resolve_plan(&[layer], ctx.gpu_plan(), None, false)?;
        let pyexe = resolve_python_for_deps(deps_dir.as_deref())
            .map(|(py, _)| py.display().to_string())
            .unwrap_or_else(|_| "python".to_string());
        let described = describe_plan(&plan, &pyexe);
        println!(
            "{}",
            serde_json::to_string_pretty(&described).map_err(|e| anyhow!("Failed to render plan: {}", e))?
        );
        Ok(())
    }
}
