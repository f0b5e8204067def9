// core/src/deps/mod.rs
//! Dependency layers: resolution, pip supervision, verification and the
//! persisted install state.

pub mod context;
pub mod cuda;
pub mod diagnose;
pub mod installer;
pub mod layers;
pub mod pip;
pub mod python;
pub mod state;
pub mod torch_env;
pub mod verify;
pub mod version;

pub use context::{InstallObserver, InstallerContext, LogObserver, Timeouts};
pub use cuda::{CudaDetection, CudaPlan};
pub use installer::{resolve_plan, InstallOutcome, InstallPlan, LayerInstaller};
pub use layers::Layer;
pub use state::DepsState;

use crate::error::TaskResult;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub python: String,
    pub deps_dir: String,
    pub installed_layers: Vec<Layer>,
    pub failed_layers: Vec<Layer>,
    pub missing_required: Vec<Layer>,
}

/// Re-verifies every layer the state file claims and persists the result.
pub fn check_installed(
    ctx: &InstallerContext,
    pyexe: &Path,
    deps_dir: &Path,
    strict: bool,
    observer: &dyn InstallObserver,
) -> TaskResult<CheckReport> {
    let path = state::state_path(deps_dir);
    let mut current = DepsState::load_sanitized(&path)?;
    let claimed = current.installed_layers.clone();
    let report = verify::verify_layers(ctx, pyexe, &claimed, strict, observer);
    current.merge(&report.verified, &report.failed_layers());
    current.save(&path)?;
    Ok(CheckReport {
        python: pyexe.display().to_string(),
        deps_dir: deps_dir.display().to_string(),
        missing_required: current.missing_required(),
        installed_layers: current.installed_layers,
        failed_layers: current.failed_layers,
    })
}
