// core/src/deps/torch_env.rs
use super::python::site_packages;
use crate::utils::process::run_captured;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

pub const SHARED_TORCH_SITE_ENV: &str = "PIX2TEXT_SHARED_TORCH_SITE";
pub const LEGACY_SHARED_TORCH_SITE_ENV: &str = "LATEXSNIPPER_SHARED_TORCH_SITE";

pub const TORCH_INFO_TIMEOUT: Duration = Duration::from_secs(8);

/// Points a child environment at a shared torch install, or clears the
/// pointer when `site` is not a directory.
pub fn inject_shared_torch_env(env: &mut HashMap<String, String>, site: Option<&Path>) {
    env.remove(LEGACY_SHARED_TORCH_SITE_ENV);
    let Some(site) = site.filter(|s| s.is_dir()) else {
        env.remove(SHARED_TORCH_SITE_ENV);
        return;
    };
    env.insert(SHARED_TORCH_SITE_ENV.to_string(), site.display().to_string());
    let torch_lib = site.join("torch").join("lib");
    if torch_lib.is_dir() {
        let mut dirs = vec![torch_lib];
        if let Some(cur) = env.get("PATH").filter(|p| !p.is_empty()) {
            dirs.extend(std::env::split_paths(cur));
        }
        if let Ok(joined) = std::env::join_paths(dirs) {
            env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        }
    }
}

/// The shared site configured for this process, new name first.
pub fn shared_torch_site_from_env() -> Option<String> {
    [SHARED_TORCH_SITE_ENV, LEGACY_SHARED_TORCH_SITE_ENV]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

const TORCH_INFO_CODE: &str = r#"import json, os, sys
def _bootstrap_shared_torch():
    site = (os.environ.get('PIX2TEXT_SHARED_TORCH_SITE', '') or os.environ.get('LATEXSNIPPER_SHARED_TORCH_SITE', '') or '').strip()
    if not (site and os.path.isdir(site)):
        return
    added = False
    if site not in sys.path:
        sys.path.insert(0, site)
        added = True
    lib = os.path.join(site, 'torch', 'lib')
    if os.path.isdir(lib):
        if hasattr(os, 'add_dll_directory'):
            os.add_dll_directory(lib)
        os.environ['PATH'] = lib + os.pathsep + os.environ.get('PATH', '')
    try:
        for name in ('torch', 'torchvision', 'torchaudio'):
            try:
                __import__(name)
            except Exception:
                pass
    finally:
        if added:
            sys.path.remove(site)
_bootstrap_shared_torch()
try:
    import torch
    import torchvision
    cv = getattr(getattr(torch, 'version', None), 'cuda', '') or ''
    print(json.dumps({'present': True, 'cuda_available': bool(torch.cuda.is_available()), 'cuda_version': cv, 'torch_version': getattr(torch, '__version__', '')}))
except Exception as e:
    print(json.dumps({'present': False, 'error': str(e)}))
"#;

/// What the target interpreter reports about its torch build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorchInfo {
    #[serde(default)]
    pub present: bool,
    /// `gpu`, `cpu` or empty when torch is absent.
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub cuda_available: bool,
    #[serde(default)]
    pub cuda_version: String,
    #[serde(default)]
    pub torch_version: String,
    #[serde(default)]
    pub error: String,
}

impl TorchInfo {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Fills `mode` and normalizes `12.4` style CUDA versions to `cu124`.
    fn finish_probe(&mut self) {
        let is_gpu = self.cuda_available || !self.cuda_version.is_empty();
        self.mode = if is_gpu { "gpu" } else { "cpu" }.to_string();
        self.error.clear();
        if is_gpu && !self.cuda_version.starts_with("cu") {
            let mut parts = self.cuda_version.split('.');
            if let (Some(major), Some(minor)) = (parts.next(), parts.next()) {
                if !major.is_empty()
                    && !minor.is_empty()
                    && major.chars().all(|c| c.is_ascii_digit())
                    && minor.chars().all(|c| c.is_ascii_digit())
                {
                    self.cuda_version = format!("cu{}{}", major, minor);
                }
            }
        }
    }

    /// `auto` accepts any present torch; `cpu`/`gpu` need that mode.
    pub fn satisfies(&self, mode: &str) -> bool {
        if !self.present {
            return false;
        }
        match mode.trim().to_lowercase().as_str() {
            "auto" | "" => true,
            m => self.mode == m,
        }
    }
}

/// Build tag from `torch-*.dist-info` (`cu126`, `gpu`), `cpu` when only the
/// package directory exists, empty when torch is absent.
pub fn torch_tag_from_dist_info(site: &Path) -> String {
    if let Ok(entries) = fs::read_dir(site) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if !(name.starts_with("torch-") && name.ends_with(".dist-info")) {
                continue;
            }
            if let Some((_, tail)) = name.split_once("+cu") {
                let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
                return if digits.is_empty() { "gpu".to_string() } else { format!("cu{}", digits) };
            }
        }
    }
    if site.join("torch").exists() {
        "cpu".to_string()
    } else {
        String::new()
    }
}

fn last_json_object(text: &str) -> Option<TorchInfo> {
    text.lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str::<TorchInfo>(l).ok())
}

/// Asks the interpreter about torch, falling back to inspecting
/// site-packages when the probe cannot import it.
pub fn detect_torch_info(pyexe: &Path, timeout: Duration, env: Option<&HashMap<String, String>>) -> TorchInfo {
    let mut info = TorchInfo::default();
    if !pyexe.is_file() {
        info.error = "python interpreter not found".to_string();
        return info;
    }

    let mut cmd = Command::new(pyexe);
    cmd.arg("-c").arg(TORCH_INFO_CODE);
    if let Some(env) = env {
        cmd.env_clear().envs(env);
    }
    match run_captured(&mut cmd, timeout) {
        Ok(out) if out.timed_out => info.error = "timeout".to_string(),
        Ok(out) => {
            let text = out.combined();
            match last_json_object(&text) {
                Some(parsed) => info = parsed,
                None if !text.is_empty() => info.error = text.chars().take(240).collect(),
                None => {}
            }
        }
        Err(e) => info.error = e.to_string(),
    }

    if info.present {
        info.finish_probe();
        return info;
    }

    let site = site_packages(pyexe);
    if site.join("torch").exists() && site.join("torchvision").exists() {
        let tag = torch_tag_from_dist_info(&site);
        info.present = true;
        info.cuda_available = tag.starts_with("cu") || tag == "gpu";
        info.cuda_version = if tag.starts_with("cu") { tag } else { String::new() };
        info.mode = if info.cuda_available { "gpu" } else { "cpu" }.to_string();
        info.error.clear();
    }
    info
}
