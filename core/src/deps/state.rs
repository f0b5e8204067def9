// core/src/deps/state.rs
use super::layers::Layer;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = ".deps_state.json";

pub fn state_path(deps_dir: &Path) -> PathBuf {
    deps_dir.join(STATE_FILE)
}

/// Persisted split between verified and failed layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepsState {
    #[serde(default)]
    pub installed_layers: Vec<Layer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_layers: Vec<Layer>,
}

fn layer_list(raw: Option<&Value>) -> (Vec<Layer>, bool) {
    let Some(Value::Array(items)) = raw else {
        return (Vec::new(), raw.is_some());
    };
    let mut out = Vec::new();
    let mut dropped = false;
    for item in items {
        match item.as_str().and_then(Layer::parse) {
            Some(layer) if !out.contains(&layer) => out.push(layer),
            Some(_) => dropped = true,
            None => {
                log::info!("dropping unknown layer from deps state: {}", item);
                dropped = true;
            }
        }
    }
    (out, dropped)
}

impl DepsState {
    /// Builds a state from an arbitrary JSON blob, dropping what it does
    /// not understand. The flag reports whether anything was dropped.
    pub fn from_value(raw: &Value) -> (DepsState, bool) {
        let (installed, a) = layer_list(raw.get("installed_layers"));
        let (failed, b) = layer_list(raw.get("failed_layers"));
        let mut state = DepsState { installed_layers: installed, failed_layers: failed };
        let c = state.enforce_exclusive();
        (state, a || b || c)
    }

    /// Keeps one HEAVY layer when both are claimed: GPU, unless GPU also failed.
    fn enforce_exclusive(&mut self) -> bool {
        let has = |l: Layer| self.installed_layers.contains(&l);
        if !(has(Layer::HeavyCpu) && has(Layer::HeavyGpu)) {
            return false;
        }
        let drop = if self.failed_layers.contains(&Layer::HeavyGpu) { Layer::HeavyGpu } else { Layer::HeavyCpu };
        self.installed_layers.retain(|l| *l != drop);
        true
    }

    pub fn is_installed(&self, layer: Layer) -> bool {
        self.installed_layers.contains(&layer)
    }

    pub fn missing_required(&self) -> Vec<Layer> {
        super::layers::REQUIRED_LAYERS
            .iter()
            .copied()
            .filter(|l| !self.is_installed(*l))
            .collect()
    }

    /// Folds one verification pass into the state.
    pub fn merge(&mut self, verified: &[Layer], failed: &[Layer]) {
        for layer in verified {
            if let Some(other) = layer.exclusive_with() {
                self.installed_layers.retain(|l| *l != other);
            }
            if !self.installed_layers.contains(layer) {
                self.installed_layers.push(*layer);
            }
            self.failed_layers.retain(|l| l != layer);
        }
        for layer in failed {
            self.installed_layers.retain(|l| l != layer);
            if !self.failed_layers.contains(layer) {
                self.failed_layers.push(*layer);
            }
        }
    }

    /// Missing or unreadable files load as empty.
    pub fn load(path: &Path) -> (DepsState, bool) {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return (DepsState::default(), false),
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(raw) => DepsState::from_value(&raw),
            Err(e) => {
                log::warn!("ignoring unreadable deps state {}: {}", path.display(), e);
                (DepsState::default(), false)
            }
        }
    }

    /// Loads, and rewrites the file if sanitizing changed it.
    pub fn load_sanitized(path: &Path) -> Result<DepsState> {
        let (state, changed) = DepsState::load(path);
        if changed {
            state.save(path)?;
        }
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("Failed to write deps state {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_prefers_cpu_when_gpu_failed() {
        let raw = json!({
            "installed_layers": ["BASIC", "CORE", "HEAVY_CPU", "HEAVY_GPU"],
            "failed_layers": ["HEAVY_GPU"],
        });
        let (state, changed) = DepsState::from_value(&raw);
        assert!(changed);
        assert_eq!(state.installed_layers, vec![Layer::Basic, Layer::Core, Layer::HeavyCpu]);
        assert_eq!(state.failed_layers, vec![Layer::HeavyGpu]);
    }

    #[test]
    fn sanitize_prefers_gpu_otherwise() {
        let raw = json!({"installed_layers": ["HEAVY_GPU", "HEAVY_CPU"]});
        let (state, _) = DepsState::from_value(&raw);
        assert_eq!(state.installed_layers, vec![Layer::HeavyGpu]);
    }

    #[test]
    fn unknown_entries_are_dropped() {
        let raw = json!({
            "installed_layers": ["BASIC", "PIX2TEX", 3, "BASIC"],
            "failed_layers": "nope",
            "future_key": true,
        });
        let (state, changed) = DepsState::from_value(&raw);
        assert!(changed);
        assert_eq!(state.installed_layers, vec![Layer::Basic]);
        assert!(state.failed_layers.is_empty());

        let (_, clean) = DepsState::from_value(&json!({"installed_layers": ["CORE"], "extra": 1}));
        assert!(!clean);
    }

    #[test]
    fn merge_keeps_heavy_exclusive() {
        let mut state = DepsState { installed_layers: vec![Layer::Basic, Layer::HeavyCpu], failed_layers: vec![Layer::Core] };
        state.merge(&[Layer::Core, Layer::HeavyGpu], &[]);
        assert_eq!(state.installed_layers, vec![Layer::Basic, Layer::Core, Layer::HeavyGpu]);
        assert!(state.failed_layers.is_empty());

        state.merge(&[], &[Layer::HeavyGpu]);
        assert_eq!(state.installed_layers, vec![Layer::Basic, Layer::Core]);
        assert_eq!(state.failed_layers, vec![Layer::HeavyGpu]);
        assert!(state.missing_required().is_empty());
    }

    #[test]
    fn save_and_reload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = state_path(dir.path());
        let state = DepsState { installed_layers: vec![Layer::Basic], failed_layers: vec![] };
        state.save(&path)?;
        let text = fs::read_to_string(&path)?;
        assert!(text.contains("\n  \"installed_layers\""));
        assert!(!text.contains("failed_layers"));
        assert_eq!(DepsState::load(&path).0, state);
        Ok(())
    }

    #[test]
    fn load_sanitized_rewrites_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = state_path(dir.path());
        fs::write(&path, r#"{"installed_layers": ["BASIC", "OLD_LAYER"]}"#)?;
        let state = DepsState::load_sanitized(&path)?;
        assert_eq!(state.installed_layers, vec![Layer::Basic]);
        assert!(!fs::read_to_string(&path)?.contains("OLD_LAYER"));
        assert_eq!(DepsState::load(&dir.path().join("missing.json")).0, DepsState::default());
        Ok(())
    }
}
