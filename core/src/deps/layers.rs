// core/src/deps/layers.rs
use crate::error::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Named bundle of pip requirement specifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Layer {
    Basic,
    Core,
    HeavyCpu,
    HeavyGpu,
}

/// Layers every working install needs.
pub const REQUIRED_LAYERS: [Layer; 2] = [Layer::Basic, Layer::Core];

/// Package name prefixes never handed to pip.
pub const SKIP_PREFIX: [&str; 7] = ["pip", "setuptools", "wheel", "python", "openssl", "zlib", "ninja"];

const BASIC_SPECS: &[&str] = &[
    "simsimd~=6.0.5",
    "lxml~=4.9.3",
    "pillow~=11.0.0",
    "pyperclip~=1.11.0",
    "packaging~=25.0",
    "requests~=2.32.5",
    "tqdm~=4.67.1",
    "numpy>=1.26.4",
    "filelock~=3.13.1",
    "pydantic~=2.9.2",
    "regex~=2024.9.11",
    "safetensors~=0.6.2",
    "sentencepiece~=0.1.99",
    "certifi~=2024.2.2",
    "idna~=3.6",
    "urllib3~=2.5.0",
    "colorama~=0.4.6",
    "psutil~=7.1.0",
    "typing_extensions>=4.12.2",
];

const CORE_SPECS: &[&str] = &[
    "transformers==4.55.4",
    "tokenizers==0.21.4",
    "optimum-onnx>=0.0.3",
    "pix2text==1.1.6",
    "protobuf>=3.20,<5",
    "latex2mathml>=2.0.0",
    "matplotlib~=3.8.4",
    "pymupdf~=1.23.0",
];

// Torch versions here are placeholders; the resolver pins them from the CUDA plan.
const HEAVY_CPU_SPECS: &[&str] = &["torch", "torchvision", "torchaudio", "onnxruntime~=1.19.2"];

const HEAVY_GPU_SPECS: &[&str] = &["torch", "torchvision", "torchaudio", "onnxruntime-gpu~=1.19.2"];

impl Layer {
    pub const ALL: [Layer; 4] = [Layer::Basic, Layer::Core, Layer::HeavyCpu, Layer::HeavyGpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Basic => "BASIC",
            Layer::Core => "CORE",
            Layer::HeavyCpu => "HEAVY_CPU",
            Layer::HeavyGpu => "HEAVY_GPU",
        }
    }

    pub fn parse(raw: &str) -> Option<Layer> {
        let upper = raw.trim().to_uppercase();
        Layer::ALL.into_iter().find(|l| l.as_str() == upper)
    }

    pub fn specs(&self) -> &'static [&'static str] {
        match self {
            Layer::Basic => BASIC_SPECS,
            Layer::Core => CORE_SPECS,
            Layer::HeavyCpu => HEAVY_CPU_SPECS,
            Layer::HeavyGpu => HEAVY_GPU_SPECS,
        }
    }

    pub fn is_heavy(&self) -> bool {
        matches!(self, Layer::HeavyCpu | Layer::HeavyGpu)
    }

    /// The mutually exclusive counterpart of a HEAVY layer.
    pub fn exclusive_with(&self) -> Option<Layer> {
        match self {
            Layer::HeavyCpu => Some(Layer::HeavyGpu),
            Layer::HeavyGpu => Some(Layer::HeavyCpu),
            _ => None,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn layer_names(layers: &[Layer]) -> Vec<String> {
    layers.iter().map(|l| l.as_str().to_string()).collect()
}

fn known_layer_names() -> Vec<String> {
    let mut names = layer_names(&Layer::ALL);
    names.sort();
    names
}

/// Accepts a list or a comma separated string, uppercases and deduplicates.
/// An empty request means BASIC + CORE; unknown names are rejected.
pub fn normalize_layers(raw: Option<&Value>) -> TaskResult<Vec<Layer>> {
    let items: Vec<String> = match raw {
        Some(Value::Array(values)) => values
            .iter()
            .map(|v| match v {
                Value::String(s) => s.trim().to_uppercase(),
                other => other.to_string().trim().to_uppercase(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|x| x.trim().to_uppercase())
            .filter(|x| !x.is_empty())
            .collect(),
        _ => Vec::new(),
    };
    if items.is_empty() {
        return Ok(REQUIRED_LAYERS.to_vec());
    }

    let mut layers = Vec::new();
    let mut unknown: Vec<String> = Vec::new();
    for item in items {
        match Layer::parse(&item) {
            Some(layer) if !layers.contains(&layer) => layers.push(layer),
            Some(_) => {}
            None if !unknown.contains(&item) => unknown.push(item),
            None => {}
        }
    }
    if !unknown.is_empty() {
        return Err(TaskError::invalid_params("unknown layer(s)").with_details(json!({
            "unknown_layers": unknown,
            "known_layers": known_layer_names(),
        })));
    }
    Ok(layers)
}

/// Rejects a request containing both HEAVY layers.
pub fn check_exclusive(layers: &[Layer]) -> TaskResult<()> {
    if layers.contains(&Layer::HeavyCpu) && layers.contains(&Layer::HeavyGpu) {
        return Err(
            TaskError::invalid_params("HEAVY_CPU and HEAVY_GPU are mutually exclusive")
                .with_details(json!({"layers": layer_names(layers)})),
        );
    }
    Ok(())
}

/// CORE without a HEAVY layer pulls in the one matching the machine.
pub fn auto_complete(layers: &[Layer], gpu_available: bool) -> Vec<Layer> {
    let mut out: Vec<Layer> = Vec::new();
    for layer in layers {
        if !out.contains(layer) {
            out.push(*layer);
        }
    }
    if out.contains(&Layer::Core) && !out.iter().any(Layer::is_heavy) {
        out.push(if gpu_available { Layer::HeavyGpu } else { Layer::HeavyCpu });
    }
    out
}

/// Distribution name of a requirement specifier, normalized like pip does.
pub fn spec_name(spec: &str) -> String {
    let end = spec
        .find(|c: char| matches!(c, '<' | '>' | '=' | '!' | '~' | ' ' | ';' | '[' | '@'))
        .unwrap_or(spec.len());
    normalize_pkg_name(&spec[..end])
}

/// Lowercase with runs of `-`, `_` and `.` collapsed into `-`.
pub fn normalize_pkg_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_sep {
                out.push('-');
            }
            in_sep = true;
        } else {
            out.extend(c.to_lowercase());
            in_sep = false;
        }
    }
    out
}

pub fn is_skipped_package(spec: &str) -> bool {
    let name = spec_name(spec);
    SKIP_PREFIX.iter().any(|p| name.starts_with(p))
}

pub fn is_torch_family(spec: &str) -> bool {
    matches!(spec_name(spec).as_str(), "torch" | "torchvision" | "torchaudio")
}
