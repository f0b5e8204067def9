// core/src/deps/cuda.rs
use crate::gpu::monitor::GpuMonitor;
use crate::utils::process::run_captured;
use serde::Serialize;
use std::fmt;
use std::process::Command;
use std::time::Duration;

pub const PIP_INDEX_OFFICIAL: &str = "https://pypi.org/simple";
pub const PIP_INDEX_TUNA: &str = "https://pypi.tuna.tsinghua.edu.cn/simple";
pub const TORCH_INDEX_BASE: &str = "https://download.pytorch.org/whl";
pub const ORT_CPU_SPEC: &str = "onnxruntime~=1.19.2";
pub const ORT_GPU_SPEC_DEFAULT: &str = "onnxruntime-gpu~=1.19.2";
pub const ORT_GPU_SPEC_CU118: &str = "onnxruntime-gpu~=1.18.1";

/// Lowest CUDA version that gets a GPU plan.
pub const MIN_CUDA: (u32, u32) = (11, 8);

/// Exact torch triple for one wheel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CudaPlan {
    /// CUDA version the wheels target; `(0, 0)` for CPU wheels.
    pub cuda: (u32, u32),
    pub tag: &'static str,
    pub torch: &'static str,
    pub torchvision: &'static str,
    pub torchaudio: &'static str,
}

const fn plan(cuda: (u32, u32), tag: &'static str, torch: &'static str, vision: &'static str) -> CudaPlan {
    CudaPlan { cuda, tag, torch, torchvision: vision, torchaudio: torch }
}

/// Ordered by CUDA version; lookups rely on that.
pub const TORCH_CUDA_MATRIX: [CudaPlan; 7] = [
    plan((11, 8), "cu118", "2.7.1", "0.22.1"),
    plan((12, 1), "cu121", "2.5.1", "0.20.1"),
    plan((12, 4), "cu124", "2.5.1", "0.20.1"),
    plan((12, 6), "cu126", "2.7.1", "0.22.1"),
    plan((12, 8), "cu128", "2.7.1", "0.22.1"),
    plan((12, 9), "cu129", "2.8.0", "0.23.0"),
    plan((13, 0), "cu130", "2.9.0", "0.24.0"),
];

pub const TORCH_CPU_PLAN: CudaPlan = plan((0, 0), "cpu", "2.9.0", "0.24.0");

impl CudaPlan {
    pub fn is_gpu(&self) -> bool {
        self.tag != "cpu"
    }

    pub fn index_url(&self) -> String {
        format!("{}/{}", TORCH_INDEX_BASE, self.tag)
    }

    /// Pinned spec for a torch-family package name.
    pub fn spec_for(&self, name: &str) -> Option<String> {
        let version = match name {
            "torch" => self.torch,
            "torchvision" => self.torchvision,
            "torchaudio" => self.torchaudio,
            _ => return None,
        };
        Some(format!("{}=={}", name, version))
    }

    pub fn torch_specs(&self) -> [String; 3] {
        [
            format!("torch=={}", self.torch),
            format!("torchvision=={}", self.torchvision),
            format!("torchaudio=={}", self.torchaudio),
        ]
    }

    /// ONNX Runtime build matching this plan.
    pub fn onnxruntime_spec(&self) -> &'static str {
        match self.tag {
            "cpu" => ORT_CPU_SPEC,
            "cu118" => ORT_GPU_SPEC_CU118,
            _ => ORT_GPU_SPEC_DEFAULT,
        }
    }

    /// Copy-pasteable install command for this triple.
    pub fn pip_command(&self, pyexe: &str) -> String {
        let [torch, vision, audio] = self.torch_specs();
        format!(
            "\"{}\" -m pip install {} {} {} --index-url {} --extra-index-url {}",
            pyexe,
            torch,
            vision,
            audio,
            self.index_url(),
            PIP_INDEX_OFFICIAL
        )
    }
}

impl fmt::Display for CudaPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (torch {}, torchvision {}, torchaudio {})", self.tag, self.torch, self.torchvision, self.torchaudio)
    }
}

/// Highest matrix entry not above `version`; versions past the top of the
/// matrix get the top entry and anything below 11.8 gets nothing.
pub fn pick_plan(version: (u32, u32)) -> Option<&'static CudaPlan> {
    if version < MIN_CUDA {
        return None;
    }
    TORCH_CUDA_MATRIX.iter().rev().find(|p| p.cuda <= version)
}

pub fn plan_for_tag(tag: &str) -> Option<&'static CudaPlan> {
    let tag = tag.trim().to_lowercase();
    if tag == TORCH_CPU_PLAN.tag {
        return Some(&TORCH_CPU_PLAN);
    }
    TORCH_CUDA_MATRIX.iter().find(|p| p.tag == tag)
}

// --- Version text parsing ---

fn parse_major_minor(s: &str) -> Option<(u32, u32)> {
    let digits_end = |t: &str| t.find(|c: char| !c.is_ascii_digit()).unwrap_or(t.len());
    let major_end = digits_end(s);
    if major_end == 0 {
        return None;
    }
    let rest = s[major_end..].strip_prefix('.')?;
    let minor_end = digits_end(rest);
    if minor_end == 0 {
        return None;
    }
    Some((s[..major_end].parse().ok()?, rest[..minor_end].parse().ok()?))
}

/// Finds `X.Y` right after `marker` (optional whitespace allowed).
fn find_after(text: &str, marker: &str, word_start: bool) -> Option<(u32, u32)> {
    let mut from = 0;
    while let Some(pos) = text[from..].find(marker) {
        let start = from + pos;
        let boundary_ok = !word_start
            || start == 0
            || !text[..start].chars().next_back().is_some_and(|c| c.is_alphanumeric() || c == '_');
        let after = text[start + marker.len()..].trim_start();
        if boundary_ok {
            if let Some(v) = parse_major_minor(after) {
                return Some(v);
            }
        }
        from = start + marker.len();
    }
    None
}

/// Reads a CUDA version from nvcc, nvidia-smi or CUDA_PATH style text.
pub fn parse_cuda_version(text: &str) -> Option<(u32, u32)> {
    let lower = text.to_lowercase();
    find_after(&lower, "release", false)
        .or_else(|| find_after(&lower, "v", true))
        .or_else(|| find_after(&lower, "cuda version:", false))
}

/// A CUDA_PATH like `C:\...\CUDA\v12.4` or `/usr/local/cuda-12.4`.
pub fn parse_cuda_path(path: &str) -> Option<(u32, u32)> {
    let last = path
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()?
        .to_lowercase();
    let last = last.trim_start_matches("cuda").trim_start_matches(['-', '_']);
    parse_major_minor(last.trim_start_matches('v'))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CudaDetection {
    pub version: Option<(u32, u32)>,
    /// nvcc, CUDA_PATH, nvidia-smi, nvml or none
    pub source: &'static str,
    pub note: String,
}

impl CudaDetection {
    pub fn none(note: impl Into<String>) -> Self {
        CudaDetection { version: None, source: "none", note: note.into() }
    }

    pub fn found(version: (u32, u32), source: &'static str) -> Self {
        let note = match pick_plan(version) {
            Some(p) if version > TORCH_CUDA_MATRIX[TORCH_CUDA_MATRIX.len() - 1].cuda => format!(
                "CUDA {}.{} via {} is above the supported matrix, falling back to {}",
                version.0, version.1, source, p.tag
            ),
            Some(p) => format!("CUDA {}.{} via {}, using {}", version.0, version.1, source, p.tag),
            None => format!("CUDA {}.{} via {} is below 11.8, no GPU build available", version.0, version.1, source),
        };
        CudaDetection { version: Some(version), source, note }
    }

    pub fn plan(&self) -> Option<&'static CudaPlan> {
        self.version.and_then(pick_plan)
    }
}

fn probe_command(program: &str, args: &[&str], timeout: Duration) -> Option<(u32, u32)> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    match run_captured(&mut cmd, timeout) {
        Ok(out) if !out.timed_out => parse_cuda_version(&out.combined()),
        Ok(_) => {
            log::debug!("{} timed out after {:?}", program, timeout);
            None
        }
        Err(e) => {
            log::debug!("{} unavailable: {}", program, e);
            None
        }
    }
}

/// nvcc, then CUDA_PATH, then nvidia-smi, then the NVML driver query.
pub fn detect_cuda(timeout: Duration) -> CudaDetection {
    if let Some(v) = probe_command("nvcc", &["--version"], timeout) {
        return CudaDetection::found(v, "nvcc");
    }
    if let Some(v) = std::env::var("CUDA_PATH").ok().as_deref().and_then(parse_cuda_path) {
        return CudaDetection::found(v, "CUDA_PATH");
    }
    if let Some(v) = probe_command("nvidia-smi", &[], timeout) {
        return CudaDetection::found(v, "nvidia-smi");
    }
    match GpuMonitor::new().and_then(|m| m.driver_cuda_version()) {
        Ok(v) => CudaDetection::found(v, "nvml"),
        Err(e) => {
            log::debug!("nvml probe failed: {:#}", e);
            CudaDetection::none("no nvcc, CUDA_PATH, nvidia-smi or NVML driver found")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_boundaries() {
        let p = pick_plan((11, 8)).unwrap();
        assert_eq!((p.tag, p.torch, p.torchvision), ("cu118", "2.7.1", "0.22.1"));
        let p = pick_plan((13, 0)).unwrap();
        assert_eq!((p.tag, p.torch), ("cu130", "2.9.0"));
        assert!(pick_plan((11, 7)).is_none());
        assert!(pick_plan((10, 2)).is_none());
        assert_eq!(pick_plan((12, 3)).unwrap().tag, "cu121");
        assert_eq!(pick_plan((12, 5)).unwrap().tag, "cu124");
        assert_eq!(pick_plan((14, 2)).unwrap().tag, "cu130");
    }

    #[test]
    fn matrix_picks_largest_key_not_above_version() {
        for major in 11..=14 {
            for minor in 0..=9 {
                let version = (major, minor);
                match pick_plan(version) {
                    None => assert!(version < MIN_CUDA),
                    Some(p) => {
                        assert!(p.cuda <= version);
                        let better = TORCH_CUDA_MATRIX.iter().any(|q| q.cuda <= version && q.cuda > p.cuda);
                        assert!(!better, "{:?} skipped a closer entry", version);
                    }
                }
            }
        }
    }

    #[test]
    fn plan_helpers() {
        let p = plan_for_tag("CU118").unwrap();
        assert_eq!(p.onnxruntime_spec(), "onnxruntime-gpu~=1.18.1");
        assert_eq!(plan_for_tag("cu126").unwrap().onnxruntime_spec(), ORT_GPU_SPEC_DEFAULT);
        assert_eq!(plan_for_tag("cpu").unwrap().onnxruntime_spec(), ORT_CPU_SPEC);
        assert!(plan_for_tag("cu999").is_none());
        assert_eq!(p.index_url(), "https://download.pytorch.org/whl/cu118");
        assert_eq!(p.spec_for("torchaudio").as_deref(), Some("torchaudio==2.7.1"));
        assert!(!TORCH_CPU_PLAN.is_gpu());
        assert!(TORCH_CPU_PLAN.pip_command("py").contains("--index-url https://download.pytorch.org/whl/cpu"));
    }

    #[test]
    fn parses_probe_output() {
        let nvcc = "nvcc: NVIDIA (R) Cuda compiler driver\nCuda compilation tools, release 12.4, V12.4.131";
        assert_eq!(parse_cuda_version(nvcc), Some((12, 4)));
        assert_eq!(parse_cuda_version("Build cuda_11.8.r11.8/compiler V11.8.89"), Some((11, 8)));
        let smi = "| NVIDIA-SMI 550.54  Driver Version: 550.54  CUDA Version: 12.4 |";
        assert_eq!(parse_cuda_version(smi), Some((12, 4)));
        assert_eq!(parse_cuda_version("nothing here"), None);
    }

    #[test]
    fn parses_cuda_path() {
        assert_eq!(parse_cuda_path(r"C:\Program Files\NVIDIA GPU Computing Toolkit\CUDA\v12.6"), Some((12, 6)));
        assert_eq!(parse_cuda_path("/usr/local/cuda-11.8/"), Some((11, 8)));
        assert_eq!(parse_cuda_path("/usr/local/cuda"), None);
    }

    #[test]
    fn detection_notes() {
        let d = CudaDetection::found((13, 2), "nvml");
        assert_eq!(d.plan().unwrap().tag, "cu130");
        assert!(d.note.contains("above the supported matrix"));
        assert!(CudaDetection::found((11, 0), "nvcc").plan().is_none());
        assert!(CudaDetection::none("x").plan().is_none());
    }
}
