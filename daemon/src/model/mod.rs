// daemon/src/model/mod.rs
//! The recognition model hosted by the daemon. Inference itself happens in
//! a backend; the wrapper adds model-name routing, lazy loading and the
//! status the control plane reports.

pub mod export;
pub mod pdf;
pub mod pix2text;
pub mod worker_process;

use anyhow::{bail, Context, Result};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub use export::{ExportFormats, FormulaExporter, MathMlConverter};
pub use pdf::{PdfRasterizer, PyMuPdfRasterizer};
pub use pix2text::Pix2TextBackend;
pub use worker_process::WorkerProcess;

/// What the recognizer is asked to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMode {
    Formula,
    Text,
    Mixed,
    Page,
    Table,
}

impl RecognitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMode::Formula => "formula",
            RecognitionMode::Text => "text",
            RecognitionMode::Mixed => "mixed",
            RecognitionMode::Page => "page",
            RecognitionMode::Table => "table",
        }
    }

    /// `pix2text_<mode>` model names; anything unrecognized reads formulas.
    pub fn for_model(model_name: &str) -> RecognitionMode {
        match model_name {
            "pix2text_text" => RecognitionMode::Text,
            "pix2text_mixed" => RecognitionMode::Mixed,
            "pix2text_page" => RecognitionMode::Page,
            "pix2text_table" => RecognitionMode::Table,
            _ => RecognitionMode::Formula,
        }
    }
}

/// Lowercased model name; names outside the pix2text family fall back to `pix2text`.
pub fn normalize_model_name(raw: &str) -> String {
    let model = raw.trim().to_lowercase();
    if model.starts_with("pix2text") {
        model
    } else {
        "pix2text".to_string()
    }
}

/// Encoded image bytes with their sniffed dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Set when the image already lives on disk.
    pub path: Option<PathBuf>,
}

fn lenient_base64() -> GeneralPurpose {
    GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    )
}

impl ImageInput {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<ImageInput> {
        let size = imagesize::blob_size(&bytes).map_err(|e| anyhow::anyhow!("image load failed: {}", e))?;
        if size.width == 0 || size.height == 0 {
            bail!("image load failed: empty image");
        }
        Ok(ImageInput { bytes, width: size.width as u32, height: size.height as u32, path: None })
    }

    pub fn from_path(path: &Path) -> Result<ImageInput> {
        if !path.exists() {
            bail!("image not found: {}", path.display());
        }
        let bytes = fs::read(path).with_context(|| format!("image load failed: {}", path.display()))?;
        let mut image = ImageInput::from_bytes(bytes)?;
        image.path = Some(path.to_path_buf());
        Ok(image)
    }

    /// Accepts plain base64 or a `data:...;base64,` URL; padding is optional.
    pub fn from_base64(raw: &str) -> Result<ImageInput> {
        let mut payload = raw.trim();
        if payload.starts_with("data:") {
            if let Some((_, rest)) = payload.split_once(',') {
                payload = rest;
            }
        }
        let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = lenient_base64().decode(cleaned.as_bytes()).context("image_b64 decode failed")?;
        if bytes.is_empty() {
            bail!("image_b64 empty after decode");
        }
        ImageInput::from_bytes(bytes)
    }
}

/// Runs inference. Implementations own whatever process or handle does the work.
pub trait RecognitionBackend: Send {
    /// Loads the model if needed; `Ok(false)` means loading failed and was recorded.
    fn load(&mut self) -> Result<bool>;

    fn is_ready(&self) -> bool;

    fn status_text(&self) -> String;

    fn predict(&mut self, image: &ImageInput, model_name: &str, mode: RecognitionMode) -> Result<String>;

    /// Pid and interpreter of a nested inference process, when one runs.
    fn worker(&self) -> Option<(u32, PathBuf)> {
        None
    }

    /// Stops the nested process; true when nothing is left running.
    fn stop_worker(&mut self) -> bool {
        true
    }
}

/// What `health` and `model_status` report without touching the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub ready: bool,
    pub status: String,
    pub last_used_model: Option<String>,
}

impl ModelStatus {
    pub fn not_initialized() -> Self {
        ModelStatus { ready: false, status: "model not initialized".to_string(), last_used_model: None }
    }
}

pub struct ModelWrapper {
    backend: Box<dyn RecognitionBackend>,
    last_used_model: Option<String>,
}

impl ModelWrapper {
    pub fn new(backend: Box<dyn RecognitionBackend>) -> Self {
        ModelWrapper { backend, last_used_model: None }
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_ready()
    }

    pub fn warmup(&mut self) -> Result<bool> {
        if self.backend.is_ready() {
            return Ok(true);
        }
        self.backend.load()
    }

    pub fn predict(&mut self, image: &ImageInput, model_name: &str) -> Result<String> {
        let model = normalize_model_name(model_name);
        let mode = RecognitionMode::for_model(&model);
        if !self.backend.is_ready() {
            self.backend.load()?;
        }
        if !self.backend.is_ready() {
            bail!("pix2text not ready");
        }
        self.last_used_model = Some(model.clone());
        self.backend.predict(image, &model, mode)
    }

    pub fn status(&self) -> ModelStatus {
        ModelStatus {
            ready: self.backend.is_ready(),
            status: self.backend.status_text(),
            last_used_model: self.last_used_model.clone(),
        }
    }

    pub fn worker(&self) -> Option<(u32, PathBuf)> {
        self.backend.worker()
    }

    pub fn stop_worker(&mut self) -> bool {
        self.backend.stop_worker()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn model_names_route_to_modes() {
        assert_eq!(RecognitionMode::for_model("pix2text_mixed"), RecognitionMode::Mixed);
        assert_eq!(RecognitionMode::for_model("pix2text"), RecognitionMode::Formula);
        assert_eq!(normalize_model_name("Pix2Text_Table"), "pix2text_table");
        assert_eq!(normalize_model_name("latexocr"), "pix2text");
    }

    #[test]
    fn image_sniffing() {
        let img = ImageInput::from_bytes(PNG_4X3.to_vec()).unwrap();
        assert_eq!((img.width, img.height), (4, 3));
        assert!(ImageInput::from_bytes(b"not an image".to_vec()).unwrap_err().to_string().starts_with("image load failed"));
    }

    #[test]
    fn base64_is_lenient() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(PNG_4X3);
        let unpadded = encoded.trim_end_matches('=');
        let img = ImageInput::from_base64(&format!("data:image/png;base64,{}", unpadded)).unwrap();
        assert_eq!((img.width, img.height), (4, 3));
        assert!(ImageInput::from_base64("").is_err());
    }

    #[test]
    fn wrapper_loads_lazily_and_tracks_last_model() {
        let mut wrapper = ModelWrapper::new(Box::new(EchoBackend::default()));
        assert!(!wrapper.is_ready());
        assert_eq!(wrapper.status().last_used_model, None);

        let img = ImageInput::from_bytes(PNG_4X3.to_vec()).unwrap();
        assert_eq!(wrapper.predict(&img, "pix2text_mixed").unwrap(), "pred:pix2text_mixed:4x3");
        let status = wrapper.status();
        assert!(status.ready);
        assert_eq!(status.last_used_model.as_deref(), Some("pix2text_mixed"));
    }

    #[test]
    fn failed_load_is_reported() {
        let mut wrapper = ModelWrapper::new(Box::new(EchoBackend { fail_load: true, ..Default::default() }));
        assert!(!wrapper.warmup().unwrap());
        let img = ImageInput::from_bytes(PNG_4X3.to_vec()).unwrap();
        assert_eq!(wrapper.predict(&img, "pix2text").unwrap_err().to_string(), "pix2text not ready");
    }
}
