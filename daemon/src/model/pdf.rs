// daemon/src/model/pdf.rs
use super::worker_process::extract_json;
use super::ImageInput;
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use snipper_core::deps::python::resolve_python_for_deps;
use snipper_core::utils::process::run_captured;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const PAGE_COUNT_CODE: &str = r#"
import json, sys
import fitz
doc = fitz.open(sys.argv[1])
print(json.dumps({"pages": doc.page_count}))
"#;

const RENDER_CODE: &str = r#"
import json, sys
import fitz
doc = fitz.open(sys.argv[1])
page = doc.load_page(int(sys.argv[2]))
dpi = int(sys.argv[3])
pix = page.get_pixmap(matrix=fitz.Matrix(dpi / 72.0, dpi / 72.0), alpha=False)
pix.save(sys.argv[4])
print(json.dumps({"ok": True, "width": pix.width, "height": pix.height}))
"#;

/// Turns PDF pages into images the recognizer can read.
pub trait PdfRasterizer: Send + Sync {
    fn page_count(&self, pdf: &Path) -> Result<u32>;

    fn render_page(&self, pdf: &Path, index: u32, dpi: u32) -> Result<ImageInput>;
}

/// Renders with PyMuPDF inside the dependency interpreter.
pub struct PyMuPdfRasterizer {
    deps_dir: Option<PathBuf>,
    page_timeout: Duration,
}

impl PyMuPdfRasterizer {
    pub fn new(deps_dir: Option<PathBuf>) -> Self {
        PyMuPdfRasterizer { deps_dir, page_timeout: Duration::from_secs(120) }
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = timeout;
        self
    }

    fn run(&self, code: &str, args: &[String]) -> Result<serde_json::Map<String, Value>> {
        let (python, _) = resolve_python_for_deps(self.deps_dir.as_deref()).map_err(|e| anyhow!("{}", e))?;
        let mut cmd = Command::new(&python);
        cmd.arg("-c").arg(code).args(args).env("PYTHONIOENCODING", "utf-8");
        let out = run_captured(&mut cmd, self.page_timeout).context("pdf renderer could not start")?;
        if out.timed_out {
            bail!("pdf render timed out after {:?}", self.page_timeout);
        }
        if !out.success() {
            let tail: Vec<&str> = out.stderr.lines().rev().take(3).collect();
            bail!("pdf render failed: {}", tail.into_iter().rev().collect::<Vec<_>>().join(" | "));
        }
        out.stdout
            .lines()
            .rev()
            .find_map(extract_json)
            .ok_or_else(|| anyhow!("pdf renderer returned no JSON"))
    }
}

impl PdfRasterizer for PyMuPdfRasterizer {
    fn page_count(&self, pdf: &Path) -> Result<u32> {
        let info = self.run(PAGE_COUNT_CODE, &[pdf.display().to_string()])?;
        info.get("pages")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .ok_or_else(|| anyhow!("pdf renderer reported no page count"))
    }

    fn render_page(&self, pdf: &Path, index: u32, dpi: u32) -> Result<ImageInput> {
        let scratch = tempfile::Builder::new().prefix("latexsnipper-pdf-").tempdir()?;
        let png = scratch.path().join(format!("page-{}.png", index + 1));
        self.run(
            RENDER_CODE,
            &[pdf.display().to_string(), index.to_string(), dpi.to_string(), png.display().to_string()],
        )?;
        let bytes = std::fs::read(&png).with_context(|| format!("page {} was not rendered", index + 1))?;
        ImageInput::from_bytes(bytes)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn fake_python(dir: &Path, body: &str) {
        let python = dir.join("python");
        fs::write(&python, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&python, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn page_count_is_read_from_json() {
        let dir = tempfile::tempdir().unwrap();
        fake_python(dir.path(), r#"echo 'MuPDF warning'; echo '{"pages": 7}'"#);
        let raster = PyMuPdfRasterizer::new(Some(dir.path().to_path_buf()));
        assert_eq!(raster.page_count(Path::new("doc.pdf")).unwrap(), 7);
    }

    #[test]
    fn render_failure_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        fake_python(dir.path(), "echo \"ModuleNotFoundError: No module named 'fitz'\" >&2; exit 1");
        let raster = PyMuPdfRasterizer::new(Some(dir.path().to_path_buf()));
        let err = raster.render_page(Path::new("doc.pdf"), 0, 200).unwrap_err().to_string();
        assert!(err.contains("fitz"), "{}", err);
    }

    #[test]
    fn slow_renderer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        fake_python(dir.path(), "sleep 5");
        let raster = PyMuPdfRasterizer::new(Some(dir.path().to_path_buf())).with_page_timeout(Duration::from_millis(200));
        assert!(raster.page_count(Path::new("doc.pdf")).unwrap_err().to_string().contains("timed out"));
    }
}
