use anyhow::{bail, Result};
use latexsnipper::snipper_cli::{ClientError, DaemonClient, WaitOptions};
use latexsnipper::snipper_core::deps::{CudaDetection, InstallerContext};
use latexsnipper::snipper_core::rpc::{request_reply, DEFAULT_HOST};
use latexsnipper::snipper_daemon::model::{
    FormulaExporter, ImageInput, MathMlConverter, PdfRasterizer, RecognitionBackend, RecognitionMode,
};
use latexsnipper::snipper_daemon::{DaemonServer, Services};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;

/// 4x3 white PNG.
const PNG_4X3: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00,
    0x04, 0x00, 0x00, 0x00, 0x03, 0x08, 0x02, 0x00, 0x00, 0x00, 0x8d, 0x2d, 0x4d, 0x1f, 0x00, 0x00, 0x00, 0x11, 0x49,
    0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0xf8, 0x0f, 0x04, 0x0c, 0x48, 0x80, 0x1d, 0x00, 0x9f, 0xbf, 0x17, 0xe9, 0x7f,
    0x22, 0x51, 0x0f, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

const TOKEN: &str = "integration-token";

#[derive(Default)]
struct EchoBackend {
    loaded: bool,
}

impl RecognitionBackend for EchoBackend {
    fn load(&mut self) -> Result<bool> {
        self.loaded = true;
        Ok(true)
    }

    fn is_ready(&self) -> bool {
        self.loaded
    }

    fn status_text(&self) -> String {
        if self.loaded { "model ready (device=cpu)" } else { "model not loaded" }.to_string()
    }

    fn predict(&mut self, image: &ImageInput, model_name: &str, _mode: RecognitionMode) -> Result<String> {
        Ok(format!("pred:{}:{}x{}", model_name, image.width, image.height))
    }
}

struct TwoPagePdf;

impl PdfRasterizer for TwoPagePdf {
    fn page_count(&self, _pdf: &Path) -> Result<u32> {
        Ok(2)
    }

    fn render_page(&self, _pdf: &Path, _index: u32, _dpi: u32) -> Result<ImageInput> {
        ImageInput::from_bytes(PNG_4X3.to_vec())
    }
}

struct NoMathMl;

impl MathMlConverter for NoMathMl {
    fn latex_to_mathml(&self, _latex: &str) -> Result<String> {
        bail!("no converter in tests")
    }
}

fn services() -> Services {
    Services {
        backend_factory: Box::new(|| Box::new(EchoBackend::default())),
        rasterizer: Box::new(TwoPagePdf),
        exporter: FormulaExporter::new(Box::new(NoMathMl)),
        installer: InstallerContext::with_cuda(CudaDetection::none("no GPU in tests")),
        deps_dir: None,
        mirror: false,
    }
}

fn start() -> Result<(DaemonServer, DaemonClient)> {
    let server = DaemonServer::start(DEFAULT_HOST, 0, TOKEN, services())?;
    let client = DaemonClient::attach(DEFAULT_HOST, server.port(), TOKEN);
    Ok((server, client))
}

fn quick() -> WaitOptions {
    WaitOptions { timeout: Duration::from_secs(10), poll_interval: Duration::from_millis(50) }
}

#[cfg(test)]
mod daemon_tests {
    use super::*;

    #[test]
    fn test_health_before_warmup() -> Result<()> {
        let (server, mut client) = start()?;
        let health = client.request("health", json!({}), Duration::from_secs(2), false)?;
        assert_eq!(health["ok"], true);
        assert_eq!(health["ready"], false);
        assert_eq!(health["status"], "model not initialized");
        assert_eq!(health["contract"]["name"], "latexsnipper-daemon-rpc");

        let warm = client.request("warmup", json!({}), Duration::from_secs(5), false)?;
        assert_eq!(warm["ok"], true);
        let health = client.request("health", json!({}), Duration::from_secs(2), false)?;
        assert_eq!(health["ready"], true);

        server.stop();
        server.wait();
        Ok(())
    }

    #[test]
    fn test_predict_image_task() -> Result<()> {
        let (server, mut client) = start()?;
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("formula.png");
        std::fs::write(&image, PNG_4X3)?;

        let task_id = client.submit_task(
            "predict_image",
            json!({"image_path": image.display().to_string(), "model_name": "pix2text_mixed"}),
        )?;
        let task = client.wait_task(&task_id, quick(), |_, _, _| {}, || false)?;
        assert_eq!(task["status"], "success");
        assert_eq!(task["output"]["result"], "pred:pix2text_mixed:4x3");
        // MathML failures are reported, never fatal.
        assert!(task["output"]["result_format_errors"]["mathml"].is_string());

        server.stop();
        server.wait();
        Ok(())
    }

    #[test]
    fn test_predict_pdf_reports_progress() -> Result<()> {
        let (server, mut client) = start()?;
        let dir = tempfile::tempdir()?;
        let pdf = dir.path().join("paper.pdf");
        std::fs::write(&pdf, b"%PDF-1.4\n")?;

        let task_id = client.submit_task(
            "predict_pdf",
            json!({"pdf_path": pdf.display().to_string(), "output_format": "latex"}),
        )?;
        let mut seen = Vec::new();
        let task = client.wait_task(&task_id, quick(), |c, t, _| seen.push((c, t)), || false)?;
        assert_eq!(task["output"]["pages"], 2);
        assert_eq!(task["progress_current"], 2);
        assert_eq!(seen.last(), Some(&(2, 2)));
        let content = task["output"]["content"].as_str().unwrap_or("");
        assert_eq!(content.matches("pred:pix2text:4x3").count(), 2);

        server.stop();
        server.wait();
        Ok(())
    }

    #[test]
    fn test_failed_task_surfaces_code() -> Result<()> {
        let (server, mut client) = start()?;
        let task_id = client.submit_task("predict_image", json!({"image_path": "/definitely/missing.png"}))?;
        match client.wait_task(&task_id, quick(), |_, _, _| {}, || false) {
            Err(ClientError::Task { code, message, .. }) => {
                assert_eq!(code, "TASK_RUNTIME_ERROR");
                assert!(message.contains("image not found"));
            }
            other => panic!("expected a task failure, got {:?}", other),
        }
        server.stop();
        server.wait();
        Ok(())
    }

    #[test]
    fn test_unknown_task_id() -> Result<()> {
        let (server, mut client) = start()?;
        let reply = client.request("task_status", json!({"task_id": "nope"}), Duration::from_secs(2), false)?;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error_code"], "TASK_NOT_FOUND");
        assert_eq!(reply["error_type"], "FileNotFoundError");
        assert_eq!(reply["details"]["task_id"], "nope");
        let last = client.last_error().cloned();
        assert_eq!(last.map(|e| e.error_type), Some("FileNotFoundError".to_string()));

        server.stop();
        server.wait();
        Ok(())
    }

    #[test]
    fn test_bad_token_then_good_token() -> Result<()> {
        let (server, mut client) = start()?;
        let bad = json!({"token": "wrong", "method": "health", "params": {}});
        let reply = request_reply(DEFAULT_HOST, server.port(), &bad, Duration::from_secs(2))?;
        assert_eq!(reply.get("ok"), Some(&Value::Bool(false)));
        assert_eq!(reply.get("error"), Some(&json!("unauthorized")));
        assert_eq!(reply.get("error_code"), Some(&json!("RPC_UNAUTHORIZED")));

        let health = client.request("health", json!({}), Duration::from_secs(2), false)?;
        assert_eq!(health["ok"], true);

        server.stop();
        server.wait();
        Ok(())
    }

    #[test]
    fn test_deprecated_method_points_at_task_submit() -> Result<()> {
        let (server, mut client) = start()?;
        let reply = client.request("predict_image", json!({}), Duration::from_secs(2), false)?;
        assert_eq!(reply["error_code"], "RPC_DEPRECATED_METHOD");
        assert_eq!(reply["details"]["replacement"], "task_submit + task_status");
        assert_eq!(reply["details"]["removal_target"], "2.0.0");

        server.stop();
        server.wait();
        Ok(())
    }

    #[test]
    fn test_shutdown_rpc_stops_the_server() -> Result<()> {
        let (server, mut client) = start()?;
        let reply = client.request("shutdown", json!({}), Duration::from_secs(2), false)?;
        assert_eq!(reply["ok"], true);
        // Returns once both threads have seen the stop flag.
        server.wait();
        Ok(())
    }
}
