// cli/src/cli/predict.rs
use super::Session;
use anyhow::{bail, Context, Result};
use colored::*;
use serde_json::{json, Map, Value};
use snipper_core::utils::models::TaskKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
pub struct PredictImageCommand {
    /// Image file to recognize
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    /// Model name, e.g. pix2text, pix2text_mixed, pix2text_text
    #[structopt(long, default_value = "pix2text")]
    model: String,

    /// Seconds to wait for the result
    #[structopt(long, default_value = "300")]
    timeout: u64,
}

#[derive(StructOpt, Debug)]
pub struct PredictPdfCommand {
    /// PDF file to recognize
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    /// Model name
    #[structopt(long, default_value = "pix2text")]
    model: String,

    /// Pages to read; 0 reads all of them
    #[structopt(long, default_value = "0")]
    max_pages: u32,

    /// Output format: markdown or latex
    #[structopt(long = "format", default_value = "markdown", possible_values = &["markdown", "latex"])]
    format: String,

    /// Render resolution
    #[structopt(long, default_value = "200")]
    dpi: u32,

    /// Seconds to wait for the result
    #[structopt(long, default_value = "1800")]
    timeout: u64,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        bail!("File not found: {}", path.display());
    }
    path.canonicalize().with_context(|| format!("Failed to resolve path: {}", path.display()))
}

fn to_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn print_format_errors(output: &Map<String, Value>, key: &str) {
    if let Some(errors) = output.get(key).and_then(Value::as_object) {
        for (format, err) in errors {
            println!("{} {} export unavailable: {}", "[WARN]".yellow(), format, err.as_str().unwrap_or(""));
        }
    }
}

impl PredictImageCommand {
    pub fn execute(self, session: &Session) -> Result<()> {
        let path = absolute(&self.path)?;
        let mut runner = session.runner()?;
        println!("{} recognizing {} with {}", "[INFO]".blue(), path.display().to_string().cyan(), self.model);
        let params = to_object(json!({"image_path": path, "model_name": self.model}));
        let result = runner.run(TaskKind::PredictImage, params, Duration::from_secs(self.timeout));
        runner.shutdown();
        let output = result?;

        println!("{} model={}", "[SUCCESS]".green(), output.get("model_name").and_then(Value::as_str).unwrap_or(""));
        println!("{}", output.get("result").and_then(Value::as_str).unwrap_or(""));
        if session.verbose {
            print_format_errors(&output, "result_format_errors");
        }
        Ok(())
    }
}

impl PredictPdfCommand {
    pub fn execute(self, session: &Session) -> Result<()> {
        let path = absolute(&self.path)?;
        let mut runner = session.runner()?;
        println!("{} recognizing {} ({} output, dpi {})", "[INFO]".blue(), path.display().to_string().cyan(), self.format, self.dpi);
        let params = to_object(json!({
            "pdf_path": path,
            "max_pages": self.max_pages,
            "model_name": self.model,
            "output_format": self.format,
            "dpi": self.dpi,
        }));
        let result = runner.run(TaskKind::PredictPdf, params, Duration::from_secs(self.timeout));
        runner.shutdown();
        let output = result?;

        println!(
            "{} {} page(s) recognized",
            "[SUCCESS]".green(),
            output.get("pages").and_then(Value::as_u64).unwrap_or(0)
        );
        println!("{}", output.get("content").and_then(Value::as_str).unwrap_or(""));
        if session.verbose {
            print_format_errors(&output, "content_format_errors");
        }
        Ok(())
    }
}
