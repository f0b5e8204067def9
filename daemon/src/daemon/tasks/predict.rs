// daemon/src/daemon/tasks/predict.rs
use super::check_cancel;
use crate::daemon::state::DaemonState;
use crate::model::export::{
    looks_like_single_formula, to_latex_from_markdown, to_markdown_from_latex, LATEX_PAGE_SEPARATOR,
    MARKDOWN_PAGE_SEPARATOR,
};
use crate::model::ImageInput;
use serde_json::{json, Map, Value};
use snipper_core::error::{TaskError, TaskResult};
use snipper_core::utils::models::{ImageSource, PredictImageParams, PredictPdfParams};

const EXTRA_FORMATS: [&str; 5] = ["mathml", "mathml_mml", "mathml_m", "mathml_attr", "omml"];

fn runtime(err: anyhow::Error) -> TaskError {
    TaskError::runtime(format!("{:#}", err))
}

fn to_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn predict_image(state: &DaemonState, task_id: &str, params: &PredictImageParams) -> TaskResult<Map<String, Value>> {
    check_cancel(state, task_id)?;
    let image = match &params.source {
        ImageSource::Path(path) => ImageInput::from_path(path),
        ImageSource::Base64(raw) => ImageInput::from_base64(raw),
    }
    .map_err(runtime)?;

    // Inference cannot be interrupted; cancellation only rejects the result.
    let text = state.with_wrapper(|w| w.predict(&image, &params.model_name)).map_err(runtime)?;
    check_cancel(state, task_id)?;

    let exported = state.services().exporter.export(&text);
    Ok(to_object(json!({
        "result": text,
        "model_name": params.model_name,
        "result_formats": exported.formats,
        "result_format_errors": exported.errors,
    })))
}

pub fn predict_pdf(state: &DaemonState, task_id: &str, params: &PredictPdfParams) -> TaskResult<Map<String, Value>> {
    let pdf = &params.pdf_path;
    if !pdf.exists() {
        return Err(TaskError::runtime(format!("pdf not found: {}", pdf.display())));
    }
    let rasterizer = &state.services().rasterizer;
    let page_count = rasterizer.page_count(pdf).map_err(runtime)?.max(1);
    let total = if params.max_pages == 0 { page_count } else { params.max_pages.min(page_count) };
    state.set_progress(task_id, 0, total as u64);

    let mut pages = Vec::with_capacity(total as usize);
    for index in 0..total {
        check_cancel(state, task_id)?;
        let image = rasterizer.render_page(pdf, index, params.dpi).map_err(runtime)?;
        let text = state.with_wrapper(|w| w.predict(&image, &params.model_name)).map_err(runtime)?;
        check_cancel(state, task_id)?;
        pages.push(text.trim().to_string());
        state.set_progress(task_id, index as u64 + 1, total as u64);
    }

    let markdown = params.output_format == "markdown";
    let separator = if markdown { MARKDOWN_PAGE_SEPARATOR } else { LATEX_PAGE_SEPARATOR };
    let content = pages.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join(separator);
    if content.trim().is_empty() {
        return Err(TaskError::runtime("recognition result is empty"));
    }

    let mut formats = Map::new();
    let mut format_errors = Map::new();
    if markdown {
        formats.insert("markdown".into(), Value::String(content.trim().to_string()));
        formats.insert("latex".into(), Value::String(to_latex_from_markdown(&content)));
    } else {
        formats.insert("latex".into(), Value::String(content.trim().to_string()));
        formats.insert("markdown".into(), Value::String(to_markdown_from_latex(&content)));
    }
    if looks_like_single_formula(&content) {
        let exported = state.services().exporter.export(&content);
        for key in EXTRA_FORMATS {
            if let Some(v) = exported.formats.get(key).filter(|v| !v.is_empty()) {
                formats.insert(key.into(), Value::String(v.clone()));
            }
            if let Some(e) = exported.errors.get(key).filter(|e| !e.is_empty()) {
                format_errors.insert(key.into(), Value::String(e.clone()));
            }
        }
    }

    Ok(to_object(json!({
        "content": content.trim(),
        "pages": total,
        "output_format": params.output_format,
        "model_name": params.model_name,
        "content_formats": formats,
        "content_format_errors": format_errors,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::state::testing::stub_services;
    use crate::model::testing::PNG_4X3;
    use base64::Engine;
    use snipper_core::utils::models::TaskKind;
    use std::fs;

    fn image_params(source: ImageSource, model: &str) -> PredictImageParams {
        PredictImageParams { source, model_name: model.to_string() }
    }

    #[test]
    fn image_from_base64_carries_exports() {
        let (state, _rx) = DaemonState::new("", stub_services(1));
        let id = state.create_task(TaskKind::PredictImage, Map::new());
        let b64 = base64::engine::general_purpose::STANDARD.encode(PNG_4X3);
        let out = predict_image(&state, &id, &image_params(ImageSource::Base64(b64), "pix2text_mixed")).unwrap();
        assert_eq!(out["result"], "pred:pix2text_mixed:4x3");
        assert_eq!(out["result_formats"]["markdown"], "$$\npred:pix2text_mixed:4x3\n$$\n");
        assert!(out["result_formats"]["mathml"].as_str().unwrap().contains("display=\"block\""));
        assert_eq!(state.model_status().last_used_model.as_deref(), Some("pix2text_mixed"));
    }

    #[test]
    fn missing_image_and_cancellation() {
        let (state, _rx) = DaemonState::new("", stub_services(1));
        let id = state.create_task(TaskKind::PredictImage, Map::new());
        let err = predict_image(&state, &id, &image_params(ImageSource::Path("/nope/x.png".into()), "pix2text")).unwrap_err();
        assert!(err.to_string().starts_with("image not found"));

        state.request_cancel(&id);
        let err = predict_image(&state, &id, &image_params(ImageSource::Path("/nope/x.png".into()), "pix2text")).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn pdf_pages_are_joined_and_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("doc.pdf");
        fs::write(&pdf, b"%PDF-1.4").unwrap();
        let (state, _rx) = DaemonState::new("", stub_services(3));
        let id = state.create_task(TaskKind::PredictPdf, Map::new());
        let params = PredictPdfParams {
            pdf_path: pdf,
            max_pages: 2,
            model_name: "pix2text_page".into(),
            output_format: "latex".into(),
            dpi: 200,
        };
        let out = predict_pdf(&state, &id, &params).unwrap();
        assert_eq!(out["pages"], 2);
        assert_eq!(out["content"], "pred:pix2text_page:4x3\n\n% --- Page ---\n\npred:pix2text_page:4x3");
        assert!(out["content_formats"]["markdown"].as_str().unwrap().starts_with("$$\n"));
        assert!(out["content_formats"].get("mathml").is_none());
        let snap = state.task(&id).unwrap();
        assert_eq!((snap.progress_current, snap.progress_total), (2, 2));
    }

    #[test]
    fn single_page_pdf_gets_formula_exports() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("one.pdf");
        fs::write(&pdf, b"%PDF-1.4").unwrap();
        let (state, _rx) = DaemonState::new("", stub_services(1));
        let id = state.create_task(TaskKind::PredictPdf, Map::new());
        let params = PredictPdfParams {
            pdf_path: pdf,
            max_pages: 0,
            model_name: "pix2text".into(),
            output_format: "markdown".into(),
            dpi: 200,
        };
        let out = predict_pdf(&state, &id, &params).unwrap();
        assert_eq!(out["content_formats"]["latex"], "pred:pix2text:4x3");
        assert!(out["content_formats"]["mathml_attr"].as_str().unwrap().starts_with("<attr:math"));
        assert!(out["content_format_errors"].as_object().unwrap().is_empty());
    }

    #[test]
    fn missing_pdf_fails_before_rendering() {
        let (state, _rx) = DaemonState::new("", stub_services(1));
        let id = state.create_task(TaskKind::PredictPdf, Map::new());
        let params = PredictPdfParams {
            pdf_path: "/nope/doc.pdf".into(),
            max_pages: 0,
            model_name: "pix2text".into(),
            output_format: "markdown".into(),
            dpi: 200,
        };
        assert!(predict_pdf(&state, &id, &params).unwrap_err().to_string().starts_with("pdf not found"));
    }
}
