// daemon/src/daemon/handlers/model_handler.rs
use crate::daemon::state::DaemonState;
use anyhow::Result;
use serde_json::{json, Value};
use snipper_core::rpc::contract::ContractRegistry;
use snipper_core::utils::models::DEFAULT_MODEL_NAME;

/// Liveness plus model readiness. Reads the cached status only, so it
/// answers even while a prediction holds the model.
pub fn handle_health(state: &DaemonState) -> Result<Value> {
    let status = state.model_status();
    let contract = ContractRegistry::global();
    Ok(json!({
        "ok": true,
        "pid": std::process::id(),
        "ready": status.ready,
        "status": status.status,
        "model": DEFAULT_MODEL_NAME,
        "contract": {"name": contract.name(), "version": contract.version()},
    }))
}

/// Creates the wrapper if needed and runs the lazy load in the foreground.
/// A failed load is not an error reply: it answers `{ok: false, ready}` with
/// no `error`/`error_type`, and `model_status` carries the reason.
pub fn handle_warmup(state: &DaemonState) -> Result<Value> {
    log::info!("Handling warmup request");
    let loaded = state.with_wrapper(|w| w.warmup())?;
    let ready = state.model_status().ready;
    if !loaded {
        log::warn!("warmup finished without a ready model: {}", state.model_status().status);
    }
    Ok(json!({"ok": loaded, "ready": ready}))
}

pub fn handle_model_status(state: &DaemonState) -> Result<Value> {
    let status = state.model_status();
    Ok(json!({
        "ok": true,
        "ready": status.ready,
        "status": status.status,
        "last_used_model": status.last_used_model,
    }))
}
