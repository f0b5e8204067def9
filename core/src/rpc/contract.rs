// core/src/rpc/contract.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const CONTRACT_NAME: &str = "latexsnipper-daemon-rpc";
pub const CONTRACT_VERSION: &str = "1.0.0";
pub const DEFAULT_CONTRACT_FILE: &str = "daemon_rpc_contract.v1.json";
pub const CONTRACT_ENV: &str = "LATEXSNIPPER_RPC_CONTRACT";

pub const METHOD_HEALTH: &str = "health";
pub const METHOD_WARMUP: &str = "warmup";
pub const METHOD_MODEL_STATUS: &str = "model_status";
pub const METHOD_PREDICT_IMAGE: &str = "predict_image";
pub const METHOD_TASK_SUBMIT: &str = "task_submit";
pub const METHOD_TASK_STATUS: &str = "task_status";
pub const METHOD_TASK_CANCEL: &str = "task_cancel";
pub const METHOD_SHUTDOWN: &str = "shutdown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcContract {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub transport: Value,
    #[serde(default)]
    pub auth: Value,
    #[serde(default)]
    pub enums: RpcEnums,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcEnums {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub deprecated_methods: Vec<String>,
    #[serde(default)]
    pub task_kinds: Vec<String>,
    #[serde(default)]
    pub task_status: Vec<String>,
    #[serde(default)]
    pub task_terminal_status: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    #[serde(default)]
    pub params_required: Vec<String>,
    #[serde(default)]
    pub params_optional: Vec<String>,
    #[serde(default)]
    pub response_ok_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractSummary {
    pub path: String,
    pub name: String,
    pub version: String,
    pub methods: Vec<String>,
    pub task_kinds: Vec<String>,
}

/// A contract together with the place it was loaded from.
#[derive(Debug, Clone)]
pub struct ContractRegistry {
    contract: RpcContract,
    source: Option<PathBuf>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn method_spec(required: &[&str], optional: &[&str], fields: &[&str]) -> MethodSpec {
    MethodSpec {
        params_required: strings(required),
        params_optional: strings(optional),
        response_ok_fields: strings(fields),
    }
}

impl RpcContract {
    /// Built-in copy of `contracts/daemon_rpc_contract.v1.json`.
    pub fn fallback() -> Self {
        let mut methods = BTreeMap::new();
        methods.insert(
            METHOD_HEALTH.to_string(),
            method_spec(&[], &[], &["ok", "pid", "ready", "status", "model", "contract"]),
        );
        methods.insert(METHOD_WARMUP.to_string(), method_spec(&[], &[], &["ok", "ready"]));
        methods.insert(
            METHOD_MODEL_STATUS.to_string(),
            method_spec(&[], &[], &["ok", "ready", "status", "last_used_model"]),
        );
        methods.insert(
            METHOD_TASK_SUBMIT.to_string(),
            method_spec(&["kind"], &["params"], &["ok", "task_id"]),
        );
        methods.insert(METHOD_TASK_STATUS.to_string(), method_spec(&["task_id"], &[], &["ok", "task"]));
        methods.insert(METHOD_TASK_CANCEL.to_string(), method_spec(&["task_id"], &[], &["ok", "task_id"]));
        methods.insert(METHOD_SHUTDOWN.to_string(), method_spec(&[], &[], &["ok"]));

        RpcContract {
            name: CONTRACT_NAME.to_string(),
            version: CONTRACT_VERSION.to_string(),
            transport: serde_json::json!({
                "type": "tcp",
                "host": "127.0.0.1",
                "framing": "json-lines",
                "max_message_bytes": crate::rpc::MAX_LINE_BYTES,
            }),
            auth: serde_json::json!({"type": "shared-token", "field": "token"}),
            enums: RpcEnums {
                methods: strings(&[
                    METHOD_HEALTH,
                    METHOD_WARMUP,
                    METHOD_MODEL_STATUS,
                    METHOD_TASK_SUBMIT,
                    METHOD_TASK_STATUS,
                    METHOD_TASK_CANCEL,
                    METHOD_SHUTDOWN,
                ]),
                deprecated_methods: strings(&[METHOD_PREDICT_IMAGE]),
                task_kinds: strings(&["predict_image", "predict_pdf", "install_deps", "switch_cpu_gpu"]),
                task_status: strings(&["queued", "running", "success", "error", "cancelled"]),
                task_terminal_status: strings(&["success", "error", "cancelled"]),
            },
            methods,
        }
    }
}

/// Lookup order: env override, `contracts/` under the cwd and its parents,
/// then `contracts/` next to the executable and its parents.
pub fn default_contract_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();

    if let Ok(raw) = std::env::var(CONTRACT_ENV) {
        let raw = raw.trim();
        if !raw.is_empty() {
            out.push(PathBuf::from(raw));
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().take(3) {
            out.push(dir.join("contracts").join(DEFAULT_CONTRACT_FILE));
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            for dir in exe_dir.ancestors().take(4) {
                out.push(dir.join("contracts").join(DEFAULT_CONTRACT_FILE));
            }
        }
    }
    out
}

fn read_contract(path: &Path) -> Option<RpcContract> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<RpcContract>(&raw) {
        Ok(contract) => Some(contract),
        Err(e) => {
            log::warn!("ignoring malformed contract {}: {}", path.display(), e);
            None
        }
    }
}

impl ContractRegistry {
    pub fn new(contract: RpcContract, source: Option<PathBuf>) -> Self {
        ContractRegistry { contract, source }
    }

    pub fn fallback() -> Self {
        ContractRegistry::new(RpcContract::fallback(), None)
    }

    /// First readable candidate wins; otherwise the built-in contract.
    pub fn load_from(candidates: &[PathBuf]) -> Self {
        for path in candidates {
            if path.is_file() {
                if let Some(contract) = read_contract(path) {
                    log::debug!("loaded rpc contract from {}", path.display());
                    return ContractRegistry::new(contract, Some(path.clone()));
                }
            }
        }
        ContractRegistry::fallback()
    }

    pub fn load() -> Self {
        ContractRegistry::load_from(&default_contract_candidates())
    }

    /// Process-wide registry, loaded on first use.
    pub fn global() -> &'static ContractRegistry {
        static REGISTRY: OnceLock<ContractRegistry> = OnceLock::new();
        REGISTRY.get_or_init(ContractRegistry::load)
    }

    pub fn contract(&self) -> &RpcContract {
        &self.contract
    }

    pub fn name(&self) -> &str {
        &self.contract.name
    }

    pub fn version(&self) -> &str {
        &self.contract.version
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn is_known_method(&self, method: &str) -> bool {
        let enums = &self.contract.enums;
        enums.methods.iter().chain(&enums.deprecated_methods).any(|m| m == method)
    }

    pub fn is_deprecated_method(&self, method: &str) -> bool {
        self.contract.enums.deprecated_methods.iter().any(|m| m == method)
    }

    pub fn is_supported_task_kind(&self, kind: &str) -> bool {
        self.contract.enums.task_kinds.iter().any(|k| k == kind)
    }

    pub fn is_terminal_status(&self, status: &str) -> bool {
        self.contract.enums.task_terminal_status.iter().any(|s| s == status)
    }

    pub fn method_params_required(&self, method: &str) -> &[String] {
        self.contract
            .methods
            .get(method)
            .map(|spec| spec.params_required.as_slice())
            .unwrap_or(&[])
    }

    /// Methods in contract order, for error messages.
    pub fn known_methods(&self) -> Vec<String> {
        let mut out = self.contract.enums.methods.clone();
        out.extend(self.contract.enums.deprecated_methods.iter().cloned());
        out
    }

    pub fn summary(&self) -> ContractSummary {
        ContractSummary {
            path: self
                .source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<builtin>".to_string()),
            name: self.contract.name.clone(),
            version: self.contract.version.clone(),
            methods: self.contract.enums.methods.clone(),
            task_kinds: self.contract.enums.task_kinds.clone(),
        }
    }
}
