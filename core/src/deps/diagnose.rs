// core/src/deps/diagnose.rs
use crate::rpc::message::ErrorCode;

/// Markers that make a log line the primary error candidate.
pub const ERROR_FLAGS: [&str; 6] = ["[FATAL]", "[ERR]", "[FAIL]", "Traceback", "RuntimeError", "ERROR"];

pub fn has_error_flag(line: &str) -> bool {
    ERROR_FLAGS.iter().any(|f| line.contains(f))
}

struct Rule {
    diagnosis: &'static str,
    any_of: &'static [&'static str],
}

// Order matters: the first matching rule wins.
const RULES: &[Rule] = &[
    Rule {
        diagnosis: "file lock or permission problem: close programs using the environment or run as administrator",
        any_of: &[
            "permission denied",
            "access is denied",
            "being used by another process",
            "permissionerror",
            "winerror 5",
            "winerror 32",
            "errno 13",
        ],
    },
    Rule {
        diagnosis: "dependency conflict: another installed package pins an incompatible version",
        any_of: &[
            "conflicting dependencies",
            "incompatible",
            "no matching distribution",
            "could not find a version",
            "resolutionimpossible",
            "package requires",
        ],
    },
    Rule {
        diagnosis: "network problem: check the connection or switch between the mirror and the official index",
        any_of: &[
            "connection refused",
            "connection timed out",
            "could not fetch url",
            "network is unreachable",
            "name or service not known",
            "getaddrinfo failed",
            "ssl: certificate",
            "readtimeouterror",
            "connectionerror",
        ],
    },
    Rule {
        diagnosis: "not enough disk space",
        any_of: &["no space left", "disk full", "not enough space", "oserror: [errno 28]"],
    },
    Rule {
        diagnosis: "building from source failed: a compiler toolchain (e.g. Microsoft Visual C++ Build Tools) is missing",
        any_of: &["building wheel", "failed building", "error: command", "microsoft visual c++", "vcvarsall.bat", "cl.exe"],
    },
    Rule {
        diagnosis: "the package does not support this Python version",
        any_of: &["requires python", "python_requires", "not supported"],
    },
    Rule {
        diagnosis: "pip itself is broken: reinstall pip in the target interpreter",
        any_of: &["pip._internal", "attributeerror", "no module named 'pip'"],
    },
];

const CUDA_WORDS: [&str; 4] = ["cuda", "cudnn", "nvidia", "gpu"];

/// Human readable guess at why a pip run failed.
pub fn diagnose_pip_failure(output: &str, return_code: Option<i32>) -> &'static str {
    let text = output.to_lowercase();
    if let Some(rule) = RULES.iter().find(|r| r.any_of.iter().any(|p| text.contains(p))) {
        return rule.diagnosis;
    }
    if CUDA_WORDS.iter().any(|w| text.contains(w)) && text.contains("error") {
        return "CUDA related failure: check the driver and that the selected torch build matches it";
    }
    match return_code {
        Some(1) => "general pip error: see the log above",
        Some(2) => "pip command syntax error",
        _ => "unknown error",
    }
}

/// Picks the line to report and maps the whole log to an install error code.
pub fn classify_install_failure(lines: &[String]) -> (String, ErrorCode) {
    let primary = lines
        .iter()
        .rev()
        .find(|l| has_error_flag(l))
        .or_else(|| lines.last())
        .cloned()
        .unwrap_or_else(|| "unknown install failure".to_string());

    let text = lines.join("\n").to_lowercase();
    let code = if text.contains("winerror 5") || text.contains("拒绝访问") || text.contains("access is denied") {
        ErrorCode::EnvFileLocked
    } else if text.contains("daemon runtime already loaded torch stack") {
        ErrorCode::DaemonEnvLocked
    } else if text.contains("target python is in use by other processes") {
        ErrorCode::EnvInUse
    } else if text.contains("no module named 'torchvision'") {
        ErrorCode::TorchvisionMissing
    } else {
        ErrorCode::TaskRuntimeError
    };
    (primary, code)
}
