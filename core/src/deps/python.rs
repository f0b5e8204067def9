// core/src/deps/python.rs
use crate::error::{TaskError, TaskResult};
use crate::rpc::message::ErrorCode;
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

pub const PYEXE_ENV: &str = "LATEXSNIPPER_PYEXE";

/// Most processes reported in an ENV_IN_USE error.
pub const MAX_REPORTED_PROCESSES: usize = 12;

fn python_candidates(deps_dir: &Path) -> Vec<PathBuf> {
    let rel: &[&[&str]] = &[
        &["python311", "python.exe"],
        &["python311", "python"],
        &["python.exe"],
        &["python"],
        &["Scripts", "python.exe"],
        &["bin", "python3"],
        &["venv", "Scripts", "python.exe"],
        &["venv", "bin", "python"],
        &[".venv", "Scripts", "python.exe"],
        &[".venv", "bin", "python"],
    ];
    rel.iter()
        .map(|parts| parts.iter().fold(deps_dir.to_path_buf(), |p, part| p.join(part)))
        .collect()
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| names.iter().map(move |n| dir.join(n)))
        .find(|p| p.is_file())
}

fn lower_name(p: &Path) -> String {
    p.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default()
}

/// The deps dir an interpreter belongs to.
pub fn deps_dir_for_python(pyexe: &Path) -> PathBuf {
    let parent = pyexe.parent().unwrap_or(Path::new("."));
    match lower_name(parent).as_str() {
        "python311" | "scripts" | "bin" => parent.parent().unwrap_or(parent).to_path_buf(),
        _ => parent.to_path_buf(),
    }
}

/// Interpreter that dependency work should target, plus its deps dir.
pub fn resolve_python_for_deps(deps_dir: Option<&Path>) -> TaskResult<(PathBuf, PathBuf)> {
    if let Some(dir) = deps_dir.filter(|d| !d.as_os_str().is_empty()) {
        return python_candidates(dir)
            .into_iter()
            .find(|c| c.is_file())
            .map(|py| (py, dir.to_path_buf()))
            .ok_or_else(|| {
                TaskError::invalid_params("deps_dir does not contain a usable python interpreter")
                    .with_details(json!({"deps_dir": dir.display().to_string()}))
            });
    }

    let from_env = std::env::var_os(PYEXE_ENV)
        .map(PathBuf::from)
        .filter(|p| p.is_file());
    let py = from_env
        .or_else(|| find_on_path(&["python3", "python", "python.exe"]))
        .ok_or_else(|| {
            TaskError::rpc("python interpreter not found", ErrorCode::TaskRuntimeError)
                .with_details(json!({"python": std::env::var(PYEXE_ENV).unwrap_or_default()}))
        })?;
    let dir = deps_dir_for_python(&py);
    Ok((py, dir))
}

/// `site-packages` of an interpreter, Windows layout first.
pub fn site_packages(pyexe: &Path) -> PathBuf {
    let parent = pyexe.parent().unwrap_or(Path::new("."));
    let base = if matches!(lower_name(parent).as_str(), "scripts" | "bin") {
        parent.parent().unwrap_or(parent)
    } else {
        parent
    };
    let windows = base.join("Lib").join("site-packages");
    if windows.is_dir() {
        return windows;
    }
    // POSIX: lib/python3.X/site-packages
    if let Ok(entries) = fs::read_dir(base.join("lib")) {
        let mut found: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path().join("site-packages"))
            .filter(|p| {
                p.is_dir() && p.parent().is_some_and(|v| lower_name(v).starts_with("python"))
            })
            .collect();
        found.sort();
        if let Some(last) = found.pop() {
            return last;
        }
    }
    windows
}

/// Removes `~orch*` directories pip leaves behind after an interrupted
/// torch upgrade. Returns what was removed.
pub fn cleanup_torch_leftovers(pyexe: &Path) -> Vec<PathBuf> {
    let site = site_packages(pyexe);
    let Ok(entries) = fs::read_dir(&site) else {
        return Vec::new();
    };
    let mut removed = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with("~orch") {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
        match result {
            Ok(()) => removed.push(path),
            Err(e) => log::warn!("could not remove leftover {}: {}", path.display(), e),
        }
    }
    if !removed.is_empty() {
        log::info!("cleaned invalid torch leftovers: {}", removed.len());
    }
    removed
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PythonProcess {
    pub pid: u32,
    pub name: String,
    pub exe: String,
    pub cmdline: String,
}

fn normalized(p: &Path) -> String {
    fs::canonicalize(p)
        .unwrap_or_else(|_| p.to_path_buf())
        .to_string_lossy()
        .to_lowercase()
}

/// Other processes running the given interpreter (by executable or by
/// command line). The current process is never reported.
pub fn processes_using_python(pyexe: &Path) -> Vec<PythonProcess> {
    let target = normalized(pyexe);
    let mut aliases = vec![target.clone()];
    if cfg!(windows) {
        if let Some(dir) = pyexe.parent() {
            aliases.push(normalized(&dir.join("pythonw.exe")));
        }
    }
    let own_pid = std::process::id();

    let sys = sysinfo::System::new_all();
    let mut out = Vec::new();
    for (pid, process) in sys.processes() {
        let pid = pid.as_u32();
        if pid == 0 || pid == own_pid {
            continue;
        }
        let exe = process.exe().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        let cmdline = process
            .cmd()
            .iter()
            .take(12)
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let exe_match = !exe.is_empty() && aliases.contains(&normalized(Path::new(&exe)));
        let cmd_lower = cmdline.to_lowercase();
        let cmd_match = aliases.iter().any(|a| cmd_lower.contains(a.as_str()));
        if exe_match || cmd_match {
            out.push(PythonProcess {
                pid,
                name: process.name().to_string_lossy().into_owned(),
                exe,
                cmdline: cmdline.trim().to_string(),
            });
        }
    }
    out.sort_by_key(|p| p.pid);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn touch(path: &Path) -> Result<()> {
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, b"")?;
        Ok(())
    }

    #[test]
    fn resolves_first_existing_candidate() -> Result<()> {
        let dir = tempfile::tempdir()?;
        touch(&dir.path().join(".venv").join("bin").join("python"))?;
        touch(&dir.path().join("bin").join("python3"))?;
        let (py, deps) = resolve_python_for_deps(Some(dir.path()))?;
        assert_eq!(py, dir.path().join("bin").join("python3"));
        assert_eq!(deps, dir.path());
        Ok(())
    }

    #[test]
    fn empty_deps_dir_is_invalid_params() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = resolve_python_for_deps(Some(dir.path())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RpcInvalidParams);
        assert!(err.details().unwrap().contains_key("deps_dir"));
        Ok(())
    }

    #[test]
    fn deps_dir_from_interpreter() {
        assert_eq!(deps_dir_for_python(Path::new("/d/python311/python.exe")), Path::new("/d"));
        assert_eq!(deps_dir_for_python(Path::new("/d/venv/Scripts/python.exe")), Path::new("/d/venv"));
        assert_eq!(deps_dir_for_python(Path::new("/d/python")), Path::new("/d"));
    }

    #[test]
    fn site_packages_layouts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let venv = dir.path().join("venv");
        fs::create_dir_all(venv.join("lib").join("python3.11").join("site-packages"))?;
        assert_eq!(
            site_packages(&venv.join("bin").join("python")),
            venv.join("lib").join("python3.11").join("site-packages")
        );

        let win = dir.path().join("py");
        fs::create_dir_all(win.join("Lib").join("site-packages"))?;
        assert_eq!(site_packages(&win.join("Scripts").join("python.exe")), win.join("Lib").join("site-packages"));
        assert_eq!(site_packages(&win.join("python.exe")), win.join("Lib").join("site-packages"));
        Ok(())
    }

    #[test]
    fn cleans_tilde_leftovers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let site = dir.path().join("Lib").join("site-packages");
        touch(&site.join("~orch").join("lib").join("x.dll"))?;
        touch(&site.join("~orchvision-0.1.dist-info"))?;
        fs::create_dir_all(site.join("torch"))?;
        let removed = cleanup_torch_leftovers(&dir.path().join("python.exe"));
        assert_eq!(removed.len(), 2);
        assert!(site.join("torch").exists());
        assert!(!site.join("~orch").exists());
        Ok(())
    }

    #[test]
    fn current_process_is_not_reported() {
        let exe = std::env::current_exe().unwrap();
        let own = std::process::id();
        assert!(processes_using_python(&exe).iter().all(|p| p.pid != own));
    }
}
