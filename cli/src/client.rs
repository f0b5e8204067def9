// cli/src/client.rs
//! Owns a daemon child process and talks to it one connection per call.
use serde_json::{json, Map, Value};
use snipper_core::rpc::contract::{METHOD_HEALTH, METHOD_SHUTDOWN, METHOD_TASK_CANCEL, METHOD_TASK_STATUS, METHOD_TASK_SUBMIT};
use snipper_core::rpc::message::{reply_is_ok, str_field, Request};
use snipper_core::rpc::{find_free_port, request_reply, WireError, DEFAULT_HOST};
use snipper_core::utils::models::TaskStatus;
use snipper_core::utils::new_hex_id;
use snipper_core::utils::process::terminate;
use std::env;
use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Overrides where the daemon executable is looked up.
pub const DAEMON_EXE_ENV: &str = "LATEXSNIPPER_DAEMON_EXE";
pub const DAEMON_EXE_NAME: &str = "snipper-daemon";

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(15);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_RETRY: Duration = Duration::from_millis(150);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(15);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_CANCEL_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(2);
const PUMP_JOIN: Duration = Duration::from_millis(800);
const MIN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon start failed: {0}")]
    Start(String),
    #[error("{0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{method} failed: {error} ({error_type})")]
    Remote {
        method: String,
        error: String,
        error_type: String,
        error_code: String,
    },
    #[error("task failed [{code}]: {message}")]
    Task {
        code: String,
        error_type: String,
        message: String,
        details: Map<String, Value>,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Timeout(what) => ClientError::Timeout(format!("timed out waiting for {}", what)),
            WireError::Io(e) => ClientError::Io(e),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// The most recent failure seen by the client, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub method: String,
    pub error: String,
    pub error_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        WaitOptions { timeout: Duration::from_secs(300), poll_interval: Duration::from_millis(200) }
    }
}

type LogFn = Arc<dyn Fn(&str) + Send + Sync>;

pub struct DaemonClient {
    host: String,
    port: u16,
    token: String,
    model: String,
    config: Option<PathBuf>,
    child: Option<Child>,
    pumps: Vec<JoinHandle<()>>,
    log: LogFn,
    last_error: Option<LastError>,
}

/// `$LATEXSNIPPER_DAEMON_EXE`, else `snipper-daemon` next to the running binary.
pub fn resolve_daemon_exe() -> io::Result<PathBuf> {
    if let Some(raw) = env::var_os(DAEMON_EXE_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(raw));
    }
    let exe = env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "executable has no parent directory"))?;
    let name = format!("{}{}", DAEMON_EXE_NAME, env::consts::EXE_SUFFIX);
    // Test binaries live one level below the real ones.
    for candidate in [dir.join(&name), dir.join("..").join(&name)] {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(io::ErrorKind::NotFound, format!("{} not found next to {}", name, exe.display())))
}

impl DaemonClient {
    /// A client that will spawn its own daemon on a free loopback port.
    pub fn new(model: impl Into<String>) -> io::Result<DaemonClient> {
        let port = find_free_port(DEFAULT_HOST)?;
        Ok(DaemonClient::build(DEFAULT_HOST.to_string(), port, new_hex_id(), model.into()))
    }

    /// A client for a daemon somebody else runs. It never autostarts.
    pub fn attach(host: impl Into<String>, port: u16, token: impl Into<String>) -> DaemonClient {
        DaemonClient::build(host.into(), port, token.into(), String::new())
    }

    fn build(host: String, port: u16, token: String, model: String) -> DaemonClient {
        DaemonClient {
            host,
            port,
            token,
            model,
            config: None,
            child: None,
            pumps: Vec::new(),
            log: Arc::new(|line: &str| log::info!("{}", line)),
            last_error: None,
        }
    }

    /// Routes daemon output and client notices to `cb` instead of the log.
    pub fn with_log_callback(mut self, cb: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log = Arc::new(cb);
        self
    }

    /// Passes `--config <path>` to the spawned daemon.
    pub fn with_daemon_config(mut self, path: Option<PathBuf>) -> Self {
        self.config = path;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    fn note(&self, line: &str) {
        let line = line.trim();
        if !line.is_empty() {
            (self.log)(line);
        }
    }

    fn set_last_error(&mut self, method: &str, error: impl Into<String>, error_type: &str) {
        self.last_error =
            Some(LastError { method: method.to_string(), error: error.into(), error_type: error_type.to_string() });
    }

    fn owns_daemon(&self) -> bool {
        !self.model.is_empty()
    }

    /// True while the owned child is running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn pump<R: Read + Send + 'static>(&mut self, source: R, label: &'static str) {
        let log = Arc::clone(&self.log);
        let spawned = thread::Builder::new().name(format!("daemon-{}", label)).spawn(move || {
            for line in BufReader::new(source).lines() {
                match line {
                    Ok(line) => log(&format!("[daemon/{}] {}", label, line.trim_end())),
                    Err(e) => {
                        log(&format!("[WARN] daemon {} pump error: {}", label, e));
                        break;
                    }
                }
            }
        });
        match spawned {
            Ok(handle) => self.pumps.push(handle),
            Err(e) => self.note(&format!("[WARN] could not start {} pump: {}", label, e)),
        }
    }

    /// Spawns the daemon and waits until `health` answers.
    pub fn start(&mut self, timeout: Option<Duration>) -> ClientResult<()> {
        if self.is_alive() {
            return Ok(());
        }
        if !self.owns_daemon() {
            return Err(ClientError::Start("attached client cannot start a daemon".into()));
        }
        let exe = match resolve_daemon_exe() {
            Ok(exe) => exe,
            Err(e) => {
                self.set_last_error("start", e.to_string(), "StartError");
                return Err(ClientError::Start(e.to_string()));
            }
        };

        let mut cmd = Command::new(&exe);
        cmd.args(["--host", &self.host, "--port", &self.port.to_string(), "--token", &self.token, "--model", &self.model])
            .stdin(Stdio::null())
            .args(self.config.iter().flat_map(|p| [OsStr::new("--config"), p.as_os_str()]))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_last_error("start", format!("spawn failed: {}", e), "StartError");
                return Err(ClientError::Start(format!("spawn failed: {} ({})", e, exe.display())));
            }
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pid = child.id();
        self.child = Some(child);
        if let Some(out) = stdout {
            self.pump(out, "stdout");
        }
        if let Some(err) = stderr {
            self.pump(err, "stderr");
        }
        self.note(&format!("[INFO] daemon spawn ok (pid={}, host={}, port={})", pid, self.host, self.port));

        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_START_TIMEOUT);
        while Instant::now() < deadline {
            if !self.is_alive() {
                self.set_last_error("start", "daemon exited during startup", "StartError");
                return Err(ClientError::Start("daemon exited during startup".into()));
            }
            match self.request(METHOD_HEALTH, json!({}), HEALTH_PROBE_TIMEOUT, false) {
                Ok(reply) if reply_is_ok(&reply) => {
                    self.last_error = None;
                    self.note("[INFO] daemon health check passed");
                    return Ok(());
                }
                _ => thread::sleep(HEALTH_RETRY),
            }
        }
        self.set_last_error("start", "health check timeout", "TimeoutError");
        self.note("[WARN] daemon health check timeout");
        Err(ClientError::Timeout("health check timeout".into()))
    }

    /// One RPC round trip on a fresh connection. Non-ok replies are
    /// returned as-is and also remembered in `last_error`.
    pub fn request(&mut self, method: &str, params: Value, timeout: Duration, autostart: bool) -> ClientResult<Map<String, Value>> {
        if autostart && self.owns_daemon() && !self.is_alive() {
            self.start(None)?;
        }
        let params = if params.is_object() { params } else { json!({}) };
        let req = Request::new(self.token.clone(), method, params).to_value();
        let reply = match request_reply(&self.host, self.port, &req, timeout) {
            Ok(reply) => reply,
            Err(e) => {
                self.set_last_error(method, e.to_string(), e.error_type());
                return Err(e.into());
            }
        };
        if !reply_is_ok(&reply) {
            let error_type = match str_field(&reply, "error_type") {
                "" => "RemoteError",
                t => t,
            };
            self.set_last_error(method, str_field(&reply, "error"), error_type);
        }
        Ok(reply)
    }

    fn expect_ok(&mut self, method: &str, params: Value, timeout: Duration) -> ClientResult<Map<String, Value>> {
        let reply = self.request(method, params, timeout, true)?;
        if reply_is_ok(&reply) {
            return Ok(reply);
        }
        Err(ClientError::Remote {
            method: method.to_string(),
            error: match str_field(&reply, "error") {
                "" => format!("{} failed", method),
                e => e.to_string(),
            },
            error_type: str_field(&reply, "error_type").to_string(),
            error_code: str_field(&reply, "error_code").to_string(),
        })
    }

    pub fn submit_task(&mut self, kind: &str, params: Value) -> ClientResult<String> {
        let params = if params.is_object() { params } else { json!({}) };
        let reply = self.expect_ok(METHOD_TASK_SUBMIT, json!({"kind": kind, "params": params}), SUBMIT_TIMEOUT)?;
        match str_field(&reply, "task_id") {
            "" => Err(ClientError::Protocol("task submit failed: empty task_id".into())),
            id => Ok(id.to_string()),
        }
    }

    pub fn get_task_status(&mut self, task_id: &str) -> ClientResult<Map<String, Value>> {
        let mut reply = self.expect_ok(METHOD_TASK_STATUS, json!({"task_id": task_id}), STATUS_TIMEOUT)?;
        match reply.remove("task") {
            Some(Value::Object(task)) => Ok(task),
            _ => Err(ClientError::Protocol("task status invalid".into())),
        }
    }

    pub fn cancel_task(&mut self, task_id: &str) -> ClientResult<bool> {
        self.cancel_with_timeout(task_id, CANCEL_TIMEOUT)
    }

    fn cancel_with_timeout(&mut self, task_id: &str, timeout: Duration) -> ClientResult<bool> {
        let reply = self.request(METHOD_TASK_CANCEL, json!({"task_id": task_id}), timeout, true)?;
        Ok(reply_is_ok(&reply))
    }

    /// Polls until the task is terminal. `progress` fires only when
    /// `(current, total)` changes; a true `cancel` asks the daemon to stop
    /// the task and returns [`ClientError::Cancelled`].
    pub fn wait_task(
        &mut self,
        task_id: &str,
        opts: WaitOptions,
        mut progress: impl FnMut(u64, u64, &Map<String, Value>),
        mut cancel: impl FnMut() -> bool,
    ) -> ClientResult<Map<String, Value>> {
        let started = Instant::now();
        let poll = opts.poll_interval.max(MIN_POLL);
        let mut last: Option<(u64, u64)> = None;
        loop {
            if cancel() {
                if let Err(e) = self.cancel_with_timeout(task_id, WAIT_CANCEL_TIMEOUT) {
                    log::warn!("task_cancel for {} failed: {}", task_id, e);
                }
                return Err(ClientError::Cancelled);
            }

            let task = self.get_task_status(task_id)?;
            let current = task.get("progress_current").and_then(Value::as_u64).unwrap_or(0);
            let total = task.get("progress_total").and_then(Value::as_u64).unwrap_or(0);
            if last != Some((current, total)) {
                progress(current, total, &task);
                last = Some((current, total));
            }

            let status: Option<TaskStatus> = task.get("status").cloned().and_then(|s| serde_json::from_value(s).ok());
            match status {
                Some(TaskStatus::Success) => return Ok(task),
                Some(TaskStatus::Cancelled) => return Err(ClientError::Cancelled),
                Some(TaskStatus::Error) => {
                    return Err(ClientError::Task {
                        code: str_field(&task, "error_code").to_string(),
                        error_type: str_field(&task, "error_type").to_string(),
                        message: match str_field(&task, "error") {
                            "" => "task failed".to_string(),
                            e => e.to_string(),
                        },
                        details: task.get("details").and_then(Value::as_object).cloned().unwrap_or_default(),
                    })
                }
                _ => {}
            }

            if started.elapsed() > opts.timeout {
                return Err(ClientError::Timeout(format!("task timeout ({}s)", opts.timeout.as_secs())));
            }
            thread::sleep(poll);
        }
    }

    /// Asks the daemon to shut down, then makes sure the child is gone.
    pub fn stop(&mut self, force: bool) {
        let Some(pid) = self.child.as_ref().map(Child::id) else {
            return;
        };
        self.note(&format!("[INFO] daemon stop requested (pid={})", pid));
        if self.is_alive() {
            if let Err(e) = self.request(METHOD_SHUTDOWN, json!({}), SHUTDOWN_TIMEOUT, false) {
                log::debug!("shutdown rpc failed: {}", e);
            }
        }
        if let Some(mut child) = self.child.take() {
            if !force {
                let deadline = Instant::now() + STOP_GRACE;
                while Instant::now() < deadline && matches!(child.try_wait(), Ok(None)) {
                    thread::sleep(Duration::from_millis(50));
                }
            }
            terminate(&mut child);
        }

        let deadline = Instant::now() + PUMP_JOIN;
        for handle in self.pumps.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            // Unfinished pumps are detached.
            if handle.is_finished() && handle.join().is_err() {
                log::warn!("daemon output pump panicked");
            }
        }
        self.note("[INFO] daemon stopped");
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snipper_core::rpc::{decode_object, read_line, write_line};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves scripted replies on a loopback port; `respond` sees each request.
    fn fake_daemon<F>(respond: F) -> u16
    where
        F: Fn(&Map<String, Value>) -> Value + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let mut writer = stream.try_clone().unwrap();
                let mut reader = BufReader::new(stream);
                let Ok(line) = read_line(&mut reader, "request") else { continue };
                let req = decode_object(&line, "request").unwrap();
                let _ = write_line(&mut writer, &respond(&req), "response");
            }
        });
        port
    }

    fn fast() -> WaitOptions {
        WaitOptions { timeout: Duration::from_secs(5), poll_interval: Duration::from_millis(1) }
    }

    #[test]
    fn progress_fires_only_on_change() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let port = fake_daemon(move |req| {
            assert_eq!(req["token"], "tok");
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (status, current) = match n {
                0 | 1 => ("running", 1),
                2 | 3 => ("running", 2),
                _ => ("success", 2),
            };
            json!({"ok": true, "task": {"task_id": "t", "status": status, "progress_current": current,
                   "progress_total": 2, "output": {"result": "x"}}})
        });

        let mut client = DaemonClient::attach("127.0.0.1", port, "tok");
        let mut seen = Vec::new();
        let task = client.wait_task("t", fast(), |c, t, _| seen.push((c, t)), || false).unwrap();
        assert_eq!(task["output"]["result"], "x");
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
        assert_eq!(polls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn cancel_callback_sends_task_cancel() {
        let methods = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&methods);
        let port = fake_daemon(move |req| {
            log.lock().unwrap().push(req["method"].as_str().unwrap_or("").to_string());
            json!({"ok": true, "task_id": "t", "task": {"status": "running"}})
        });

        let mut client = DaemonClient::attach("127.0.0.1", port, "");
        let flag = AtomicBool::new(false);
        let err = client
            .wait_task("t", fast(), |_, _, _| flag.store(true, Ordering::SeqCst), || flag.load(Ordering::SeqCst))
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        assert_eq!(*methods.lock().unwrap(), vec!["task_status", "task_cancel"]);
    }

    #[test]
    fn terminal_error_and_cancelled_states() {
        let port = fake_daemon(|req| match req["params"]["task_id"].as_str() {
            Some("bad") => json!({"ok": true, "task": {"status": "error", "error": "boom",
                                  "error_type": "RuntimeError", "error_code": "ENV_IN_USE", "details": {"python": "p"}}}),
            _ => json!({"ok": true, "task": {"status": "cancelled"}}),
        });
        let mut client = DaemonClient::attach("127.0.0.1", port, "");
        match client.wait_task("bad", fast(), |_, _, _| {}, || false).unwrap_err() {
            ClientError::Task { code, message, details, .. } => {
                assert_eq!(code, "ENV_IN_USE");
                assert_eq!(message, "boom");
                assert_eq!(details["python"], "p");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(client.wait_task("gone", fast(), |_, _, _| {}, || false), Err(ClientError::Cancelled)));
    }

    #[test]
    fn wait_times_out() {
        let port = fake_daemon(|_| json!({"ok": true, "task": {"status": "queued"}}));
        let mut client = DaemonClient::attach("127.0.0.1", port, "");
        let opts = WaitOptions { timeout: Duration::from_millis(100), poll_interval: Duration::from_millis(10) };
        assert!(matches!(client.wait_task("t", opts, |_, _, _| {}, || false), Err(ClientError::Timeout(_))));
    }

    #[test]
    fn failed_replies_are_remembered() {
        let port = fake_daemon(|_| {
            json!({"ok": false, "error": "task not found: z", "error_type": "FileNotFoundError", "error_code": "TASK_NOT_FOUND"})
        });
        let mut client = DaemonClient::attach("127.0.0.1", port, "");
        let reply = client.request("task_status", json!({"task_id": "z"}), Duration::from_secs(2), true).unwrap();
        assert!(!reply_is_ok(&reply));
        let last = client.last_error().unwrap();
        assert_eq!(last.method, "task_status");
        assert_eq!(last.error_type, "FileNotFoundError");

        match client.get_task_status("z").unwrap_err() {
            ClientError::Remote { error_code, .. } => assert_eq!(error_code, "TASK_NOT_FOUND"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!client.cancel_task("z").unwrap());
    }

    #[test]
    fn submit_requires_a_task_id() {
        let port = fake_daemon(|_| json!({"ok": true, "task_id": ""}));
        let mut client = DaemonClient::attach("127.0.0.1", port, "");
        assert!(matches!(client.submit_task("predict_image", json!({})), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn attached_client_never_spawns() {
        let port = find_free_port("127.0.0.1").unwrap();
        let mut client = DaemonClient::attach("127.0.0.1", port, "");
        assert!(matches!(client.start(None), Err(ClientError::Start(_))));
        assert!(client.request("health", json!({}), Duration::from_millis(300), true).is_err());
        assert!(!client.is_alive());
    }

    #[test]
    fn fresh_clients_get_distinct_tokens() {
        let a = DaemonClient::new("pix2text").unwrap();
        let b = DaemonClient::new("pix2text").unwrap();
        assert_eq!(a.token().len(), 32);
        assert_ne!(a.token(), b.token());
        assert_ne!(a.port(), 0);
    }
}
