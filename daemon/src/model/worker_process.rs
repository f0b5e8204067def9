// daemon/src/model/worker_process.rs
//! A long-lived child speaking JSON lines over stdin/stdout.
//!
//! The child announces itself with one `{"ready": true, "ok": ..}` line, then
//! answers each request line with one reply object. `{"ping": true}` is the
//! health probe and `__quit__` asks it to exit.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Map, Value};
use snipper_core::utils::process::terminate;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const QUIT_LINE: &str = "__quit__";
const QUIT_GRACE: Duration = Duration::from_millis(500);

/// Extracts the first JSON object embedded in a line of child output.
pub fn extract_json(line: &str) -> Option<Map<String, Value>> {
    let start = line.find('{')?;
    let end = line.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&line[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    hello: Map<String, Value>,
}

impl WorkerProcess {
    /// Spawns `cmd` and waits up to `ready_timeout` for its ready line.
    pub fn spawn(mut cmd: Command, ready_timeout: Duration) -> Result<WorkerProcess> {
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().context("failed to start inference worker")?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("inference worker has no stdout"))?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    log::debug!("[worker/stderr] {}", line);
                }
            });
        }

        let mut worker = WorkerProcess { child, stdin, lines: rx, hello: Map::new() };
        match worker.next_object(ready_timeout, |m| m.get("ready").is_some()) {
            Ok(hello) => {
                worker.hello = hello;
                Ok(worker)
            }
            Err(e) => {
                worker.terminate();
                Err(e.context("inference worker did not report ready"))
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The ready line the child printed at start-up.
    pub fn hello(&self) -> &Map<String, Value> {
        &self.hello
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn next_object(
        &mut self,
        timeout: Duration,
        accept: impl Fn(&Map<String, Value>) -> bool,
    ) -> Result<Map<String, Value>> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                bail!("inference worker timed out after {:?}", timeout);
            }
            match self.lines.recv_timeout(left) {
                Ok(line) => match extract_json(line.trim()) {
                    Some(obj) if accept(&obj) => return Ok(obj),
                    Some(_) => {}
                    None if line.trim().is_empty() => {}
                    None => log::debug!("[worker/stdout] {}", line.trim()),
                },
                Err(RecvTimeoutError::Timeout) => bail!("inference worker timed out after {:?}", timeout),
                Err(RecvTimeoutError::Disconnected) => bail!("inference worker no output"),
            }
        }
    }

    fn send(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| anyhow!("inference worker stdin closed"))?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush())
            .context("inference worker send failed")
    }

    /// Sends one request object and returns the next reply object.
    pub fn request(&mut self, request: &Value, timeout: Duration) -> Result<Map<String, Value>> {
        if !self.is_alive() {
            bail!("inference worker not running");
        }
        self.send(&request.to_string())?;
        self.next_object(timeout, |_| true)
    }

    pub fn health(&mut self, timeout: Duration) -> bool {
        match self.request(&json!({"ping": true}), timeout) {
            Ok(reply) => reply.get("ok").and_then(Value::as_bool).unwrap_or(false),
            Err(e) => {
                log::debug!("inference worker health failed: {}", e);
                false
            }
        }
    }

    /// Asks the child to quit, then terminates it if it lingers.
    pub fn terminate(&mut self) {
        let _ = self.send(QUIT_LINE);
        self.stdin = None;
        let deadline = Instant::now() + QUIT_GRACE;
        while Instant::now() < deadline {
            if !self.is_alive() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        terminate(&mut self.child);
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.terminate();
        }
    }
}
