// core/src/utils/process.rs
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const TERMINATE_GRACE: Duration = Duration::from_secs(3);
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Output of a command that ran to completion (or was killed on timeout).
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl Captured {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// How a streamed command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

/// Cooperative controls consulted while a streamed command runs.
pub trait StreamControl {
    fn should_cancel(&self) -> bool {
        false
    }
    fn is_paused(&self) -> bool {
        false
    }
}

/// A control that never pauses or cancels.
pub struct NoControl;

impl StreamControl for NoControl {}

/// Stops a child: SIGTERM first where available, then a hard kill.
pub fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            if kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok() {
                let deadline = Instant::now() + TERMINATE_GRACE;
                while Instant::now() < deadline {
                    if let Ok(Some(_)) = child.try_wait() {
                        return;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    if let Err(e) = child.kill() {
        log::debug!("kill pid={} failed: {}", child.id(), e);
    }
    let _ = child.wait();
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

fn collect(rx: Option<Receiver<Vec<u8>>>) -> String {
    rx.and_then(|rx| rx.recv_timeout(READER_DRAIN).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Runs `cmd` to completion with captured output, killing it after `timeout`.
pub fn run_captured(cmd: &mut Command, timeout: Duration) -> io::Result<Captured> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout_rx = child.stdout.take().map(spawn_reader);
    let stderr_rx = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let code = loop {
        if let Some(status) = child.try_wait()? {
            break status.code();
        }
        if Instant::now() >= deadline {
            timed_out = true;
            terminate(&mut child);
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(Captured {
        code,
        stdout: collect(stdout_rx),
        stderr: collect(stderr_rx),
        timed_out,
    })
}

enum Chunk {
    Line(String),
    Eof,
}

fn spawn_line_reader<R: Read + Send + 'static>(source: R, tx: mpsc::Sender<Chunk>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if tx.send(Chunk::Line(line.to_string())).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(Chunk::Eof);
    });
}

/// Runs `cmd` and hands every stdout/stderr line to `on_line` as it arrives.
/// Pausing holds back further lines and stops the timeout clock; cancelling
/// terminates the child.
pub fn run_streaming(
    cmd: &mut Command,
    timeout: Duration,
    control: &dyn StreamControl,
    on_line: &mut dyn FnMut(&str),
) -> io::Result<StreamEnd> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let (tx, rx) = mpsc::channel();
    let mut open_streams = 0;
    if let Some(out) = child.stdout.take() {
        spawn_line_reader(out, tx.clone());
        open_streams += 1;
    }
    if let Some(err) = child.stderr.take() {
        spawn_line_reader(err, tx.clone());
        open_streams += 1;
    }
    drop(tx);

    let mut deadline = Instant::now() + timeout;
    loop {
        if control.should_cancel() {
            terminate(&mut child);
            return Ok(StreamEnd::Cancelled);
        }
        if control.is_paused() {
            thread::sleep(Duration::from_millis(100));
            deadline += Duration::from_millis(100);
            continue;
        }
        if Instant::now() >= deadline {
            terminate(&mut child);
            return Ok(StreamEnd::TimedOut);
        }

        if open_streams > 0 {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Chunk::Line(line)) => on_line(&line),
                Ok(Chunk::Eof) => open_streams -= 1,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => open_streams = 0,
            }
            continue;
        }

        if let Some(status) = child.try_wait()? {
            return Ok(StreamEnd::Exited(status.code()));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let out = run_captured(&mut sh("echo hello; echo oops >&2; exit 3"), Duration::from_secs(5)).unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.combined(), "hello\noops");
    }

    #[test]
    fn capture_times_out() {
        let started = Instant::now();
        let out = run_captured(&mut sh("sleep 5"), Duration::from_millis(200)).unwrap();
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn streams_lines_in_order() {
        let mut lines = Vec::new();
        let end = run_streaming(
            &mut sh("printf 'a\\nb\\r\\nc'"),
            Duration::from_secs(5),
            &NoControl,
            &mut |l| lines.push(l.to_string()),
        )
        .unwrap();
        assert_eq!(end, StreamEnd::Exited(Some(0)));
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    struct CancelAfter(Cell<u32>);

    impl StreamControl for CancelAfter {
        fn should_cancel(&self) -> bool {
            let n = self.0.get();
            self.0.set(n.saturating_sub(1));
            n == 0
        }
    }

    #[test]
    fn cancel_terminates_child() {
        let control = CancelAfter(Cell::new(3));
        let started = Instant::now();
        let end = run_streaming(&mut sh("sleep 10"), Duration::from_secs(30), &control, &mut |_| {}).unwrap();
        assert_eq!(end, StreamEnd::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
