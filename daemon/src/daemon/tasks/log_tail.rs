// daemon/src/daemon/tasks/log_tail.rs
use crate::daemon::state::DaemonState;
use serde_json::{Map, Value};
use snipper_core::deps::diagnose::has_error_flag;
use snipper_core::deps::InstallObserver;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RING_LINES: usize = 320;
const FLUSH_LINES: usize = 120;
const FLUSH_INTERVAL: Duration = Duration::from_millis(350);

struct Ring {
    lines: VecDeque<String>,
    last_flush: Option<Instant>,
}

/// Feeds installer output into the task's `details.log_tail` so a polling
/// client sees live progress. Also relays progress and cancellation.
pub struct TaskLogTail<'a> {
    state: &'a DaemonState,
    task_id: &'a str,
    ring: Mutex<Ring>,
}

impl<'a> TaskLogTail<'a> {
    pub fn new(state: &'a DaemonState, task_id: &'a str) -> Self {
        TaskLogTail { state, task_id, ring: Mutex::new(Ring { lines: VecDeque::new(), last_flush: None }) }
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, ring: &mut Ring) {
        let skip = ring.lines.len().saturating_sub(FLUSH_LINES);
        let text = ring.lines.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n");
        let mut patch = Map::new();
        patch.insert("log_tail".into(), Value::String(text));
        self.state.merge_details(self.task_id, patch);
        ring.last_flush = Some(Instant::now());
    }

    /// Publishes whatever is buffered.
    pub fn flush(&self) {
        let mut ring = self.ring();
        if !ring.lines.is_empty() {
            self.publish(&mut ring);
        }
    }

    /// Everything still held in the ring, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.ring().lines.iter().cloned().collect()
    }
}

impl InstallObserver for TaskLogTail<'_> {
    fn log(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        log::info!("[deps] {}", line);
        let mut ring = self.ring();
        ring.lines.push_back(line.to_string());
        while ring.lines.len() > RING_LINES {
            ring.lines.pop_front();
        }
        let due = ring.last_flush.map_or(true, |t| t.elapsed() >= FLUSH_INTERVAL);
        if due || has_error_flag(line) {
            self.publish(&mut ring);
        }
    }

    fn progress(&self, current: u64, total: u64) {
        self.state.set_progress(self.task_id, current, total);
    }

    fn should_cancel(&self) -> bool {
        self.state.should_cancel(self.task_id)
    }
}
