// core/src/deps/context.rs
use super::cuda::{detect_cuda, CudaDetection, CudaPlan};
use crate::utils::process::StreamControl;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

/// Timeouts for every subprocess the installer starts.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub cuda_probe: Duration,
    pub pip_probe: Duration,
    pub pip_list: Duration,
    pub pip_install: Duration,
    pub uninstall: Duration,
    pub repair_uninstall: Duration,
    pub verify: Duration,
    pub strict_verify: Duration,
    pub smoke: Duration,
    pub torch_info: Duration,
    /// Sleep between pip retries.
    pub retry_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            cuda_probe: Duration::from_secs(5),
            pip_probe: Duration::from_secs(30),
            pip_list: Duration::from_secs(45),
            pip_install: Duration::from_secs(1200),
            uninstall: Duration::from_secs(120),
            repair_uninstall: Duration::from_secs(240),
            verify: Duration::from_secs(60),
            strict_verify: Duration::from_secs(180),
            smoke: Duration::from_secs(45),
            torch_info: Duration::from_secs(8),
            retry_delay: Duration::from_secs(3),
        }
    }
}

/// Per-session installer state: CUDA is probed once and pip runs one at a time.
pub struct InstallerContext {
    cuda: OnceLock<CudaDetection>,
    pip_lock: Mutex<()>,
    pub timeouts: Timeouts,
}

impl Default for InstallerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallerContext {
    pub fn new() -> Self {
        InstallerContext { cuda: OnceLock::new(), pip_lock: Mutex::new(()), timeouts: Timeouts::default() }
    }

    /// A context whose CUDA detection is already settled.
    pub fn with_cuda(detection: CudaDetection) -> Self {
        let ctx = Self::new();
        let _ = ctx.cuda.set(detection);
        ctx
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn cuda(&self) -> &CudaDetection {
        self.cuda.get_or_init(|| {
            let detection = detect_cuda(self.timeouts.cuda_probe);
            log::info!("cuda detection: {}", detection.note);
            detection
        })
    }

    pub fn gpu_plan(&self) -> Option<&'static CudaPlan> {
        self.cuda().plan()
    }

    /// Serializes pip invocations against the target interpreter.
    pub fn pip_guard(&self) -> MutexGuard<'_, ()> {
        self.pip_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Receives installer output and supplies pause/cancel state.
pub trait InstallObserver {
    fn log(&self, line: &str);

    fn progress(&self, _current: u64, _total: u64) {}

    fn should_cancel(&self) -> bool {
        false
    }

    fn is_paused(&self) -> bool {
        false
    }
}

/// Forwards installer output to the `log` facade.
pub struct LogObserver;

impl InstallObserver for LogObserver {
    fn log(&self, line: &str) {
        log::info!("{}", line);
    }
}

/// Lets an observer drive a streamed subprocess.
pub(crate) struct ObserverControl<'a>(pub &'a dyn InstallObserver);

impl StreamControl for ObserverControl<'_> {
    fn should_cancel(&self) -> bool {
        self.0.should_cancel()
    }

    fn is_paused(&self) -> bool {
        self.0.is_paused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuda_is_detected_once() {
        let ctx = InstallerContext::with_cuda(CudaDetection::found((12, 6), "nvcc"));
        assert_eq!(ctx.gpu_plan().unwrap().tag, "cu126");
        assert!(std::ptr::eq(ctx.cuda(), ctx.cuda()));

        let cpu_only = InstallerContext::with_cuda(CudaDetection::none("no gpu"));
        assert!(cpu_only.gpu_plan().is_none());
    }

    #[test]
    fn pip_guard_survives_poison() {
        let ctx = std::sync::Arc::new(InstallerContext::with_cuda(CudaDetection::none("x")));
        let c = ctx.clone();
        let _ = std::thread::spawn(move || {
            let _g = c.pip_guard();
            panic!("poison");
        })
        .join();
        drop(ctx.pip_guard());
    }
}
