// daemon/src/daemon/state.rs
use crate::model::export::PythonMathMlConverter;
use crate::model::{
    FormulaExporter, ModelStatus, ModelWrapper, PdfRasterizer, Pix2TextBackend, PyMuPdfRasterizer, RecognitionBackend,
};
use serde_json::{Map, Value};
use snipper_core::deps::InstallerContext;
use snipper_core::error::TaskError;
use snipper_core::utils::models::{TaskKind, TaskSnapshot, TaskStatus};
use snipper_core::utils::{new_hex_id, now_ts};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

pub type BackendFactory = Box<dyn Fn() -> Box<dyn RecognitionBackend> + Send + Sync>;

/// Collaborators the daemon drives. Tests swap in stubs.
pub struct Services {
    pub backend_factory: BackendFactory,
    pub rasterizer: Box<dyn PdfRasterizer>,
    pub exporter: FormulaExporter,
    pub installer: InstallerContext,
    /// Default deps dir for tasks that do not name one.
    pub deps_dir: Option<PathBuf>,
    /// Default mirror choice for install tasks.
    pub mirror: bool,
}

impl Services {
    pub fn production(deps_dir: Option<PathBuf>, mirror: bool) -> Services {
        let backend_dir = deps_dir.clone();
        Services {
            backend_factory: Box::new(move || Box::new(Pix2TextBackend::new(backend_dir.clone()))),
            rasterizer: Box::new(PyMuPdfRasterizer::new(deps_dir.clone())),
            exporter: FormulaExporter::new(Box::new(PythonMathMlConverter::new(deps_dir.clone()))),
            installer: InstallerContext::new(),
            deps_dir,
            mirror,
        }
    }
}

struct TaskRecord {
    snapshot: TaskSnapshot,
    params: Map<String, Value>,
}

struct Inner {
    token: String,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    queue: Mutex<Option<Sender<String>>>,
    wrapper: Mutex<Option<ModelWrapper>>,
    // Mirrors the wrapper so health never waits behind inference.
    model_status: Mutex<ModelStatus>,
    services: Services,
    stopping: AtomicBool,
}

/// Shared daemon state: the task table, the queue feeding the worker and the model.
#[derive(Clone)]
pub struct DaemonState {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DaemonState {
    /// Creates the state and the receiving end of the task queue.
    pub fn new(token: impl Into<String>, services: Services) -> (DaemonState, Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let state = DaemonState {
            inner: Arc::new(Inner {
                token: token.into(),
                tasks: Mutex::new(HashMap::new()),
                queue: Mutex::new(Some(tx)),
                wrapper: Mutex::new(None),
                model_status: Mutex::new(ModelStatus::not_initialized()),
                services,
                stopping: AtomicBool::new(false),
            }),
        };
        (state, rx)
    }

    pub fn token(&self) -> &str {
        &self.inner.token
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    // --- Task related methods ---

    pub fn create_task(&self, kind: TaskKind, params: Map<String, Value>) -> String {
        let task_id = new_hex_id();
        let snapshot = TaskSnapshot::new(task_id.clone(), kind, now_ts());
        lock(&self.inner.tasks).insert(task_id.clone(), TaskRecord { snapshot, params });
        if let Some(tx) = lock(&self.inner.queue).as_ref() {
            if tx.send(task_id.clone()).is_err() {
                log::warn!("task queue closed; task {} will not run", task_id);
            }
        }
        log::info!("task_queued task_id={} kind={}", task_id, kind.as_str());
        task_id
    }

    pub fn task(&self, task_id: &str) -> Option<TaskSnapshot> {
        lock(&self.inner.tasks).get(task_id).map(|r| r.snapshot.clone())
    }

    pub fn task_params(&self, task_id: &str) -> Option<Map<String, Value>> {
        lock(&self.inner.tasks).get(task_id).map(|r| r.params.clone())
    }

    /// Applies `f` to a task's record; `None` when the id is unknown.
    pub fn update_task<R>(&self, task_id: &str, f: impl FnOnce(&mut TaskSnapshot) -> R) -> Option<R> {
        lock(&self.inner.tasks).get_mut(task_id).map(|r| f(&mut r.snapshot))
    }

    /// Flags a task for cooperative cancellation. A task still waiting in
    /// the queue is cancelled on the spot; the worker skips it later.
    /// Idempotent.
    pub fn request_cancel(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.update_task(task_id, |t| {
            t.cancel_requested = true;
            if t.status == TaskStatus::Queued {
                t.mark_failed(&TaskError::Cancelled, now_ts());
            }
            t.clone()
        })
    }

    pub fn should_cancel(&self, task_id: &str) -> bool {
        self.update_task(task_id, |t| t.cancel_requested).unwrap_or(false)
    }

    pub fn set_progress(&self, task_id: &str, current: u64, total: u64) {
        let snap = self.update_task(task_id, |t| {
            t.set_progress(current, total);
            (t.kind, t.progress_current, t.progress_total, t.status)
        });
        if let Some((kind, cur, tot, status)) = snap {
            log::info!(
                "task_progress task_id={} kind={} progress_current={} progress_total={} status={}",
                task_id,
                kind.as_str(),
                cur,
                tot,
                status
            );
        }
    }

    pub fn merge_details(&self, task_id: &str, patch: Map<String, Value>) {
        self.update_task(task_id, |t| t.merge_details(patch));
    }

    // --- Model related methods ---

    pub fn model_status(&self) -> ModelStatus {
        lock(&self.inner.model_status).clone()
    }

    /// Runs `f` against the wrapper, creating it on first use. The status
    /// cache is refreshed afterwards.
    pub fn with_wrapper<R>(&self, f: impl FnOnce(&mut ModelWrapper) -> R) -> R {
        let mut guard = lock(&self.inner.wrapper);
        let wrapper = guard.get_or_insert_with(|| {
            log::info!("creating model wrapper");
            ModelWrapper::new((self.inner.services.backend_factory)())
        });
        let out = f(wrapper);
        *lock(&self.inner.model_status) = wrapper.status();
        out
    }

    /// Like `with_wrapper`, but never creates one.
    pub fn with_existing_wrapper<R>(&self, f: impl FnOnce(&mut ModelWrapper) -> R) -> Option<R> {
        let mut guard = lock(&self.inner.wrapper);
        let wrapper = guard.as_mut()?;
        let out = f(wrapper);
        *lock(&self.inner.model_status) = wrapper.status();
        Some(out)
    }

    // --- Lifecycle ---

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Stops accepting tasks and lets the worker drain out.
    pub fn begin_stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.inner.queue).take();
        self.with_existing_wrapper(|w| w.stop_worker());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::export::testing::StubConverter;
    use crate::model::testing::EchoBackend;
    use crate::model::ImageInput;
    use anyhow::{bail, Result};
    use snipper_core::deps::CudaDetection;
    use std::path::Path;

    /// Every page renders as the stub PNG.
    pub struct StubRasterizer {
        pub pages: u32,
    }

    impl PdfRasterizer for StubRasterizer {
        fn page_count(&self, pdf: &Path) -> Result<u32> {
            if !pdf.exists() {
                bail!("cannot open {}", pdf.display());
            }
            Ok(self.pages)
        }

        fn render_page(&self, _pdf: &Path, _index: u32, _dpi: u32) -> Result<ImageInput> {
            ImageInput::from_bytes(crate::model::testing::PNG_4X3.to_vec())
        }
    }

    pub fn stub_services(pages: u32) -> Services {
        Services {
            backend_factory: Box::new(|| Box::new(EchoBackend::default())),
            rasterizer: Box::new(StubRasterizer { pages }),
            exporter: FormulaExporter::new(Box::new(StubConverter)),
            installer: InstallerContext::with_cuda(CudaDetection::none("test")),
            deps_dir: None,
            mirror: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::stub_services;
    use super::*;
    use serde_json::json;

    #[test]
    fn tasks_are_queued_in_order() {
        let (state, rx) = DaemonState::new("tok", stub_services(1));
        let a = state.create_task(TaskKind::PredictImage, Map::new());
        let b = state.create_task(TaskKind::InstallDeps, Map::new());
        assert_eq!(rx.try_recv().unwrap(), a);
        assert_eq!(rx.try_recv().unwrap(), b);
        assert_eq!(a.len(), 32);
        assert_eq!(state.task(&b).unwrap().kind, TaskKind::InstallDeps);
    }

    #[test]
    fn cancel_and_progress_bookkeeping() {
        let (state, _rx) = DaemonState::new("", stub_services(1));
        let id = state.create_task(TaskKind::PredictPdf, json!({"pdf_path": "a.pdf"}).as_object().cloned().unwrap());
        assert!(!state.should_cancel(&id));
        let cancelled = state.request_cancel(&id).unwrap();
        assert!(cancelled.cancel_requested);
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.error_code, "TASK_CANCELLED");
        let again = state.request_cancel(&id).unwrap();
        assert_eq!(again.ended_at, cancelled.ended_at);
        assert!(state.should_cancel(&id));
        assert!(state.request_cancel("missing").is_none());

        state.set_progress(&id, 3, 5);
        state.set_progress(&id, 2, 5);
        assert_eq!(state.task(&id).unwrap().progress_current, 3);
        assert_eq!(state.task_params(&id).unwrap()["pdf_path"], "a.pdf");
    }

    #[test]
    fn status_cache_follows_the_wrapper() {
        let (state, _rx) = DaemonState::new("", stub_services(1));
        assert_eq!(state.model_status().status, "model not initialized");
        assert!(state.with_existing_wrapper(|w| w.is_ready()).is_none());
        assert!(state.with_wrapper(|w| w.warmup()).unwrap());
        assert!(state.model_status().ready);
        state.begin_stop();
        assert!(state.is_stopping());
    }
}
