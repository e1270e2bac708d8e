//! Lifecycle of the in-process TeX engines.
//!
//! Each [`EngineVariant`] gets at most one live instance, owned by the
//! [`EngineLifecycleManager`]. An instance runs on its own thread and is only
//! reached through [`worker::EngineCommand`] messages:
//!
//! ```text
//! Uninitialized --ensure_ready--> Ready --compile--> Busy --reply--> Ready
//!       any fault (load error, crash, timeout) --> Failed   (until reset)
//! ```

pub mod draft;
pub mod vocabulary;
pub mod worker;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;

use crate::backend_traits::{CompilationError, CompilationRequest, CompilationResult, TexEngine};
use crate::log_parser;

pub use draft::{DraftEngine, DraftEngineFactory};
pub use worker::{EngineCommand, EngineCore, EngineReply, VirtualFs};
use worker::EngineWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineVariant {
    PdfTex,
    XeTex,
}

impl EngineVariant {
    /// In-process variant able to run `engine`, if any.
    pub fn for_engine(engine: TexEngine) -> Option<Self> {
        match engine {
            TexEngine::PdfLatex => Some(Self::PdfTex),
            TexEngine::XeLatex => Some(Self::XeTex),
            TexEngine::LuaLatex => None,
        }
    }
}

impl fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PdfTex => "pdftex",
            Self::XeTex => "xetex",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Busy,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("In-process engine unavailable: {0}")]
    Unavailable(String),
    #[error("{variant} engine is not ready (state: {state:?})")]
    NotReady { variant: EngineVariant, state: EngineState },
    #[error("{0} engine is already running a job")]
    Busy(EngineVariant),
    #[error("Engine failed: {0}")]
    Failed(String),
    #[error("{0} engine stopped responding")]
    Disconnected(EngineVariant),
    #[error("Engine did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Engine rejected the job: {0}")]
    Job(String),
}

/// Builds engine cores. `load` runs on the engine's own thread.
pub trait EngineFactory: Send + Sync + fmt::Debug + 'static {
    /// Checks that the host can run the engine at all.
    fn probe(&self, _variant: EngineVariant) -> Result<(), String> {
        Ok(())
    }

    fn load(&self, variant: EngineVariant) -> Result<Box<dyn EngineCore>, String>;
}

#[derive(Debug, Default)]
struct EngineSlot {
    worker: OnceCell<EngineWorker>,
    busy: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl EngineSlot {
    fn state(&self) -> EngineState {
        if self.failure().is_some() {
            EngineState::Failed
        } else if !self.worker.initialized() {
            EngineState::Uninitialized
        } else if self.busy.load(Ordering::Acquire) {
            EngineState::Busy
        } else {
            EngineState::Ready
        }
    }

    fn failure(&self) -> Option<String> {
        match self.failure.lock() {
            Ok(failure) => failure.clone(),
            Err(_) => Some("engine slot poisoned".to_string()),
        }
    }

    fn fail(&self, reason: String) {
        log::warn!("engine marked failed: {}", reason);
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(reason);
        }
        if let Some(worker) = self.worker.get() {
            worker.terminate();
        }
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Registry of engine instances keyed by variant, created lazily.
#[derive(Debug)]
pub struct EngineLifecycleManager {
    factory: Arc<dyn EngineFactory>,
    slots: Mutex<HashMap<EngineVariant, Arc<EngineSlot>>>,
}

impl Default for EngineLifecycleManager {
    fn default() -> Self {
        Self::new(Arc::new(DraftEngineFactory))
    }
}

impl EngineLifecycleManager {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, variant: EngineVariant) -> EngineState {
        self.existing_slot(variant)
            .map_or(EngineState::Uninitialized, |slot| slot.state())
    }

    /// Loads the variant once. Concurrent callers wait on the same load.
    pub async fn ensure_ready(&self, variant: EngineVariant) -> Result<(), EngineError> {
        self.factory.probe(variant).map_err(EngineError::Unavailable)?;

        let slot = self.slot(variant)?;
        if let Some(reason) = slot.failure() {
            return Err(EngineError::Failed(reason));
        }

        let loader = Arc::clone(&slot);
        let factory = Arc::clone(&self.factory);
        slot.worker
            .get_or_try_init(|| async move {
                // a waiter that lost the race to a failed load must not retry
                if let Some(reason) = loader.failure() {
                    return Err(EngineError::Failed(reason));
                }
                log::info!("loading {} engine", variant);
                match EngineWorker::spawn(variant, factory).await {
                    Ok(worker) => {
                        log::info!("{} engine ready", variant);
                        Ok(worker)
                    }
                    Err(e) => {
                        loader.fail(e.to_string());
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(())
    }

    /// Runs one job. A second call while the first is in flight is rejected.
    pub async fn compile(
        &self,
        variant: EngineVariant,
        request: &CompilationRequest,
    ) -> Result<CompilationResult, EngineError> {
        let slot = self.existing_slot(variant).ok_or(EngineError::NotReady {
            variant,
            state: EngineState::Uninitialized,
        })?;

        if slot
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::Busy(variant));
        }
        let _busy = BusyGuard(&slot.busy);

        let state = slot.state();
        let worker = match slot.worker.get() {
            Some(worker) if slot.failure().is_none() => worker,
            _ => return Err(EngineError::NotReady { variant, state }),
        };

        log::debug!("{} engine compiling job {}", variant, request.job_id);
        match tokio::time::timeout(request.timeout, worker.run_job(request)).await {
            Err(_) => {
                slot.fail(format!("{} engine timed out after {:?}", variant, request.timeout));
                Err(EngineError::Timeout(request.timeout))
            }
            Ok(Err(e @ EngineError::Disconnected(_))) => {
                slot.fail(e.to_string());
                Err(e)
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(reply)) => Ok(into_result(reply)),
        }
    }

    /// Drops the instance; the next `ensure_ready` loads a fresh one.
    pub fn reset(&self, variant: EngineVariant) {
        let removed = match self.slots.lock() {
            Ok(mut slots) => slots.remove(&variant),
            Err(_) => None,
        };
        if let Some(slot) = removed {
            if let Some(worker) = slot.worker.get() {
                worker.terminate();
            }
            log::info!("{} engine reset", variant);
        }
    }

    fn slot(&self, variant: EngineVariant) -> Result<Arc<EngineSlot>, EngineError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| EngineError::Failed("engine registry poisoned".to_string()))?;
        Ok(Arc::clone(slots.entry(variant).or_default()))
    }

    fn existing_slot(&self, variant: EngineVariant) -> Option<Arc<EngineSlot>> {
        self.slots.lock().ok()?.get(&variant).cloned()
    }
}

fn into_result(reply: EngineReply) -> CompilationResult {
    let parsed = log_parser::parse_log(&reply.log);
    let log = reply.log.lines().map(str::to_string).collect();

    match reply.pdf {
        Some(pdf) if reply.status == 0 => CompilationResult::succeeded(pdf, log, parsed.warnings),
        _ => {
            let mut errors = parsed.errors;
            if errors.is_empty() {
                let message = format!("engine exited with status {}", reply.status);
                errors.push(CompilationError::new(message));
            }
            CompilationResult::failed(log, errors, parsed.warnings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct SlowFactory {
        loads: Arc<AtomicUsize>,
        job_time: Duration,
        probe_error: Option<String>,
        load_error: Option<String>,
    }

    impl SlowFactory {
        fn new(job_time: Duration) -> Self {
            Self {
                loads: Arc::new(AtomicUsize::new(0)),
                job_time,
                probe_error: None,
                load_error: None,
            }
        }
    }

    struct SleepyCore(Duration);

    impl EngineCore for SleepyCore {
        fn compile(&mut self, fs: &VirtualFs, main_file: &str) -> EngineReply {
            std::thread::sleep(self.0);
            EngineReply {
                status: 0,
                log: format!("compiled {} ({} files)", main_file, fs.file_count()),
                pdf: Some(b"%PDF".to_vec()),
            }
        }
    }

    impl EngineFactory for SlowFactory {
        fn probe(&self, _variant: EngineVariant) -> Result<(), String> {
            self.probe_error.clone().map_or(Ok(()), Err)
        }

        fn load(&self, _variant: EngineVariant) -> Result<Box<dyn EngineCore>, String> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            match &self.load_error {
                Some(e) => Err(e.clone()),
                None => Ok(Box::new(SleepyCore(self.job_time))),
            }
        }
    }

    fn request() -> CompilationRequest {
        CompilationRequest::single("\\documentclass{article}").with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn concurrent_ensure_ready_shares_one_load() {
        let factory = SlowFactory::new(Duration::ZERO);
        let loads = Arc::clone(&factory.loads);
        let manager = EngineLifecycleManager::new(Arc::new(factory));

        let (a, b) = tokio::join!(
            manager.ensure_ready(EngineVariant::PdfTex),
            manager.ensure_ready(EngineVariant::PdfTex)
        );
        a.unwrap();
        b.unwrap();
        manager.ensure_ready(EngineVariant::PdfTex).await.unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(EngineVariant::PdfTex), EngineState::Ready);
        assert_eq!(manager.state(EngineVariant::XeTex), EngineState::Uninitialized);
    }

    #[tokio::test]
    async fn compile_before_load_is_not_ready() {
        let manager = EngineLifecycleManager::new(Arc::new(SlowFactory::new(Duration::ZERO)));
        let err = manager.compile(EngineVariant::PdfTex, &request()).await.unwrap_err();
        assert_eq!(err, EngineError::NotReady {
            variant: EngineVariant::PdfTex,
            state: EngineState::Uninitialized,
        });
    }

    #[tokio::test]
    async fn second_concurrent_compile_is_rejected() {
        let factory = SlowFactory::new(Duration::from_millis(100));
        let manager = EngineLifecycleManager::new(Arc::new(factory));
        manager.ensure_ready(EngineVariant::PdfTex).await.unwrap();

        let request = request();
        let (first, second) = tokio::join!(
            manager.compile(EngineVariant::PdfTex, &request),
            manager.compile(EngineVariant::PdfTex, &request)
        );

        let first = first.unwrap();
        assert!(first.success);
        assert_eq!(first.log, vec!["compiled main.tex (1 files)".to_string()]);
        assert_eq!(second.unwrap_err(), EngineError::Busy(EngineVariant::PdfTex));

        assert_eq!(manager.state(EngineVariant::PdfTex), EngineState::Ready);
        assert!(manager.compile(EngineVariant::PdfTex, &request).await.unwrap().success);
    }

    #[tokio::test]
    async fn timeout_fails_the_instance_until_reset() {
        let factory = SlowFactory::new(Duration::from_millis(400));
        let loads = Arc::clone(&factory.loads);
        let manager = EngineLifecycleManager::new(Arc::new(factory));
        manager.ensure_ready(EngineVariant::XeTex).await.unwrap();

        let request = request().with_timeout(Duration::from_millis(50));
        let err = manager.compile(EngineVariant::XeTex, &request).await.unwrap_err();
        assert_eq!(err, EngineError::Timeout(Duration::from_millis(50)));
        assert_eq!(manager.state(EngineVariant::XeTex), EngineState::Failed);
        assert!(matches!(
            manager.ensure_ready(EngineVariant::XeTex).await,
            Err(EngineError::Failed(_))
        ));

        manager.reset(EngineVariant::XeTex);
        assert_eq!(manager.state(EngineVariant::XeTex), EngineState::Uninitialized);
        manager.ensure_ready(EngineVariant::XeTex).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_host_capability_is_unavailable() {
        let mut factory = SlowFactory::new(Duration::ZERO);
        factory.probe_error = Some("no worker threads".to_string());
        let manager = EngineLifecycleManager::new(Arc::new(factory));

        let err = manager.ensure_ready(EngineVariant::PdfTex).await.unwrap_err();
        assert_eq!(err, EngineError::Unavailable("no worker threads".to_string()));
        assert_eq!(manager.state(EngineVariant::PdfTex), EngineState::Uninitialized);
    }

    #[tokio::test]
    async fn load_failure_is_terminal() {
        let mut factory = SlowFactory::new(Duration::ZERO);
        factory.load_error = Some("missing format file".to_string());
        let loads = Arc::clone(&factory.loads);
        let manager = EngineLifecycleManager::new(Arc::new(factory));

        assert!(manager.ensure_ready(EngineVariant::PdfTex).await.is_err());
        assert_eq!(manager.state(EngineVariant::PdfTex), EngineState::Failed);
        assert!(manager.ensure_ready(EngineVariant::PdfTex).await.is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_main_file_is_a_document_error() {
        use crate::backend_traits::{FileKind, ProjectFile};

        let manager = EngineLifecycleManager::new(Arc::new(SlowFactory::new(Duration::ZERO)));
        manager.ensure_ready(EngineVariant::PdfTex).await.unwrap();

        let request = CompilationRequest::project(
            vec![ProjectFile::new("chapter.tex", "text", FileKind::Tex)],
            "main.tex",
        );
        let result = manager.compile(EngineVariant::PdfTex, &request).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.errors[0].message, "LaTeX Error: File `main.tex' not found.");
        assert!(!crate::router::is_system_error(&result));
        assert_eq!(manager.state(EngineVariant::PdfTex), EngineState::Ready);
    }

    #[test]
    fn failed_reply_without_diagnostics_gets_a_generic_error() {
        let result = into_result(EngineReply {
            status: 3,
            log: "something odd".to_string(),
            pdf: Some(b"%PDF".to_vec()),
        });
        assert!(!result.success);
        assert!(result.output().is_none());
        assert_eq!(result.errors[0].message, "engine exited with status 3");
    }
}
