use std::sync::Arc;

use async_trait::async_trait;

use crate::backend_traits::{
    BackendError, BackendKind, CompilationBackend, CompilationRequest, CompilationResult,
    OutputFormat,
};
use crate::engine::{EngineLifecycleManager, EngineVariant};

/// Compiles through the engine instances owned by the lifecycle manager.
#[derive(Debug, Clone)]
pub struct InProcessBackend {
    engines: Arc<EngineLifecycleManager>,
}

impl InProcessBackend {
    pub fn new(engines: Arc<EngineLifecycleManager>) -> Self {
        Self { engines }
    }

    pub fn engines(&self) -> &Arc<EngineLifecycleManager> {
        &self.engines
    }
}

#[async_trait]
impl CompilationBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn compile(
        &self,
        request: &CompilationRequest,
    ) -> Result<CompilationResult, BackendError> {
        let variant = EngineVariant::for_engine(request.engine).ok_or_else(|| {
            BackendError::Unsupported(format!("{} has no in-process engine", request.engine))
        })?;
        if request.format != OutputFormat::Pdf {
            return Err(BackendError::Unsupported("in-process engine only writes PDF".to_string()));
        }

        self.engines.ensure_ready(variant).await?;
        let result = self.engines.compile(variant, request).await?;
        Ok(result.with_backend(BackendKind::InProcess))
    }
}
