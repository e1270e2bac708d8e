use std::sync::Arc;

use crate::backend_traits::TexEngine;
use crate::engine::EngineVariant;
use crate::ffi_bridge::*;
use crate::runtime::WorkbenchRuntime;
use crate::runtime_config::{self, RuntimeConfig};

/// Blocking handle for native hosts. Async work runs on the handle's own tokio runtime.
#[derive(uniffi::Object)]
pub struct WorkbenchHandle {
    runtime: Arc<WorkbenchRuntime>,
    tokio_runtime: Arc<tokio::runtime::Runtime>,
}

#[uniffi::export]
impl WorkbenchHandle {
    #[uniffi::constructor]
    pub fn new(config: RuntimeConfigFfi) -> Result<Arc<Self>, RuntimeErrorFfi> {
        let config = RuntimeConfig::try_from(config)?;
        let tokio_runtime = tokio::runtime::Runtime::new()?;

        Ok(Arc::new(Self {
            runtime: WorkbenchRuntime::new(config),
            tokio_runtime: Arc::new(tokio_runtime),
        }))
    }

    /// Configuration from `LATEX_RUNTIME_*` environment variables.
    #[uniffi::constructor]
    pub fn from_env() -> Result<Arc<Self>, RuntimeErrorFfi> {
        Self::new(RuntimeConfig::from_env()?.into())
    }

    pub fn open(&self, uri: String, content: String) -> Result<(), RuntimeErrorFfi> {
        Ok(self.runtime.open_document(uri, content)?)
    }

    pub fn update(
        &self,
        uri: String,
        start: u32,
        end: u32,
        new_text: String,
    ) -> Result<(), RuntimeErrorFfi> {
        Ok(self
            .runtime
            .update_document(&uri, start as usize..end as usize, &new_text)?)
    }

    pub fn close(&self, uri: String) -> Result<(), RuntimeErrorFfi> {
        Ok(self.runtime.close_document(&uri)?)
    }

    pub fn get_document_source(&self, uri: String) -> Option<String> {
        self.runtime.get_document_source(&uri)
    }

    pub fn get_diagnostics(&self, uri: String) -> Vec<DiagnosticFfi> {
        self.runtime.get_diagnostics(&uri).into_iter().map(Into::into).collect()
    }

    pub fn compile(&self, uri: String) -> Result<CompileResultFfi, RuntimeErrorFfi> {
        let result = self.tokio_runtime.block_on(self.runtime.compile_document(&uri))?;
        log::info!("{}: compiled (success: {})", uri, result.success);
        Ok(result.into())
    }

    pub fn source_to_output(
        &self,
        uri: String,
        line: u32,
        column: Option<u32>,
    ) -> Result<Option<OutputLocationFfi>, RuntimeErrorFfi> {
        Ok(self.runtime.source_to_output(&uri, line, column)?.map(Into::into))
    }

    pub fn output_to_source(
        &self,
        uri: String,
        page: u32,
        x: f64,
        y: f64,
    ) -> Result<Option<SourceLocationFfi>, RuntimeErrorFfi> {
        Ok(self.runtime.output_to_source(&uri, page, x, y)?.map(Into::into))
    }

    /// `uninitialized`, `ready`, `busy` or `failed`; engines without an in-process
    /// variant report `unavailable`.
    pub fn engine_state(&self, engine: String) -> Result<String, RuntimeErrorFfi> {
        Ok(match variant(&engine)? {
            Some(variant) => format!("{:?}", self.runtime.engine_state(variant)).to_lowercase(),
            None => "unavailable".to_string(),
        })
    }

    pub fn reset_engine(&self, engine: String) -> Result<(), RuntimeErrorFfi> {
        if let Some(variant) = variant(&engine)? {
            self.runtime.reset_engine(variant);
        }
        Ok(())
    }
}

fn variant(engine: &str) -> Result<Option<EngineVariant>, RuntimeErrorFfi> {
    let engine: TexEngine = runtime_config::parse_engine(engine)?;
    Ok(EngineVariant::for_engine(engine))
}
