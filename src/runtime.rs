use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::{Arc, RwLock};

use crate::backend_traits::{CompilationRequest, CompilationResult, DEFAULT_MAIN_FILE};
use crate::diagnostic::{self, Diagnostic};
use crate::engine::{EngineLifecycleManager, EngineState, EngineVariant};
use crate::pdf;
use crate::position_map::{OutputLocation, PositionMap, PositionMapBuilder, SourceLocation};
use crate::router::CompilerRouter;
use crate::runtime_config::{ConfigError, RuntimeConfig};
use crate::sync::SyncNavigator;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Lock poisoned")]
    LockPoisoned,
    #[error("Document not found: {0}")]
    DocumentNotFound(String),
    #[error("Edit range {start}..{end} is outside {uri}")]
    InvalidEdit { uri: String, start: usize, end: usize },
    #[error("No position map for {0}; compile it first")]
    NoPositionMap(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug)]
struct CachedMap {
    source_hash: u64,
    total_pages: u32,
    map: Arc<PositionMap>,
}

#[derive(Debug)]
pub struct Document {
    source: String,
    position_map: Option<CachedMap>,
}

impl Document {
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Open documents, their diagnostics and position maps, and the router that compiles them.
#[derive(Debug)]
pub struct WorkbenchRuntime {
    config: RuntimeConfig,
    router: CompilerRouter,
    engines: Arc<EngineLifecycleManager>,
    builder: PositionMapBuilder,
    documents: RwLock<HashMap<String, Document>>,
    diagnostics: RwLock<HashMap<String, Vec<Diagnostic>>>,
}

impl WorkbenchRuntime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let engines = Arc::new(EngineLifecycleManager::default());
        let router = CompilerRouter::from_config(&config, Arc::clone(&engines));
        Self::new_with_router(config, router, engines)
    }

    pub fn new_with_router(
        config: RuntimeConfig,
        router: CompilerRouter,
        engines: Arc<EngineLifecycleManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            builder: PositionMapBuilder::new(config.page_geometry),
            config,
            router,
            engines,
            documents: RwLock::new(HashMap::new()),
            diagnostics: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn router(&self) -> &CompilerRouter {
        &self.router
    }

    pub fn with_document<F, R>(&self, uri: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Document) -> R,
    {
        let docs = self.documents.read().ok()?;
        docs.get(uri).map(f)
    }

    pub fn open_document(&self, uri: String, content: String) -> Result<(), RuntimeError> {
        let document = Document {
            source: content,
            position_map: None,
        };

        self.documents
            .write()
            .map_err(|_| RuntimeError::LockPoisoned)?
            .insert(uri.clone(), document);
        self.diagnostics
            .write()
            .map_err(|_| RuntimeError::LockPoisoned)?
            .remove(&uri);

        log::debug!("opened {}", uri);
        Ok(())
    }

    /// Replaces `edit_range` (byte offsets) with `new_text`.
    pub fn update_document(
        &self,
        uri: &str,
        edit_range: Range<usize>,
        new_text: &str,
    ) -> Result<(), RuntimeError> {
        let mut documents = self.documents.write().map_err(|_| RuntimeError::LockPoisoned)?;
        let document = documents
            .get_mut(uri)
            .ok_or_else(|| RuntimeError::DocumentNotFound(uri.to_string()))?;

        let valid = edit_range.start <= edit_range.end
            && edit_range.end <= document.source.len()
            && document.source.is_char_boundary(edit_range.start)
            && document.source.is_char_boundary(edit_range.end);
        if !valid {
            return Err(RuntimeError::InvalidEdit {
                uri: uri.to_string(),
                start: edit_range.start,
                end: edit_range.end,
            });
        }

        document.source.replace_range(edit_range, new_text);
        Ok(())
    }

    pub fn close_document(&self, uri: &str) -> Result<(), RuntimeError> {
        self.documents.write().map_err(|_| RuntimeError::LockPoisoned)?.remove(uri);
        self.diagnostics.write().map_err(|_| RuntimeError::LockPoisoned)?.remove(uri);
        Ok(())
    }

    pub fn get_document_source(&self, uri: &str) -> Option<String> {
        self.with_document(uri, |doc| doc.source.clone())
    }

    pub fn get_diagnostics(&self, uri: &str) -> Vec<Diagnostic> {
        self.diagnostics
            .read()
            .ok()
            .and_then(|diags| diags.get(uri).cloned())
            .unwrap_or_default()
    }

    /// Routes any request, without touching document state.
    pub async fn compile(&self, request: &CompilationRequest) -> CompilationResult {
        self.router.route_compile(request).await
    }

    pub async fn compile_document(&self, uri: &str) -> Result<CompilationResult, RuntimeError> {
        let content = self
            .get_document_source(uri)
            .ok_or_else(|| RuntimeError::DocumentNotFound(uri.to_string()))?;

        let request = CompilationRequest::single(content.clone())
            .with_engine(self.config.engine)
            .with_timeout(self.config.timeout());
        log::info!("compiling {} as {}", uri, request.job_id);

        let result = self.router.route_compile(&request).await;

        let diagnostics = diagnostic::from_result(&content, request.main_file(), &result);
        self.diagnostics
            .write()
            .map_err(|_| RuntimeError::LockPoisoned)?
            .insert(uri.to_string(), diagnostics);

        if let Some(output) = result.output() {
            let total_pages = pdf::page_count(output);
            self.refresh_position_map(uri, &content, total_pages, result.synctex.as_deref())?;
        }

        Ok(result)
    }

    /// Rebuilds the cached map only when the source or page count moved.
    fn refresh_position_map(
        &self,
        uri: &str,
        content: &str,
        total_pages: u32,
        synctex: Option<&str>,
    ) -> Result<(), RuntimeError> {
        let source_hash = hash_source(content);
        let mut documents = self.documents.write().map_err(|_| RuntimeError::LockPoisoned)?;
        let Some(document) = documents.get_mut(uri) else {
            return Ok(());
        };

        let fresh = document
            .position_map
            .as_ref()
            .is_some_and(|c| {
                c.source_hash == source_hash && c.total_pages == total_pages && synctex.is_none()
            });
        if fresh {
            return Ok(());
        }

        let map = self.builder.build(DEFAULT_MAIN_FILE, content, total_pages, synctex);
        log::debug!(
            "{}: position map rebuilt ({} entries, heuristic: {})",
            uri,
            map.entries().len(),
            map.is_heuristic()
        );
        document.position_map = Some(CachedMap {
            source_hash,
            total_pages,
            map: Arc::new(map),
        });
        Ok(())
    }

    /// The document's map, re-estimated if the text changed since the last compile.
    pub fn position_map(&self, uri: &str) -> Result<Arc<PositionMap>, RuntimeError> {
        let mut documents = self.documents.write().map_err(|_| RuntimeError::LockPoisoned)?;
        let document = documents
            .get_mut(uri)
            .ok_or_else(|| RuntimeError::DocumentNotFound(uri.to_string()))?;
        let source_hash = hash_source(&document.source);

        let cached = document
            .position_map
            .as_mut()
            .ok_or_else(|| RuntimeError::NoPositionMap(uri.to_string()))?;
        if cached.source_hash != source_hash {
            let map =
                self.builder.build(DEFAULT_MAIN_FILE, &document.source, cached.total_pages, None);
            cached.map = Arc::new(map);
            cached.source_hash = source_hash;
        }
        Ok(Arc::clone(&cached.map))
    }

    pub fn source_to_output(
        &self,
        uri: &str,
        line: u32,
        column: Option<u32>,
    ) -> Result<Option<OutputLocation>, RuntimeError> {
        let map = self.position_map(uri)?;
        Ok(SyncNavigator::new(&map).source_to_output(DEFAULT_MAIN_FILE, line, column))
    }

    pub fn output_to_source(
        &self,
        uri: &str,
        page: u32,
        x: f64,
        y: f64,
    ) -> Result<Option<SourceLocation>, RuntimeError> {
        let map = self.position_map(uri)?;
        Ok(SyncNavigator::new(&map).output_to_source(page, x, y))
    }

    pub fn engine_state(&self, variant: EngineVariant) -> EngineState {
        self.engines.state(variant)
    }

    pub fn reset_engine(&self, variant: EngineVariant) {
        self.engines.reset(variant);
    }
}

fn hash_source(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}
