//! Backend selection and the fallback policy.
//!
//! Backends are tried in priority order. A failed result only moves the
//! router to the next backend when the failure is a *system* error; document
//! errors are returned to the caller untouched.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::backend_traits::{
    BackendKind, CompilationBackend, CompilationError, CompilationRequest, CompilationResult,
    OutputFormat, TexEngine,
};
use crate::backends::{ContainerBackend, InProcessBackend};
#[cfg(feature = "http-compilation")]
use crate::backends::{HostedApiBackend, RemoteServerBackend};
use crate::engine::{EngineLifecycleManager, vocabulary};
use crate::parser::{self, Command};
use crate::runtime_config::RuntimeConfig;

const GRAPHICS_PACKAGES: &[&str] = &["tikz", "pgfplots", "pstricks", "asymptote", "minted", "svg"];

static DOCUMENT_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)undefined control sequence|missing .+ inserted|latex error|emergency stop",
        r"|runaway argument|file `[^']+' not found|extra alignment tab|paragraph ended before",
        r"|too many \}|extra \}",
        r"|misplaced alignment|not in outer par mode|there's no line here to end",
        r"|environment \S+ undefined|missing \\begin\{document\}",
    ))
    .expect("document error pattern")
});

static SYSTEM_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)network|timed? ?out|unavailable|connection (?:refused|reset|closed)|not configured",
        r"|unsupported|rate limit|too many requests|dns|no such host|container runtime",
        r"|stopped responding|engine failed",
    ))
    .expect("system error pattern")
});

/// Why a document cannot go to the in-process engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingFeature {
    pub reason: String,
    pub line: Option<u32>,
}

impl BlockingFeature {
    fn new(reason: impl Into<String>, line: Option<u32>) -> Self {
        Self { reason: reason.into(), line }
    }
}

/// Features the in-process engine cannot handle, in source order.
pub fn blocking_features(request: &CompilationRequest) -> Vec<BlockingFeature> {
    let mut features = Vec::new();

    if request.engine == TexEngine::LuaLatex {
        features.push(BlockingFeature::new("lualatex has no in-process engine", None));
    }
    if request.format != OutputFormat::Pdf {
        features.push(BlockingFeature::new("in-process engine only writes PDF", None));
    }

    for file in request.files() {
        if !file.kind.is_tex_source() {
            let reason = format!("project file {} needs a full backend", file.path);
            features.push(BlockingFeature::new(reason, None));
            continue;
        }
        for command in parser::commands(&file.content) {
            if let Some(reason) = command_blocks(&command) {
                features.push(BlockingFeature::new(reason, Some(command.line)));
            }
        }
    }

    features
}

fn command_blocks(command: &Command<'_>) -> Option<String> {
    match command.name {
        "includegraphics" | "includepdf" => {
            Some(format!("\\{} loads external graphics", command.name))
        }
        "bibliography" | "addbibresource" | "printbibliography" => {
            Some(format!("\\{} needs a bibliography database", command.name))
        }
        "include" | "input" => Some(format!("\\{} reads external files", command.name)),
        "usepackage" | "RequirePackage" => {
            let packages: Vec<&str> = command.argument_list().collect();
            let graphics = packages.iter().find(|package| GRAPHICS_PACKAGES.contains(package));
            if let Some(package) = graphics {
                return Some(format!("package {} needs a full TeX distribution", package));
            }
            packages
                .into_iter()
                .find(|package| !vocabulary::is_bundled_package(package))
                .map(|package| {
                    format!("package {} is not bundled with the in-process engine", package)
                })
        }
        "documentclass" => command
            .argument
            .map(str::trim)
            .filter(|class| !vocabulary::is_bundled_class(class))
            .map(|class| {
                format!("document class {} is not bundled with the in-process engine", class)
            }),
        "begin" if command.is_environment(&["tikzpicture"]) => {
            Some("tikzpicture environment".to_string())
        }
        _ => None,
    }
}

/// True when a failed result was caused by the backend rather than the document.
pub fn is_system_error(result: &CompilationResult) -> bool {
    if result.success || result.errors.iter().any(CompilationError::is_line_anchored) {
        return false;
    }

    let messages = || {
        result
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .chain(result.log.iter().map(String::as_str))
    };
    if messages().any(|m| DOCUMENT_PATTERNS.is_match(m)) {
        return false;
    }
    messages().any(|m| SYSTEM_PATTERNS.is_match(m))
}

#[derive(Debug)]
pub struct CompilerRouter {
    backends: Vec<Arc<dyn CompilationBackend>>,
    /// Configuration problems reported with every routed job.
    notes: Vec<String>,
}

impl CompilerRouter {
    pub fn new(mut backends: Vec<Arc<dyn CompilationBackend>>) -> Self {
        backends.sort_by_key(|b| b.kind());
        Self { backends, notes: Vec::new() }
    }

    pub fn from_config(config: &RuntimeConfig, engines: Arc<EngineLifecycleManager>) -> Self {
        let mut backends: Vec<Arc<dyn CompilationBackend>> = Vec::new();
        let mut notes = Vec::new();

        if config.in_process {
            backends.push(Arc::new(InProcessBackend::new(engines)));
        } else {
            notes.push("in-process engine disabled by configuration".to_string());
        }

        match &config.container {
            Some(container) => backends.push(Arc::new(ContainerBackend::new(
                container.runtime.as_ref().map(PathBuf::from),
                container.image.clone(),
            ))),
            None => notes.push("container backend not configured".to_string()),
        }

        #[cfg(feature = "http-compilation")]
        {
            match config.remote.as_ref().filter(|r| !r.url.trim().is_empty()) {
                Some(remote) => backends.push(Arc::new(RemoteServerBackend::new(
                    remote.url.clone(),
                    remote.auth_token.clone(),
                ))),
                None => notes.push("no remote server URL configured".to_string()),
            }
            match &config.hosted_api {
                Some(hosted) => backends.push(Arc::new(HostedApiBackend::new(
                    hosted.url.clone(),
                    hosted.api_key.clone(),
                ))),
                None => notes.push("hosted API disabled by configuration".to_string()),
            }
        }
        #[cfg(not(feature = "http-compilation"))]
        notes.push("network backends need the http-compilation feature".to_string());

        let mut router = Self::new(backends);
        router.notes = notes;
        router
    }

    pub fn backends(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.backends.iter().map(|b| b.kind())
    }

    /// Compiles with the first backend that does not fail for system reasons.
    pub async fn route_compile(&self, request: &CompilationRequest) -> CompilationResult {
        let mut audit: Vec<String> = self.notes.iter().map(|n| format!("[router] {}", n)).collect();
        let plan = self.plan(request, &mut audit);

        if plan.is_empty() {
            let message = "no compilation backend available for this request".to_string();
            log::error!("job {}: {}", request.job_id, message);
            audit.push(format!("[router] {}", message));
            let errors = vec![CompilationError::new(message)];
            let result = CompilationResult::failed(Vec::new(), errors, Vec::new());
            return finish(result, audit, Vec::new());
        }

        let mut attempted: Vec<BackendKind> = Vec::new();
        let mut last_failure: Option<CompilationResult> = None;

        for backend in plan {
            let kind = backend.kind();
            if let Some(previous) = attempted.last() {
                log::info!("job {}: falling back from {} to {}", request.job_id, previous, kind);
                audit.push(format!("[router] falling back from {} to {}", previous, kind));
            }
            audit.push(format!("[router] compiling with {} backend", kind));
            attempted.push(kind);

            match backend.compile(request).await {
                Ok(result) if result.success => {
                    log::debug!("job {}: {} succeeded", request.job_id, kind);
                    return finish(result.with_backend(kind), audit, attempted);
                }
                Ok(result) if !is_system_error(&result) => {
                    log::debug!("job {}: document error from {}", request.job_id, kind);
                    audit.push(format!(
                        "[router] {} reported document errors; not falling back",
                        kind
                    ));
                    return finish(result.with_backend(kind), audit, attempted);
                }
                Ok(result) => {
                    let summary =
                        result.errors.first().map_or("no details", |e| e.message.as_str());
                    log::warn!(
                        "job {}: {} failed with a system error: {}",
                        request.job_id,
                        kind,
                        summary
                    );
                    audit.push(format!(
                        "[router] {} failed with a system error: {}",
                        kind, summary
                    ));
                    last_failure = Some(result.with_backend(kind));
                }
                Err(e) => {
                    log::warn!("job {}: {} backend error: {}", request.job_id, kind, e);
                    audit.push(format!("[router] {} backend error: {}", kind, e));
                    last_failure = Some(CompilationResult::system_failure(kind, &e));
                }
            }
        }

        let tried = attempted.iter().map(BackendKind::as_str).collect::<Vec<_>>().join(", ");
        let note = format!("all backends failed; attempted: {}", tried);
        log::error!("job {}: {}", request.job_id, note);
        audit.push(format!("[router] {}", note));

        let mut result = last_failure
            .unwrap_or_else(|| CompilationResult::failed(Vec::new(), Vec::new(), Vec::new()));
        result.errors.push(CompilationError::new(note));
        finish(result, audit, attempted)
    }

    fn plan(
        &self,
        request: &CompilationRequest,
        audit: &mut Vec<String>,
    ) -> Vec<&Arc<dyn CompilationBackend>> {
        if let Some(requested) = request.backend {
            audit.push(format!("[router] caller requested the {} backend", requested));
            let mut plan: Vec<_> = self.backends.iter().filter(|b| b.kind() == requested).collect();
            if plan.is_empty() {
                audit.push(format!("[router] {} backend is not configured", requested));
            }
            plan.extend(
                self.backends
                    .iter()
                    .filter(|b| b.kind() != requested && b.kind().is_full_capability()),
            );
            return plan;
        }

        let blocking = blocking_features(request);
        if blocking.is_empty() {
            return self.backends.iter().collect();
        }

        if self.backends.iter().any(|b| !b.kind().is_full_capability()) {
            for feature in &blocking {
                let at = feature.line.map(|l| format!(" (line {})", l)).unwrap_or_default();
                audit.push(format!(
                    "[router] skipping in-process engine: {}{}",
                    feature.reason, at
                ));
            }
        }
        self.backends.iter().filter(|b| b.kind().is_full_capability()).collect()
    }
}

fn finish(
    mut result: CompilationResult,
    mut audit: Vec<String>,
    attempted: Vec<BackendKind>,
) -> CompilationResult {
    audit.append(&mut result.log);
    result.log = audit;
    result.attempted = attempted;
    result
}
