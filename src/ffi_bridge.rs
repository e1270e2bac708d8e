use crate::backend_traits::{CompilationError, CompilationResult};
use crate::diagnostic::Diagnostic;
use crate::position_map::{OutputLocation, SourceLocation};
use crate::runtime::RuntimeError;
use crate::runtime_config::{
    self, ConfigError, ContainerConfig, HostedApiConfig, RemoteConfig, RuntimeConfig,
};

#[derive(uniffi::Record, Debug, Clone)]
pub struct RuntimeConfigFfi {
    pub engine: String,
    pub timeout_ms: u64,
    pub in_process: bool,
    pub container_runtime: Option<String>,
    pub container_image: Option<String>,
    pub remote_url: Option<String>,
    pub remote_auth_token: Option<String>,
    pub hosted_api: bool,
    pub hosted_api_url: Option<String>,
    pub hosted_api_key: Option<String>,
}

impl Default for RuntimeConfigFfi {
    fn default() -> Self {
        RuntimeConfig::default().into()
    }
}

#[derive(uniffi::Record, Debug, Clone, PartialEq)]
pub struct CompilationErrorFfi {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub file: Option<String>,
}

#[derive(uniffi::Record, Debug, Clone)]
pub struct CompileResultFfi {
    pub success: bool,
    pub pdf: Option<Vec<u8>>,
    pub log: Vec<String>,
    pub errors: Vec<CompilationErrorFfi>,
    pub warnings: Vec<String>,
    pub backend: Option<String>,
    pub attempted: Vec<String>,
}

#[derive(uniffi::Record, Debug, Clone, PartialEq)]
pub struct DiagnosticFfi {
    pub start: u32,
    pub end: u32,
    pub line: Option<u32>,
    pub severity: String,
    pub message: String,
}

#[derive(uniffi::Record, Debug, Clone, PartialEq)]
pub struct SourceLocationFfi {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

#[derive(uniffi::Record, Debug, Clone, PartialEq)]
pub struct OutputLocationFfi {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(uniffi::Error, thiserror::Error, Debug, Clone, PartialEq)]
pub enum RuntimeErrorFfi {
    #[error("Document not found: {uri}")]
    DocumentNotFound { uri: String },
    #[error("Lock poisoned")]
    LockPoisoned,
    #[error("Invalid edit: {details}")]
    InvalidEdit { details: String },
    #[error("No position map for {uri}")]
    NoPositionMap { uri: String },
    #[error("Configuration error: {details}")]
    Config { details: String },
    #[error("Runtime setup failed: {details}")]
    Setup { details: String },
}

impl From<RuntimeError> for RuntimeErrorFfi {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::DocumentNotFound(uri) => Self::DocumentNotFound { uri },
            RuntimeError::LockPoisoned => Self::LockPoisoned,
            e @ RuntimeError::InvalidEdit { .. } => Self::InvalidEdit { details: e.to_string() },
            RuntimeError::NoPositionMap(uri) => Self::NoPositionMap { uri },
            RuntimeError::Config(e) => e.into(),
        }
    }
}

impl From<ConfigError> for RuntimeErrorFfi {
    fn from(err: ConfigError) -> Self {
        Self::Config { details: err.to_string() }
    }
}

impl From<std::io::Error> for RuntimeErrorFfi {
    fn from(err: std::io::Error) -> Self {
        Self::Setup {
            details: format!("IO Error: {}", err),
        }
    }
}

impl From<RuntimeConfig> for RuntimeConfigFfi {
    fn from(config: RuntimeConfig) -> Self {
        let (container_runtime, container_image) = config
            .container
            .map_or((None, None), |c| (c.runtime, c.image));
        let (remote_url, remote_auth_token) = config
            .remote
            .map_or((None, None), |r| (Some(r.url), r.auth_token));

        Self {
            engine: config.engine.to_string(),
            timeout_ms: config.timeout_ms,
            in_process: config.in_process,
            container_runtime,
            container_image,
            remote_url,
            remote_auth_token,
            hosted_api: config.hosted_api.is_some(),
            hosted_api_url: config.hosted_api.as_ref().and_then(|h| h.url.clone()),
            hosted_api_key: config.hosted_api.and_then(|h| h.api_key),
        }
    }
}

impl TryFrom<RuntimeConfigFfi> for RuntimeConfig {
    type Error = ConfigError;

    fn try_from(config: RuntimeConfigFfi) -> Result<Self, Self::Error> {
        let wants_container =
            config.container_runtime.is_some() || config.container_image.is_some();
        let container = wants_container.then(|| ContainerConfig {
            runtime: config.container_runtime,
            image: config.container_image,
        });

        let parsed = RuntimeConfig {
            engine: runtime_config::parse_engine(&config.engine)?,
            timeout_ms: config.timeout_ms,
            in_process: config.in_process,
            container,
            remote: config.remote_url.map(|url| RemoteConfig {
                url,
                auth_token: config.remote_auth_token,
            }),
            hosted_api: config.hosted_api.then(|| HostedApiConfig {
                url: config.hosted_api_url,
                api_key: config.hosted_api_key,
            }),
            ..RuntimeConfig::default()
        };

        parsed.validate()
    }
}

impl From<CompilationError> for CompilationErrorFfi {
    fn from(e: CompilationError) -> Self {
        Self {
            message: e.message,
            line: e.line,
            column: e.column,
            file: e.file,
        }
    }
}

impl From<CompilationResult> for CompileResultFfi {
    fn from(result: CompilationResult) -> Self {
        Self {
            success: result.success,
            backend: result.backend.map(|b| b.to_string()),
            attempted: result.attempted.iter().map(|b| b.to_string()).collect(),
            errors: result.errors.iter().cloned().map(Into::into).collect(),
            warnings: result.warnings.clone(),
            log: result.log.clone(),
            pdf: result.into_output(),
        }
    }
}

impl From<Diagnostic> for DiagnosticFfi {
    fn from(d: Diagnostic) -> Self {
        DiagnosticFfi {
            start: d.range.start as u32,
            end: d.range.end as u32,
            line: d.line,
            severity: d.severity.to_string(),
            message: d.message,
        }
    }
}

impl From<SourceLocation> for SourceLocationFfi {
    fn from(location: SourceLocation) -> Self {
        Self {
            file: location.file.to_string(),
            line: location.line,
            column: location.column,
        }
    }
}

impl From<OutputLocation> for OutputLocationFfi {
    fn from(location: OutputLocation) -> Self {
        Self {
            page: location.page,
            x: location.x,
            y: location.y,
            width: location.width,
            height: location.height,
        }
    }
}
