use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAIN_FILE: &str = "main.tex";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TexEngine {
    #[default]
    PdfLatex,
    XeLatex,
    LuaLatex,
}

impl TexEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PdfLatex => "pdflatex",
            Self::XeLatex => "xelatex",
            Self::LuaLatex => "lualatex",
        }
    }
}

impl fmt::Display for TexEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pdf,
    Dvi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Tex,
    Bib,
    Cls,
    Sty,
    Image,
    Other,
}

impl FileKind {
    /// Files the TeX engine reads as text.
    pub fn is_tex_source(&self) -> bool {
        matches!(self, Self::Tex | Self::Cls | Self::Sty)
    }
}

/// One file of a multi-file project. Image content is base64 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub path: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

impl ProjectFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>, kind: FileKind) -> Self {
        Self { path: path.into(), content: content.into(), kind }
    }

    /// Bytes as they should land on disk.
    pub fn bytes(&self) -> Result<Vec<u8>, BackendError> {
        match self.kind {
            FileKind::Image => STANDARD
                .decode(self.content.trim())
                .map_err(|e| {
                    BackendError::Protocol(format!("{}: invalid base64 image: {}", self.path, e))
                }),
            _ => Ok(self.content.clone().into_bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentSource {
    Single(String),
    Project { files: Vec<ProjectFile>, main_file: String },
}

/// Declaration order is routing priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    InProcess,
    Container,
    RemoteServer,
    HostedApi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::Container => "container",
            Self::RemoteServer => "remote-server",
            Self::HostedApi => "hosted-api",
        }
    }

    pub fn is_full_capability(&self) -> bool {
        !matches!(self, Self::InProcess)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompilationRequest {
    pub job_id: String,
    pub source: DocumentSource,
    pub engine: TexEngine,
    pub format: OutputFormat,
    pub timeout: Duration,
    /// Caller-pinned backend; skips the in-process engine.
    pub backend: Option<BackendKind>,
}

impl CompilationRequest {
    pub fn single(content: impl Into<String>) -> Self {
        Self::with_source(DocumentSource::Single(content.into()))
    }

    pub fn project(files: Vec<ProjectFile>, main_file: impl Into<String>) -> Self {
        Self::with_source(DocumentSource::Project {
            files,
            main_file: main_file.into(),
        })
    }

    fn with_source(source: DocumentSource) -> Self {
        Self {
            job_id: format!("job_{}", uuid::Uuid::new_v4().simple()),
            source,
            engine: TexEngine::default(),
            format: OutputFormat::default(),
            timeout: DEFAULT_TIMEOUT,
            backend: None,
        }
    }

    pub fn with_engine(mut self, engine: TexEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn main_file(&self) -> &str {
        match &self.source {
            DocumentSource::Single(_) => DEFAULT_MAIN_FILE,
            DocumentSource::Project { main_file, .. } => main_file,
        }
    }

    /// Text of the main file, empty when a project names a missing main file.
    pub fn main_source(&self) -> &str {
        match &self.source {
            DocumentSource::Single(content) => content,
            DocumentSource::Project { files, main_file } => files
                .iter()
                .find(|f| &f.path == main_file)
                .map(|f| f.content.as_str())
                .unwrap_or(""),
        }
    }

    /// Every file of the job; single-file mode yields one `main.tex`.
    pub fn files(&self) -> Vec<ProjectFile> {
        match &self.source {
            DocumentSource::Single(content) => {
                vec![ProjectFile::new(DEFAULT_MAIN_FILE, content.clone(), FileKind::Tex)]
            }
            DocumentSource::Project { files, .. } => files.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl CompilationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
            file: None,
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn is_line_anchored(&self) -> bool {
        self.line.is_some_and(|l| l > 0)
    }
}

/// Outcome of one compile job. A failed result never carries output bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilationResult {
    pub success: bool,
    output: Option<Vec<u8>>,
    pub log: Vec<String>,
    pub errors: Vec<CompilationError>,
    pub warnings: Vec<String>,
    /// Uncompressed SyncTeX text, when the backend produced it.
    pub synctex: Option<String>,
    /// Backend that produced this result.
    pub backend: Option<BackendKind>,
    /// Backends tried, in order, while routing this request.
    pub attempted: Vec<BackendKind>,
}

impl CompilationResult {
    pub fn succeeded(output: Vec<u8>, log: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            output: Some(output),
            log,
            errors: Vec::new(),
            warnings,
            synctex: None,
            backend: None,
            attempted: Vec::new(),
        }
    }

    pub fn failed(log: Vec<String>, errors: Vec<CompilationError>, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            output: None,
            log,
            errors,
            warnings,
            synctex: None,
            backend: None,
            attempted: Vec::new(),
        }
    }

    /// Failure caused by the backend itself rather than the document.
    pub fn system_failure(backend: BackendKind, error: &BackendError) -> Self {
        let message = format!("{} backend failed: {}", backend, error);
        let errors = vec![CompilationError::new(message.clone())];
        let mut result = Self::failed(vec![message], errors, Vec::new());
        result.backend = Some(backend);
        result
    }

    pub fn with_synctex(mut self, synctex: Option<String>) -> Self {
        self.synctex = synctex;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Output bytes; always `None` once `success` is false.
    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref().filter(|_| self.success)
    }

    pub fn into_output(self) -> Option<Vec<u8>> {
        self.output.filter(|_| self.success)
    }
}

/// Failures of a backend or its transport. All of them are system errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend not configured: {0}")]
    NotConfigured(String),
    #[error("Unsupported request: {0}")]
    Unsupported(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("IO Error: {0}")]
    Io(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[async_trait]
pub trait CompilationBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    async fn compile(
        &self,
        request: &CompilationRequest,
    ) -> Result<CompilationResult, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_has_no_output() {
        let result = CompilationResult::failed(vec![], vec![CompilationError::new("boom")], vec![]);
        assert!(!result.success);
        assert!(result.output().is_none());
    }

    #[test]
    fn clearing_success_hides_output() {
        let mut result = CompilationResult::succeeded(b"%PDF".to_vec(), vec![], vec![]);
        assert_eq!(result.output(), Some(&b"%PDF"[..]));

        result.success = false;
        assert!(result.output().is_none());
        assert!(result.into_output().is_none());
    }

    #[test]
    fn project_main_source_is_looked_up_by_path() {
        let request = CompilationRequest::project(
            vec![
                ProjectFile::new("refs.bib", "@book{}", FileKind::Bib),
                ProjectFile::new("paper.tex", "\\documentclass{article}", FileKind::Tex),
            ],
            "paper.tex",
        );
        assert_eq!(request.main_file(), "paper.tex");
        assert_eq!(request.main_source(), "\\documentclass{article}");
    }

    #[test]
    fn image_files_are_base64_decoded() {
        let encoded = STANDARD.encode([0x89u8, b'P', b'N', b'G']);
        let image = ProjectFile::new("a.png", encoded, FileKind::Image);
        assert_eq!(image.bytes().unwrap(), vec![0x89, b'P', b'N', b'G']);

        let broken = ProjectFile::new("b.png", "***", FileKind::Image);
        assert!(matches!(broken.bytes(), Err(BackendError::Protocol(_))));
    }

    #[test]
    fn wire_names_match_the_compile_contract() {
        assert_eq!(serde_json::to_string(&TexEngine::XeLatex).unwrap(), "\"xelatex\"");
        assert_eq!(serde_json::to_string(&FileKind::Image).unwrap(), "\"image\"");
        let file: ProjectFile =
            serde_json::from_str(r#"{"path":"main.tex","content":"x","type":"tex"}"#).unwrap();
        assert_eq!(file.kind, FileKind::Tex);
    }
}
