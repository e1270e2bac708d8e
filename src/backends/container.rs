use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use crate::backend_traits::{
    BackendError, BackendKind, CompilationBackend, CompilationError, CompilationRequest,
    CompilationResult, OutputFormat, TexEngine,
};
use crate::log_parser;

pub const DEFAULT_RUNTIME: &str = "docker";
pub const DEFAULT_IMAGE: &str = "texlive/texlive:latest";
const WORKDIR: &str = "/workdir";

/// Runs latexmk inside a throwaway container with the project mounted.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    runtime: PathBuf,
    image: String,
}

impl ContainerBackend {
    pub fn new(runtime: Option<PathBuf>, image: Option<String>) -> Self {
        Self {
            runtime: runtime.unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME)),
            image: image.unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
        }
    }

    async fn write_project(&self, request: &CompilationRequest) -> Result<TempDir, BackendError> {
        let working_dir = tempfile::tempdir()?;

        for file in request.files() {
            let relative = Path::new(&file.path);
            let escapes = relative.is_absolute()
                || relative
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir));
            if escapes {
                let message = format!("{}: path escapes the project", file.path);
                return Err(BackendError::Unsupported(message));
            }
            let target = working_dir.path().join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, file.bytes()?).await?;
        }

        Ok(working_dir)
    }

    fn command(&self, working_dir: &Path, request: &CompilationRequest) -> Command {
        let engine_flag = match (request.format, request.engine) {
            (OutputFormat::Dvi, _) => "-dvi",
            (OutputFormat::Pdf, TexEngine::PdfLatex) => "-pdf",
            (OutputFormat::Pdf, TexEngine::XeLatex) => "-pdfxe",
            (OutputFormat::Pdf, TexEngine::LuaLatex) => "-pdflua",
        };

        let mut cmd = Command::new(&self.runtime);
        cmd.arg("run")
            .arg("--rm")
            .arg("--network")
            .arg("none")
            .arg("-v")
            .arg(format!("{}:{}", working_dir.display(), WORKDIR))
            .arg("-w")
            .arg(WORKDIR)
            .arg(&self.image)
            .arg("latexmk")
            .arg(engine_flag)
            .arg("-interaction=nonstopmode")
            .arg("-file-line-error")
            .arg("-synctex=-1")
            .arg(request.main_file())
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn process_output(
        &self,
        output: std::process::Output,
        working_dir: &Path,
        request: &CompilationRequest,
    ) -> Result<CompilationResult, BackendError> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // 125-127: the container runtime itself failed, latexmk never ran
        if let Some(code @ 125..=127) = output.status.code() {
            return Err(BackendError::Unavailable(format!(
                "{} exited with {}: {}",
                self.runtime.display(),
                code,
                stderr.trim()
            )));
        }

        let main = working_dir.join(request.main_file());
        let extension = match request.format {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Dvi => "dvi",
        };
        let tex_log = tokio::fs::read_to_string(main.with_extension("log")).await.ok();
        let full_log = match &tex_log {
            Some(tex_log) => tex_log.clone(),
            None => format!("{}\n\nSTDERR:\n{}", stdout, stderr),
        };
        let log: Vec<String> = full_log.lines().map(str::to_string).collect();
        let parsed = log_parser::parse_log(&full_log);

        let output_bytes = if output.status.success() {
            tokio::fs::read(main.with_extension(extension)).await.ok()
        } else {
            None
        };

        match output_bytes {
            Some(bytes) => {
                let synctex = tokio::fs::read_to_string(main.with_extension("synctex")).await.ok();
                Ok(CompilationResult::succeeded(bytes, log, parsed.warnings).with_synctex(synctex))
            }
            None => {
                let mut errors = parsed.errors;
                if errors.is_empty() {
                    let detail = stderr.lines().last().unwrap_or("no output produced").trim();
                    errors.push(CompilationError::new(format!("latexmk failed: {}", detail)));
                }
                Ok(CompilationResult::failed(log, errors, parsed.warnings))
            }
        }
    }
}

#[async_trait]
impl CompilationBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn compile(
        &self,
        request: &CompilationRequest,
    ) -> Result<CompilationResult, BackendError> {
        let working_dir = self.write_project(request).await?;

        let child = self.command(working_dir.path(), request).output();
        let output = match tokio::time::timeout(request.timeout, child).await {
            Err(_) => return Err(BackendError::Timeout(request.timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::Unavailable(format!(
                    "container runtime `{}` not found",
                    self.runtime.display()
                )));
            }
            Ok(Err(e)) => return Err(BackendError::Io(e.to_string())),
            Ok(Ok(output)) => output,
        };

        let result = self.process_output(output, working_dir.path(), request).await?;
        Ok(result.with_backend(BackendKind::Container))
    }
}
