use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::backend_traits::{
    BackendError, BackendKind, CompilationBackend, CompilationError, CompilationRequest,
    CompilationResult, DocumentSource, OutputFormat, ProjectFile, TexEngine,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequestBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<&'a [ProjectFile]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_file: Option<&'a str>,
    pub engine: TexEngine,
    pub timeout: u64,
}

impl<'a> CompileRequestBody<'a> {
    pub fn from_request(request: &'a CompilationRequest) -> Self {
        let (content, files, main_file) = match &request.source {
            DocumentSource::Single(content) => (Some(content.as_str()), None, None),
            DocumentSource::Project { files, main_file } => {
                (None, Some(files.as_slice()), Some(main_file.as_str()))
            }
        };
        Self {
            content,
            files,
            main_file,
            engine: request.engine,
            timeout: request.timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompileResponse {
    pub success: bool,
    #[serde(default)]
    pub pdf: Option<String>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub errors: Vec<CompilationError>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub synctex: Option<String>,
}

impl CompileResponse {
    pub fn into_result(self) -> Result<CompilationResult, BackendError> {
        match (self.success, self.pdf) {
            (true, Some(pdf)) => {
                let bytes = STANDARD
                    .decode(pdf.trim())
                    .map_err(|e| BackendError::Protocol(format!("invalid base64 pdf: {}", e)))?;
                let result = CompilationResult::succeeded(bytes, self.log, self.warnings);
                Ok(result.with_synctex(self.synctex))
            }
            (true, None) => {
                Err(BackendError::Protocol("success reported without a pdf".to_string()))
            }
            (false, _) => {
                let mut errors = self.errors;
                if errors.is_empty() {
                    let message = "remote compilation failed without diagnostics";
                    errors.push(CompilationError::new(message));
                }
                Ok(CompilationResult::failed(self.log, errors, self.warnings))
            }
        }
    }
}

/// User-supplied compile server speaking the JSON contract.
#[derive(Debug, Clone)]
pub struct RemoteServerBackend {
    endpoint: String,
    client: Client,
    auth_token: Option<String>,
}

impl RemoteServerBackend {
    pub fn new(endpoint: String, auth_token: Option<String>) -> Self {
        let client = Client::new();
        Self { endpoint, auth_token, client }
    }

    fn url(&self) -> String {
        format!("{}/compile", self.endpoint.trim_end_matches('/'))
    }
}

pub(crate) fn transport_error(error: reqwest::Error, request: &CompilationRequest) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(request.timeout)
    } else {
        BackendError::Network(error.to_string())
    }
}

#[async_trait]
impl CompilationBackend for RemoteServerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteServer
    }

    async fn compile(
        &self,
        request: &CompilationRequest,
    ) -> Result<CompilationResult, BackendError> {
        if request.format != OutputFormat::Pdf {
            return Err(BackendError::Unsupported("remote server only returns PDF".to_string()));
        }

        let mut req = self
            .client
            .post(self.url())
            .timeout(request.timeout)
            .json(&CompileRequestBody::from_request(request));

        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|e| transport_error(e, request))?;
        let status = response.status();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::Unavailable(format!("server returned {}", status)));
        }

        // 4xx bodies still follow the contract when the server rejected the document
        let body = response.text().await.map_err(|e| transport_error(e, request))?;
        let remote: CompileResponse = serde_json::from_str(&body).map_err(|e| {
            let message = format!("server returned {} with an unreadable body: {}", status, e);
            BackendError::Protocol(message)
        })?;

        Ok(remote.into_result()?.with_backend(BackendKind::RemoteServer))
    }
}
