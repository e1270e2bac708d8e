use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

use super::remote::transport_error;
use crate::backend_traits::{
    BackendError, BackendKind, CompilationBackend, CompilationError, CompilationRequest,
    CompilationResult, FileKind, OutputFormat, TexEngine,
};
use crate::log_parser;

pub const DEFAULT_HOSTED_URL: &str = "https://latex.ytotech.com/builds/sync";

#[derive(Debug, Serialize, PartialEq)]
pub struct BuildRequest {
    pub compiler: TexEngine,
    pub resources: Vec<BuildResource>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct BuildResource {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Text resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Binary resources, base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl BuildRequest {
    pub fn from_request(request: &CompilationRequest) -> Self {
        let main_file = request.main_file();
        let resources = request
            .files()
            .into_iter()
            .map(|f| {
                let main = f.path == main_file;
                let (content, file) = match f.kind {
                    FileKind::Image => (None, Some(f.content)),
                    _ => (Some(f.content), None),
                };
                BuildResource {
                    main,
                    path: (!main).then_some(f.path),
                    content,
                    file,
                }
            })
            .collect();

        Self {
            compiler: request.engine,
            resources,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BuildFailure {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    logs: Option<String>,
}

/// Public build service: PDF bytes on success, a JSON error body otherwise.
#[derive(Debug, Clone)]
pub struct HostedApiBackend {
    endpoint: String,
    client: Client,
    api_key: Option<String>,
}

impl HostedApiBackend {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_HOSTED_URL.to_string()),
            client: Client::new(),
            api_key,
        }
    }
}

fn failure_result(status: reqwest::StatusCode, body: &str) -> CompilationResult {
    let failure: BuildFailure = serde_json::from_str(body).unwrap_or(BuildFailure {
        error: Some(body.trim().to_string()),
        logs: None,
    });
    let logs = failure.logs.unwrap_or_default();
    let parsed = log_parser::parse_log(&logs);

    let mut log: Vec<String> = logs.lines().map(str::to_string).collect();
    let summary = format!(
        "hosted build failed ({}): {}",
        status,
        failure.error.as_deref().unwrap_or("no details")
    );
    log.push(summary.clone());

    let mut errors = parsed.errors;
    if errors.is_empty() {
        errors.push(CompilationError::new(summary));
    }
    CompilationResult::failed(log, errors, parsed.warnings)
}

#[async_trait]
impl CompilationBackend for HostedApiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HostedApi
    }

    async fn compile(
        &self,
        request: &CompilationRequest,
    ) -> Result<CompilationResult, BackendError> {
        if request.format != OutputFormat::Pdf {
            return Err(BackendError::Unsupported("hosted API only returns PDF".to_string()));
        }

        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(request.timeout)
            .json(&BuildRequest::from_request(request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| transport_error(e, request))?;
        let status = response.status();
        let is_pdf = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/pdf"));

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::Unavailable(format!("hosted API returned {}", status)));
        }

        let body = response.bytes().await.map_err(|e| transport_error(e, request))?;
        let result = if status.is_success() && is_pdf {
            let log = vec![format!("hosted build succeeded ({} bytes)", body.len())];
            CompilationResult::succeeded(body.to_vec(), log, Vec::new())
        } else {
            failure_result(status, &String::from_utf8_lossy(&body))
        };

        Ok(result.with_backend(BackendKind::HostedApi))
    }
}
