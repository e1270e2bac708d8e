use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend_traits::{DEFAULT_TIMEOUT, TexEngine};
use crate::position_map::PageGeometry;

const ENV_PREFIX: &str = "LATEX_RUNTIME_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime binary, `docker` when unset.
    pub runtime: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostedApiConfig {
    /// Public build service URL when unset.
    pub url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub engine: TexEngine,
    pub timeout_ms: u64,
    pub in_process: bool,
    pub container: Option<ContainerConfig>,
    pub remote: Option<RemoteConfig>,
    pub hosted_api: Option<HostedApiConfig>,
    pub page_geometry: PageGeometry,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: TexEngine::default(),
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            in_process: true,
            container: None,
            remote: None,
            hosted_api: Some(HostedApiConfig::default()),
            page_geometry: PageGeometry::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()
    }

    /// Reads `LATEX_RUNTIME_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            var(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        let mut config = Self::default();

        if let Some(engine) = get("ENGINE") {
            config.engine = parse_engine(&engine)?;
        }
        if let Some(timeout) = get("TIMEOUT_MS") {
            config.timeout_ms = timeout
                .trim()
                .parse()
                .map_err(|_| invalid("LATEX_RUNTIME_TIMEOUT_MS", &timeout))?;
        }
        if let Some(flag) = get("IN_PROCESS") {
            config.in_process = parse_flag("LATEX_RUNTIME_IN_PROCESS", &flag)?;
        }

        let runtime = get("CONTAINER_RUNTIME");
        let image = get("CONTAINER_IMAGE");
        if runtime.is_some() || image.is_some() {
            config.container = Some(ContainerConfig { runtime, image });
        }

        if let Some(url) = get("REMOTE_URL") {
            config.remote = Some(RemoteConfig {
                url,
                auth_token: get("REMOTE_TOKEN"),
            });
        }

        let hosted_enabled = match get("HOSTED_API") {
            Some(flag) => parse_flag("LATEX_RUNTIME_HOSTED_API", &flag)?,
            None => true,
        };
        config.hosted_api = hosted_enabled.then(|| HostedApiConfig {
            url: get("HOSTED_URL"),
            api_key: get("HOSTED_API_KEY"),
        });

        config.validate()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub(crate) fn validate(self) -> Result<Self, ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms", "0"));
        }
        if !(self.page_geometry.width > 0.0 && self.page_geometry.height > 0.0) {
            return Err(invalid(
                "page_geometry",
                &format!("{}x{}", self.page_geometry.width, self.page_geometry.height),
            ));
        }
        Ok(self)
    }
}

pub fn parse_engine(value: &str) -> Result<TexEngine, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "pdflatex" | "pdftex" => Ok(TexEngine::PdfLatex),
        "xelatex" | "xetex" => Ok(TexEngine::XeLatex),
        "lualatex" | "luatex" => Ok(TexEngine::LuaLatex),
        _ => Err(invalid("engine", value)),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn empty_json_gives_defaults() {
        let config = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.in_process);
        assert!(config.hosted_api.is_some());
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn json_sections() {
        let config = RuntimeConfig::from_json(
            r#"{"engine": "xelatex", "timeout_ms": 5000, "hosted_api": null,
                "remote": {"url": "http://localhost:8080", "auth_token": "t"},
                "container": {"image": "tex:2024"}}"#,
        )
        .unwrap();
        assert_eq!(config.engine, TexEngine::XeLatex);
        assert_eq!(config.hosted_api, None);
        assert_eq!(config.remote.unwrap().auth_token.as_deref(), Some("t"));
        assert_eq!(config.container.unwrap().runtime, None);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(matches!(
            RuntimeConfig::from_json(r#"{"timeout_ms": 0}"#),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LATEX_RUNTIME_ENGINE", "XeTeX"),
            ("LATEX_RUNTIME_IN_PROCESS", "off"),
            ("LATEX_RUNTIME_REMOTE_URL", "https://tex.example.org"),
            ("LATEX_RUNTIME_HOSTED_API", "0"),
            ("LATEX_RUNTIME_CONTAINER_RUNTIME", "podman"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.engine, TexEngine::XeLatex);
        assert!(!config.in_process);
        assert_eq!(config.remote.unwrap().url, "https://tex.example.org");
        assert_eq!(config.hosted_api, None);
        assert_eq!(config.container.unwrap().runtime.as_deref(), Some("podman"));
    }

    #[test]
    fn bad_flag_names_the_variable() {
        let err = RuntimeConfig::from_vars(|k| {
            (k == "LATEX_RUNTIME_IN_PROCESS").then(|| "maybe".to_string())
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid value `maybe` for LATEX_RUNTIME_IN_PROCESS");
    }
}
