use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::QuillError;
use crate::options::SamplingOptions;

const DEFAULT_CONFIG_FILE: &str = "quill.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sampling: SamplingOptions,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the inference server. Falls back to the backend's default.
    pub endpoint: Option<String>,
    pub backend: BackendKind,
}

impl ServerConfig {
    pub fn endpoint_url(&self) -> Result<Url, QuillError> {
        match &self.endpoint {
            Some(raw) => {
                Url::parse(raw).map_err(|e| QuillError::InvalidEndpoint(format!("{raw}: {e}")))
            }
            None => Ok(self.backend.default_endpoint()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after a cancellation before the next generation may start.
    pub cooldown_ms: u64,
    /// Idle time before the live token count is refreshed.
    pub debounce_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 500,
            debounce_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Load `$QUILL_CONFIG` (or `./quill.toml` if present), then apply
    /// `QUILL_ENDPOINT` / `QUILL_BACKEND` overrides. A broken file is logged
    /// and replaced by defaults.
    pub fn load() -> Self {
        let path = env::var("QUILL_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "ignoring config file: {e}");
                Self::default()
            }),
            None => Self::default(),
        };

        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    pub fn load_from(path: &Path) -> Result<Self, QuillError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| QuillError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        tracing::info!(path = %path.display(), backend = %config.server.backend, "loaded config");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, QuillError> {
        toml::from_str(text).map_err(|e| QuillError::Config(e.to_string()))
    }

    /// Apply overrides from `lookup` (the environment, in [`load`](Self::load)).
    /// An unparseable backend name is logged and ignored. Switching backends
    /// adapts a configured endpoint's scheme and default port, unless
    /// `QUILL_ENDPOINT` replaces it.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = lookup("QUILL_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.switch_backend(kind),
                Err(e) => tracing::warn!("QUILL_BACKEND ignored: {e}"),
            }
        }
        if let Some(endpoint) = lookup("QUILL_ENDPOINT").filter(|e| !e.trim().is_empty()) {
            self.server.endpoint = Some(endpoint);
        }
    }

    fn switch_backend(&mut self, kind: BackendKind) {
        if kind != self.server.backend
            && let Some(raw) = &self.server.endpoint
        {
            match self.server.endpoint_url().and_then(|url| kind.adapt_endpoint(&url)) {
                Ok(adapted) => {
                    tracing::debug!(from = %raw, to = %adapted, "adapted endpoint to backend");
                    self.server.endpoint = Some(adapted.to_string());
                }
                Err(e) => tracing::warn!("endpoint left as configured: {e}"),
            }
        }
        self.server.backend = kind;
    }
}
