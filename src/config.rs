use serde::Deserialize;
use std::{fs, path::Path};

use crate::charges::DEFAULT_ALLOWED_COLUMNS;

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub llm: LlmSection,
    pub pipeline: PipelineSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Directory where uploads are spooled while a request is processed.
    pub upload_dir: String,
    pub max_upload_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            upload_dir: "uploads".to_string(),
            max_upload_bytes: 25 * 1024 * 1024,
        }
    }
}

/// OpenAI-compatible completion endpoint.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Extra attempts after the first one, for transient failures only.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
            timeout_secs: 60,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationMode {
    /// Re-key totals in process. Only exact names and names equal after
    /// dropping case and punctuation are matched.
    Local,
    /// Ask the LLM to re-key, then re-check the shape locally.
    Oracle,
    /// Return raw spreadsheet columns.
    Off,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub sheet_name: String,
    pub default_carrier: String,
    /// When set, a request without a carrier is rejected instead of
    /// falling back to `default_carrier`.
    pub require_carrier: bool,
    pub normalization: NormalizationMode,
    pub allowed_columns: Vec<String>,
    pub rate_table_path: Option<String>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            sheet_name: "datasheet".to_string(),
            default_carrier: "FedEx".to_string(),
            require_carrier: false,
            normalization: NormalizationMode::Oracle,
            allowed_columns: DEFAULT_ALLOWED_COLUMNS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            rate_table_path: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Overlay environment settings. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| format!("invalid PORT {port:?}: {e}"))?;
        }
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.llm.model = model;
        }
        Ok(())
    }

    pub fn api_key(&self) -> Result<&str, Box<dyn std::error::Error>> {
        self.llm
            .api_key
            .as_deref()
            .ok_or_else(|| "OPENAI_API_KEY env var (or llm.api_key) is required".into())
    }
}
