//! Environment-backed runtime configuration
//!
//! All knobs are read once at startup; callers receive a plain struct
//! instead of scattering `env::var` lookups through the codebase.

use std::env;
use std::path::PathBuf;

use crate::error::AgentError;
use crate::llm::gemini::DEFAULT_BASE_URL;

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_API_PORT: u16 = 8081;

#[derive(Debug, Clone)]
pub struct Settings {
    /// API key for the model endpoint.
    pub api_key: String,
    /// OpenAI-compatible base URL of the model endpoint.
    pub base_url: String,
    /// Model used for streamed turns and summarization.
    pub model: String,
    /// Directory holding the ledger's account and transaction files.
    pub data_dir: PathBuf,
    /// Port for the read-only reporting API.
    pub api_port: u16,
}

impl Settings {
    /// Load settings from the environment. `GEMINI_API_KEY` is required;
    /// everything else has a default.
    pub fn from_env() -> crate::Result<Self> {
        let api_key = env::var("GEMINI_API_KEY")
            .map_err(|_| AgentError::Config("GEMINI_API_KEY not set".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(AgentError::Config("GEMINI_API_KEY is empty".to_string()));
        }

        let api_port = match env::var("API_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| AgentError::Config(format!("invalid API_PORT: {}", raw)))?,
            Err(_) => DEFAULT_API_PORT,
        };

        Ok(Self {
            api_key,
            base_url: env::var("MODEL_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: env::var("MODEL_NAME").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
            api_port,
        })
    }
}
