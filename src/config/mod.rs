use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, warn};

use crate::{
    llm::{GatewaySettings, DEFAULT_BASE_URL, DEFAULT_MODEL},
    session::{CheckpointPolicy, RetryPolicy, SessionSettings, DEFAULT_MAX_HISTORY_CHARS},
    version::APP_NAME,
};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the conversation database
    pub data_dir: PathBuf,

    /// API key
    pub api_key: Option<String>,

    /// Base URL for the API
    pub base_url: String,

    /// Model to use
    pub model: String,

    /// Temperature for sampling
    pub temperature: Option<f32>,

    /// Maximum tokens for responses
    pub max_tokens: Option<u32>,

    /// System message for conversations
    pub system_message: Option<String>,

    pub connect_timeout_secs: u64,

    /// Longest silence tolerated while a reply streams
    pub read_timeout_secs: u64,

    pub checkpoint_every_deltas: u32,

    pub checkpoint_interval_ms: u64,

    /// Automatic re-issues for failures before the first token
    pub max_auto_retries: u32,

    pub retry_base_delay_ms: u64,

    pub max_history_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
            system_message: None,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            checkpoint_every_deltas: 16,
            checkpoint_interval_ms: 500,
            max_auto_retries: 2,
            retry_base_delay_ms: 500,
            max_history_chars: DEFAULT_MAX_HISTORY_CHARS,
        }
    }
}

/// Values read from a configuration file. Absent keys leave the defaults alone.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_message: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub checkpoint_every_deltas: Option<u32>,
    pub checkpoint_interval_ms: Option<u64>,
    pub max_auto_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub max_history_chars: Option<usize>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Config {
    /// Initialize configuration from various sources
    pub async fn init() -> Result<Self> {
        debug!("Initializing configuration");

        let mut config = Self::default();

        // Try to load from configuration files
        if let Some(file_config) = Self::load_from_file().await? {
            config.merge_with(file_config);
        }

        // Environment variables take precedence
        config.load_from_env();

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn load_from_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok());
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("PARLEY_API_KEY").or_else(|| var("ZHIPUAI_API_KEY")) {
            self.api_key = Some(key);
        }

        if let Some(base_url) = var("PARLEY_BASE_URL") {
            self.base_url = base_url;
        }

        if let Some(model) = var("PARLEY_MODEL") {
            self.model = model;
        }

        if let Some(data_dir) = var("PARLEY_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Some(temperature) = parse_var(&var, "PARLEY_TEMPERATURE") {
            self.temperature = Some(temperature);
        }

        if let Some(max_tokens) = parse_var(&var, "PARLEY_MAX_TOKENS") {
            self.max_tokens = Some(max_tokens);
        }

        if let Some(system_message) = var("PARLEY_SYSTEM_MESSAGE") {
            self.system_message = Some(system_message);
        }

        if let Some(secs) = parse_var(&var, "PARLEY_READ_TIMEOUT_SECS") {
            self.read_timeout_secs = secs;
        }
    }

    /// Load configuration from parley.json files
    ///
    /// Lookup order:
    /// 1. ./.parley.json
    /// 2. ./parley.json
    /// 3. $CONFIG_DIR/parley/parley.json
    pub async fn load_from_file() -> Result<Option<FileConfig>> {
        let mut config_paths = vec![PathBuf::from("./.parley.json"), PathBuf::from("./parley.json")];

        if let Some(config_dir) = dirs::config_dir() {
            config_paths.push(config_dir.join(APP_NAME).join("parley.json"));
        }

        for path in config_paths {
            if path.exists() {
                return Self::read_file(&path).await.map(Some);
            }
        }

        Ok(None)
    }

    async fn read_file(path: &Path) -> Result<FileConfig> {
        debug!("Loading configuration from: {}", path.display());
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| anyhow!("Invalid configuration file {}: {}", path.display(), e))
    }

    /// Merge file values into this configuration
    pub fn merge_with(&mut self, other: FileConfig) {
        if let Some(data_dir) = other.data_dir {
            self.data_dir = data_dir;
        }
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if let Some(base_url) = other.base_url {
            self.base_url = base_url;
        }
        if let Some(model) = other.model {
            self.model = model;
        }
        if other.temperature.is_some() {
            self.temperature = other.temperature;
        }
        if other.max_tokens.is_some() {
            self.max_tokens = other.max_tokens;
        }
        if other.system_message.is_some() {
            self.system_message = other.system_message;
        }
        if let Some(secs) = other.connect_timeout_secs {
            self.connect_timeout_secs = secs;
        }
        if let Some(secs) = other.read_timeout_secs {
            self.read_timeout_secs = secs;
        }
        if let Some(every) = other.checkpoint_every_deltas {
            self.checkpoint_every_deltas = every;
        }
        if let Some(ms) = other.checkpoint_interval_ms {
            self.checkpoint_interval_ms = ms;
        }
        if let Some(retries) = other.max_auto_retries {
            self.max_auto_retries = retries;
        }
        if let Some(ms) = other.retry_base_delay_ms {
            self.retry_base_delay_ms = ms;
        }
        if let Some(chars) = other.max_history_chars {
            self.max_history_chars = chars;
        }
    }

    /// Check if the configuration has a valid API key
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.trim().is_empty())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.has_api_key() {
            return Err(anyhow!(
                "No API key configured. Set PARLEY_API_KEY or ZHIPUAI_API_KEY, or add api_key to parley.json."
            ));
        }

        if self.model.trim().is_empty() {
            return Err(anyhow!("Model is required"));
        }

        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 {
                return Err(anyhow!("max_tokens must be greater than 0"));
            }
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(anyhow!("temperature must be between 0.0 and 2.0"));
            }
        }

        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be greater than 0"));
        }

        if self.checkpoint_every_deltas == 0 || self.checkpoint_interval_ms == 0 {
            return Err(anyhow!("checkpoint cadence must be greater than 0"));
        }

        Ok(())
    }

    /// Path of the conversation database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("parley.db")
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            system_message: self.system_message.clone(),
            checkpoint: CheckpointPolicy {
                every_deltas: self.checkpoint_every_deltas,
                interval: Duration::from_millis(self.checkpoint_interval_ms),
            },
            retry: RetryPolicy {
                max_auto_retries: self.max_auto_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
            max_history_chars: self.max_history_chars,
        }
    }
}

/// Read a numeric variable, ignoring values that do not parse
fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}
