use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AnamnesisConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub inference: InferenceConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// "memory" or "postgres"
    pub backend: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    pub base_url: String,
    pub model: String,
    /// Falls back to the GROQ_API_KEY env var when empty.
    #[serde(default)]
    pub api_key: String,
    pub timeout_seconds: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// 0 = all turns in the conversation.
    pub context_window_turns: usize,
    /// Token budget for the context handed to the inference service,
    /// enforced before delegating (oldest turns trimmed first).
    pub max_context_tokens: usize,
    /// Minimum confidence required to overwrite an existing value.
    pub acceptance_threshold: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            context_window_turns: 0,
            max_context_tokens: 4096,
            acceptance_threshold: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconciliationConfig {
    pub max_cas_retries: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self { max_cas_retries: 3 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8930,
        }
    }
}

impl AnamnesisConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        s.try_deserialize()
    }
}
