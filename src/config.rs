use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    /// Illustration is optional; leaving this section out disables the stage.
    #[serde(default)]
    pub image: Option<ImageConfig>,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    /// Model requested for every stage unless a caller overrides it.
    pub model: String,
    /// Conservative model tried once the primary's retries are exhausted.
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ImageConfig {
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Global style hint appended to every illustration prompt.
    #[serde(default)]
    pub style: Option<String>,
    /// Pause between consecutive image requests when bulk-regenerating.
    #[serde(default = "default_image_delay")]
    pub request_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Byte budget for a single summarization chunk.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_max_bytes: usize,
    /// Bounded prefix of the condensed draft fed to extraction/outline.
    #[serde(default = "default_condensed_prefix")]
    pub condensed_prefix_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_max_bytes: default_chunk_bytes(),
            condensed_prefix_bytes: default_condensed_prefix(),
        }
    }
}

fn default_build() -> String {
    "build".to_string()
}
fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    2
}
fn default_fallback_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_chunk_bytes() -> usize {
    6000
}
fn default_condensed_prefix() -> usize {
    8000
}
fn default_image_delay() -> u64 {
    1500
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}
