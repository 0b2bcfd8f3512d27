use crate::config::Config;
use crate::error::PipelineError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// One text completion call. The model is chosen per call so the retry layer
/// can degrade to a fallback model without rebuilding the client.
#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str, model: &str) -> Result<String>;
}

/// Outcome of one image synthesis call. A safety rejection is an expected
/// condition, distinct from a transport or service failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    Url(String),
    Rejected(String),
}

#[async_trait]
pub trait ImageClient: Send + Sync + Debug {
    async fn generate(&self, prompt: &str) -> Result<ImageOutcome>;
}

/// Fails fast with a credential-specific error kind when the configured
/// provider has no usable credential, so callers can render an actionable
/// message instead of a generic retry prompt.
pub fn validate_credential(config: &Config) -> Result<(), PipelineError> {
    let provider = config.llm.provider.as_str();
    let missing = || PipelineError::MissingCredential {
        provider: provider.to_string(),
    };
    match provider {
        "gemini" => {
            let cfg = config.llm.gemini.as_ref().ok_or_else(missing)?;
            if cfg.api_key.trim().is_empty() {
                return Err(missing());
            }
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().ok_or_else(missing)?;
            if cfg.api_key.trim().is_empty() {
                return Err(missing());
            }
        }
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().ok_or_else(missing)?;
            if cfg.base_url.trim().is_empty() {
                return Err(missing());
            }
        }
        _ => return Err(missing()),
    }
    Ok(())
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    validate_credential(config).map_err(|e| anyhow!(e.to_string()))?;
    let provider = config.llm.provider.as_str();
    let missing = || anyhow!("missing {} settings in config", provider);
    match provider {
        "gemini" => {
            let cfg = config.llm.gemini.as_ref().ok_or_else(missing)?;
            Ok(Box::new(GeminiClient::new(&cfg.api_key)))
        }
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().ok_or_else(missing)?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url)))
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().ok_or_else(missing)?;
            Ok(Box::new(OpenAIClient::new(&cfg.api_key, cfg.base_url.as_deref())))
        }
        other => Err(anyhow!("Unknown LLM provider: {}", other)),
    }
}

pub fn create_image_client(config: &Config) -> Result<Option<Box<dyn ImageClient>>> {
    let Some(image) = &config.image else {
        return Ok(None);
    };
    match image.provider.as_str() {
        "openai" => {
            let api_key = image
                .api_key
                .clone()
                .ok_or_else(|| anyhow!("image.api_key required for openai"))?;
            Ok(Some(Box::new(OpenAIImageClient::new(
                &api_key,
                image.base_url.as_deref(),
            ))))
        }
        other => Err(anyhow!("Unknown image provider: {}", other)),
    }
}

// --- Gemini ---

#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str, model: &str) -> Result<String> {
        // Gemini-family models carry the model in the URL path.
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            model, self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: user.to_string(),
                }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: system.to_string(),
                }],
            }),
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = match serde_json::from_str(&response_text) {
            Ok(r) => r,
            Err(e) => {
                return Err(anyhow!(
                    "Failed to parse Gemini response: {}. Body: {}",
                    e,
                    response_text
                ))
            }
        };

        if let Some(err) = result.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }

        if let Some(candidates) = result.candidates {
            if let Some(first) = candidates.first() {
                if let Some(content) = &first.content {
                    if let Some(part) = content.parts.first() {
                        return Ok(part.text.clone());
                    }
                }

                let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
                return Err(anyhow!("Gemini response empty. Finish reason: {}", reason));
            }
        }

        Err(anyhow!(
            "Gemini response format unexpected or empty. Body: {}",
            response_text
        ))
    }
}

// --- Ollama ---

#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str, model: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: model.to_string(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OllamaMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            stream: false,
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        if result.message.content.trim().is_empty() {
            return Err(anyhow!("Ollama response empty"));
        }
        Ok(result.message.content)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str, model: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: model.to_string(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        if let Some(choice) = result.choices.first() {
            if let Some(content) = &choice.message.content {
                if !content.trim().is_empty() {
                    return Ok(content.clone());
                }
            }
        }

        Err(anyhow!("OpenAI response empty or missing content"))
    }
}

// --- OpenAI image synthesis ---

#[derive(Debug)]
struct OpenAIImageClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIImageClient {
    fn new(api_key: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ImageRequest {
    prompt: String,
    n: u8,
    size: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
    error: Option<ImageError>,
}

#[derive(Deserialize)]
struct ImageDatum {
    url: Option<String>,
}

#[derive(Deserialize)]
struct ImageError {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[async_trait]
impl ImageClient for OpenAIImageClient {
    async fn generate(&self, prompt: &str) -> Result<ImageOutcome> {
        let url = format!("{}/images/generations", self.base_url);

        let request_body = ImageRequest {
            prompt: prompt.to_string(),
            n: 1,
            size: "1024x1024".to_string(),
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        let result: ImageResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse image response: {}. Body: {}", e, body))?;

        if let Some(err) = result.error {
            // Safety filter rejections come back as a policy-violation code.
            if err.code.as_deref() == Some("content_policy_violation") {
                return Ok(ImageOutcome::Rejected(err.message));
            }
            return Err(anyhow!("Image API error ({}): {}", status, err.message));
        }

        match result.data.first().and_then(|d| d.url.clone()) {
            Some(url) => Ok(ImageOutcome::Url(url)),
            None => Err(anyhow!("Image response missing url. Body: {}", body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GeminiConfig, LlmConfig};

    fn config_with(provider: &str, gemini_key: &str) -> Config {
        Config {
            build_folder: "build".to_string(),
            unattended: true,
            llm: LlmConfig {
                provider: provider.to_string(),
                model: "m".to_string(),
                fallback_model: "f".to_string(),
                retry_count: 3,
                retry_delay_seconds: 0,
                gemini: Some(GeminiConfig {
                    api_key: gemini_key.to_string(),
                }),
                ollama: None,
                openai: None,
            },
            image: None,
            pipeline: Default::default(),
        }
    }

    #[test]
    fn missing_credential_is_a_distinct_error_kind() {
        let err = validate_credential(&config_with("gemini", "  ")).unwrap_err();
        assert!(matches!(err, PipelineError::MissingCredential { .. }));

        let err = validate_credential(&config_with("openai", "k")).unwrap_err();
        assert!(matches!(err, PipelineError::MissingCredential { .. }));

        assert!(validate_credential(&config_with("gemini", "key")).is_ok());
    }

    #[test]
    fn gemini_response_parsing_safety_block() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let candidate = &result.candidates.as_ref().unwrap()[0];

        assert!(candidate.content.is_none());
        assert_eq!(candidate.finish_reason.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn gemini_response_parsing_success() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "Hello world" }
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let candidate = &result.candidates.as_ref().unwrap()[0];

        assert_eq!(candidate.content.as_ref().unwrap().parts[0].text, "Hello world");
    }

    #[test]
    fn openai_response_parsing_success() {
        let json = r#"{
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello there"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.choices[0].message.content.as_deref(), Some("Hello there"));
    }

    #[test]
    fn image_policy_violation_is_rejection_not_failure() {
        let json = r#"{
            "error": {
                "message": "Your request was rejected by the safety system",
                "code": "content_policy_violation"
            }
        }"#;
        let result: ImageResponse = serde_json::from_str(json).unwrap();
        let err = result.error.unwrap();
        assert_eq!(err.code.as_deref(), Some("content_policy_violation"));
    }
}
