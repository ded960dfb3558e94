use crate::core::config::Config;
use crate::core::error::{GenerationError, GenerationErrorKind};
use crate::services::sampling::SamplingProfile;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use url::Url;

/// Boundary adapter over a text-completion service. Implementations send
/// the payload untouched and never retry; retry policy belongs to the caller.
#[async_trait]
pub trait GenerationClient: Send + Sync + Debug {
    async fn generate(&self, payload: &str, profile: &SamplingProfile) -> Result<String, GenerationError>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    10
}

pub fn create_client(config: &Config) -> Result<Box<dyn GenerationClient>> {
    match config.llm.provider.as_str() {
        "gemini" => {
            let cfg = config.llm.gemini.as_ref().context("Gemini config missing")?;
            Ok(Box::new(GeminiClient::new(&cfg.api_key, &cfg.model, cfg.base_url.as_deref())?))
        }
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().context("Ollama config missing")?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model)))
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().context("OpenAI config missing")?;
            Ok(Box::new(OpenAIClient::new(&cfg.api_key, &cfg.model, cfg.base_url.as_deref())))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

async fn read_success_body(resp: reqwest::Response, provider: &str) -> Result<String, GenerationError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(GenerationError::new(
            GenerationErrorKind::from_status(status.as_u16()),
            format!("{} API error ({}): {}", provider, status.as_u16(), body),
        ));
    }
    Ok(body)
}

// --- Gemini ---
struct GeminiClient {
    api_key: String,
    endpoint: Url,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Result<Self> {
        let base = base_url
            .unwrap_or("https://generativelanguage.googleapis.com/v1beta")
            .trim_end_matches('/');
        let endpoint = Url::parse(&format!("{}/models/{}:generateContent", base, model))
            .context("Invalid Gemini endpoint")?;
        Ok(Self {
            api_key: api_key.to_string(),
            endpoint,
            client: reqwest::Client::new(),
        })
    }
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<GeminiThinkingConfig>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    thinking_budget: u32,
}

impl From<&SamplingProfile> for GeminiGenerationConfig {
    fn from(profile: &SamplingProfile) -> Self {
        Self {
            temperature: profile.temperature,
            top_p: profile.top_p,
            top_k: profile.top_k,
            thinking_config: profile
                .reasoning_budget
                .map(|thinking_budget| GeminiThinkingConfig { thinking_budget }),
        }
    }
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
    #[serde(default)]
    text: String,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    #[serde(default)]
    code: Option<u16>,
    message: String,
}

fn extract_gemini_text(response_text: &str) -> Result<String, GenerationError> {
    let result: GeminiResponse = serde_json::from_str(response_text).map_err(|e| {
        GenerationError::invalid_response(format!(
            "Failed to parse Gemini response: {}. Body: {}",
            e, response_text
        ))
    })?;

    if let Some(err) = result.error {
        let kind = err
            .code
            .map(GenerationErrorKind::from_status)
            .unwrap_or(GenerationErrorKind::InvalidResponse);
        return Err(GenerationError::new(kind, format!("Gemini API returned error: {}", err.message)));
    }

    let candidates = result.candidates.unwrap_or_default();
    let first = candidates.first().ok_or_else(|| {
        GenerationError::invalid_response(format!("Gemini response has no candidates. Body: {}", response_text))
    })?;

    // Thought summaries are not part of the answer.
    let text: String = first
        .content
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter(|p| !p.thought)
        .map(|p| p.text.as_str())
        .collect();

    if text.trim().is_empty() {
        let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
        return Err(GenerationError::invalid_response(format!(
            "Gemini response empty. Finish reason: {}",
            reason
        )));
    }
    Ok(text)
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn generate(&self, payload: &str, profile: &SamplingProfile) -> Result<String, GenerationError> {
        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: payload.to_string(),
                }],
            }],
            generation_config: profile.into(),
        };

        debug!("Gemini request with profile '{}' ({} chars)", profile.name, payload.chars().count());
        let resp = self
            .client
            .post(self.endpoint.clone())
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body)
            .send()
            .await?;
        let response_text = read_success_body(resp, "Gemini").await?;
        extract_gemini_text(&response_text)
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize, Debug, PartialEq)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
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
impl GenerationClient for OllamaClient {
    async fn generate(&self, payload: &str, profile: &SamplingProfile) -> Result<String, GenerationError> {
        let url = format!("{}/api/chat", self.base_url);
        if profile.reasoning_budget.is_some() {
            debug!("Ollama ignores reasoning budget of profile '{}'", profile.name);
        }

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: payload.to_string(),
            }],
            stream: false,
            options: OllamaOptions {
                temperature: profile.temperature,
                top_p: profile.top_p,
                top_k: profile.top_k,
            },
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;
        let body = read_success_body(resp, "Ollama").await?;
        let result: OllamaResponse = serde_json::from_str(&body)
            .map_err(|e| GenerationError::invalid_response(format!("Failed to parse Ollama response: {}", e)))?;
        if result.message.content.trim().is_empty() {
            return Err(GenerationError::invalid_response("Ollama response empty"));
        }
        Ok(result.message.content)
    }
}

// --- OpenAI ---

struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

impl std::fmt::Debug for OpenAIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
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
impl GenerationClient for OpenAIClient {
    async fn generate(&self, payload: &str, profile: &SamplingProfile) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        if profile.top_k.is_some() || profile.reasoning_budget.is_some() {
            debug!("OpenAI ignores top_k/reasoning budget of profile '{}'", profile.name);
        }

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: payload.to_string(),
            }],
            temperature: profile.temperature,
            top_p: profile.top_p,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        let body = read_success_body(resp, "OpenAI").await?;
        let result: OpenAIResponse = serde_json::from_str(&body)
            .map_err(|e| GenerationError::invalid_response(format!("Failed to parse OpenAI response: {}", e)))?;
        match result.choices.into_iter().next().and_then(|c| c.message.content) {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(GenerationError::invalid_response("OpenAI response empty or missing content")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_response_parsing_safety_block() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let err = extract_gemini_text(json).unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::InvalidResponse);
        assert!(err.message.contains("SAFETY"));
    }

    #[test]
    fn test_gemini_response_parsing_empty_content() {
        let json = r#"{
            "candidates": [
                {
                    "content": { "role": "model" },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        let err = extract_gemini_text(json).unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::InvalidResponse);
    }

    #[test]
    fn test_gemini_response_parsing_success_skips_thoughts() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "planning the scene", "thought": true },
                            { "text": "第1集。" },
                            { "text": "雨夜。" }
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        assert_eq!(extract_gemini_text(json).unwrap(), "第1集。雨夜。");
    }

    #[test]
    fn test_gemini_error_body_is_classified() {
        let json = r#"{ "error": { "code": 429, "message": "Resource exhausted", "status": "RESOURCE_EXHAUSTED" } }"#;
        let err = extract_gemini_text(json).unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::RateLimited);

        let json = r#"{ "error": { "code": 403, "message": "API key not valid" } }"#;
        let err = extract_gemini_text(json).unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::Unauthorized);
        assert!(err.message.contains("API key not valid"));
    }

    #[test]
    fn test_gemini_malformed_body_is_invalid_response() {
        let err = extract_gemini_text("<html>bad gateway</html>").unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::InvalidResponse);
    }

    #[test]
    fn test_gemini_generation_config_from_profile() {
        let config = GeminiGenerationConfig::from(&SamplingProfile::segment_default());
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["topP"], serde_json::json!(0.95f32));
        assert_eq!(json["thinkingConfig"]["thinkingBudget"], 8000);
        assert!(json.get("topK").is_none());

        let config = GeminiGenerationConfig::from(&SamplingProfile::outline_default());
        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("topP").is_none());
        assert_eq!(json["thinkingConfig"]["thinkingBudget"], 6000);
    }

    #[test]
    fn test_gemini_endpoint_honours_base_url() {
        let client = GeminiClient::new("k", "gemini-pro", Some("http://localhost:9000/v1beta/")).unwrap();
        assert_eq!(
            client.endpoint.as_str(),
            "http://localhost:9000/v1beta/models/gemini-pro:generateContent"
        );
    }

    #[tokio::test]
    async fn test_gemini_transport_error_hides_api_key() {
        let client = GeminiClient::new("SECRET-KEY-123", "m", Some("http://127.0.0.1:1/v1beta")).unwrap();
        let err = client
            .generate("payload", &SamplingProfile::segment_default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::Network);
        assert!(!err.message.contains("SECRET-KEY-123"));
        assert!(!err.to_string().contains("SECRET-KEY-123"));
        assert!(!format!("{:?}", client).contains("SECRET-KEY-123"));
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1677652288,
            "model": "gpt-3.5-turbo-0613",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello there, how may I assist you today?"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.choices[0].message.content.as_deref(),
            Some("Hello there, how may I assist you today?")
        );
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let yaml = "llm:\n  provider: carrier-pigeon\n";
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(create_client(&config).is_err());
    }
}
