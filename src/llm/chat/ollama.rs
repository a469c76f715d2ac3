use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use async_trait::async_trait;
use log::info;

use super::{
    build_http_client,
    format_conversation_for_prompt,
    http_stream_generate,
    ChatClient,
    ChunkStream,
    ParsedLine,
};
use crate::error::RelayError;
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::WireMessage;

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

fn parse_ollama_line(line: &str) -> Result<ParsedLine, RelayError> {
    let resp: StreamResponse = serde_json::from_str(line).map_err(|e|
        RelayError::provider("unreadable Ollama stream line", e)
    )?;
    if let Some(err) = resp.error {
        return Err(RelayError::Provider { message: err, source: None });
    }
    Ok(ParsedLine::text(resp.response).finished(resp.done))
}

impl OllamaClient {
    pub fn new(http: HttpClient, base_url: Option<String>, completion_model: Option<String>) -> Self {
        let model = completion_model.unwrap_or_else(|| "cogito:3b".to_string());
        let url = base_url.unwrap_or_else(|| "http://localhost:11434".into());

        Self {
            http,
            base_url: url,
            completion_model: model,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, RelayError> {
        if config.llm_type != LlmType::Ollama {
            return Err(RelayError::Config("Invalid config type for OllamaClient".into()));
        }
        let http = build_http_client(config.connect_timeout)?;

        Ok(Self::new(http, config.base_url.clone(), config.completion_model.clone()))
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn stream_chat(&self, messages: &[WireMessage]) -> Result<ChunkStream, RelayError> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let req = GenerateRequest {
            model: self.completion_model.clone(),
            prompt: format_conversation_for_prompt(messages),
            stream: true,
        };
        info!(
            "OllamaClient::stream_chat() → model={} prompt_chars={}",
            self.completion_model,
            req.prompt.len()
        );

        http_stream_generate(self.http.post(&url).json(&req), parse_ollama_line).await
    }

    fn get_model(&self) -> String {
        self.completion_model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }

    fn get_llm_type(&self) -> LlmType {
        LlmType::Ollama
    }

    fn supports_structured_messages(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_line() {
        let parsed = parse_ollama_line(r#"{"model":"m","response":"Hel","done":false}"#).unwrap();
        assert_eq!(parsed, ParsedLine::text("Hel"));
    }

    #[test]
    fn final_line_is_done() {
        let parsed = parse_ollama_line(r#"{"model":"m","response":"","done":true,"total_duration":1}"#).unwrap();
        assert!(parsed.done);
    }

    #[test]
    fn error_line() {
        assert!(parse_ollama_line(r#"{"error":"model not found"}"#).is_err());
    }

    #[test]
    fn rejects_foreign_config() {
        let config = LlmConfig::default();
        assert!(OllamaClient::from_config(&config).is_err());
    }
}
