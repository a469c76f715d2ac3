use async_trait::async_trait;
use log::info;
use reqwest::{ Client as HttpClient, header::AUTHORIZATION };
use serde::{ Deserialize, Serialize };

use super::{ build_http_client, http_stream_generate, sse_data, ChatClient, ChunkStream, ParsedLine };
use crate::error::RelayError;
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::WireMessage;

const DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o";

pub struct OpenAIChatClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIMessage<'a> {
    role: String,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    error: Option<OpenAIError>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIDelta,
    #[serde(rename = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIError {
    message: String,
}

fn parse_openai_line(line: &str) -> Result<ParsedLine, RelayError> {
    let Some(data) = sse_data(line) else {
        return Ok(ParsedLine::skip());
    };
    if data == "[DONE]" {
        return Ok(ParsedLine::done());
    }

    let resp: OpenAIStreamResponse = serde_json::from_str(data).map_err(|e|
        RelayError::provider("unreadable OpenAI stream chunk", e)
    )?;

    if let Some(err) = resp.error {
        return Err(RelayError::Provider { message: err.message, source: None });
    }

    let mut text = String::new();
    let mut done = false;
    for choice in resp.choices {
        if let Some(content) = choice.delta.content {
            text.push_str(&content);
        }
        if choice.finish_reason.is_some() {
            done = true;
        }
    }

    Ok(ParsedLine::text(text).finished(done))
}

impl OpenAIChatClient {
    pub fn new(
        http: HttpClient,
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        let chat_model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let api_url = base_url.unwrap_or_else(|| DEFAULT_URL.to_string());

        Self {
            http,
            api_key,
            model: chat_model,
            base_url: api_url,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, RelayError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RelayError::Config("OpenAI API key is required".into()))?;
        let http = build_http_client(config.connect_timeout)?;

        Ok(Self::new(http, api_key, config.completion_model.clone(), config.base_url.clone()))
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_chat(&self, messages: &[WireMessage]) -> Result<ChunkStream, RelayError> {
        let url = self.base_url.trim_end_matches('/');
        info!("OpenAIChatClient::stream_chat() → model={} messages={}", self.model, messages.len());

        let req = OpenAIChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .filter(|m| !m.content.is_empty())
                .map(|m| OpenAIMessage { role: m.role.to_string(), content: &m.content })
                .collect(),
            stream: true,
        };

        let request = self.http
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&req);

        http_stream_generate(request, parse_openai_line).await
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }

    fn get_llm_type(&self) -> LlmType {
        LlmType::OpenAI
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_content_is_text() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        assert_eq!(parse_openai_line(line).unwrap(), ParsedLine::text("Hi"));
    }

    #[test]
    fn done_sentinel() {
        assert_eq!(parse_openai_line("data: [DONE]").unwrap(), ParsedLine::done());
    }

    #[test]
    fn finish_reason_ends_stream() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let parsed = parse_openai_line(line).unwrap();
        assert!(parsed.done);
        assert_eq!(parsed.text.as_deref(), Some(""));
    }

    #[test]
    fn garbage_data_is_an_error() {
        assert!(parse_openai_line("data: {not json").is_err());
    }
}
