use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use log::info;
use reqwest::Client as HttpClient;
use url::Url;

use super::{ build_http_client, http_stream_generate, sse_data, ChatClient, ChunkStream, ParsedLine };
use crate::error::RelayError;
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::{ Role, WireMessage };

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
}

#[derive(Serialize, Debug)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Debug)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GoogleChunk {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    error: Option<GoogleError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCandidate {
    content: Option<GoogleContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GoogleError {
    message: String,
}

fn build_request(messages: &[WireMessage]) -> GeminiStreamRequest {
    let system_text = messages
        .iter()
        .filter(|m| m.role == Role::System && !m.content.is_empty())
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let system_instruction = if system_text.is_empty() {
        None
    } else {
        Some(GeminiContent { role: None, parts: vec![GeminiPart { text: system_text }] })
    };

    let contents = messages
        .iter()
        .filter(|m| m.role != Role::System && !m.content.is_empty())
        .map(|m| GeminiContent {
            role: Some(if m.role == Role::Assistant { "model" } else { "user" }),
            parts: vec![GeminiPart { text: m.content.clone() }],
        })
        .collect();

    GeminiStreamRequest { contents, system_instruction }
}

fn parse_gemini_line(line: &str) -> Result<ParsedLine, RelayError> {
    let Some(data) = sse_data(line) else {
        return Ok(ParsedLine::skip());
    };

    let chunk: GoogleChunk = serde_json::from_str(data).map_err(|e|
        RelayError::provider("unreadable Gemini stream chunk", e)
    )?;

    if let Some(err) = chunk.error {
        return Err(RelayError::Provider { message: err.message, source: None });
    }

    let Some(candidate) = chunk.candidates.into_iter().next() else {
        return Ok(ParsedLine::skip());
    };

    let text: String = candidate.content
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();

    Ok(ParsedLine { text: Some(text), done: candidate.finish_reason.is_some() })
}

pub struct GeminiChatClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiChatClient {
    pub fn new(
        http: HttpClient,
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        let chat_model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Self {
            http,
            api_key,
            model: chat_model,
            base_url,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, RelayError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RelayError::Config("Google API key is required for GeminiChatClient".into()))?;
        let http = build_http_client(config.connect_timeout)?;

        Ok(Self::new(http, api_key, config.completion_model.clone(), config.base_url.clone()))
    }

    fn stream_url(&self) -> Result<Url, RelayError> {
        let raw = format!(
            "{}/models/{}:streamGenerateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let mut url = Url::parse(&raw).map_err(|e|
            RelayError::Config(format!("invalid Gemini URL '{}': {}", raw, e))
        )?;
        url.query_pairs_mut().append_pair("alt", "sse");
        Ok(url)
    }
}

#[async_trait]
impl ChatClient for GeminiChatClient {
    async fn stream_chat(&self, messages: &[WireMessage]) -> Result<ChunkStream, RelayError> {
        let url = self.stream_url()?;
        info!(
            "GeminiChatClient::stream_chat() → model={} messages={} url={}",
            self.model,
            messages.len(),
            url
        );

        let payload = build_request(messages);
        let request = self.http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload);

        http_stream_generate(request, parse_gemini_line).await
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }

    fn get_llm_type(&self) -> LlmType {
        LlmType::Gemini
    }
}
