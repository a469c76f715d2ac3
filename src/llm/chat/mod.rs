pub mod gemini;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{ stream, Stream, StreamExt };
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use super::{ LlmConfig, LlmType };
use self::gemini::GeminiChatClient;
use self::ollama::OllamaClient;
use self::openai::OpenAIChatClient;
use crate::error::RelayError;
use crate::models::chat::{ Role, WireMessage };
use reqwest::{ Client as HttpClient, RequestBuilder };

/// Lazy, finite, non-restartable sequence of generated text. Dropping it
/// closes the provider connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Opens a streaming generation call for the conversation. Errors returned
    /// here happen before any output exists; errors inside the stream happen
    /// after output may already have been forwarded.
    async fn stream_chat(&self, messages: &[WireMessage]) -> Result<ChunkStream, RelayError>;

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> Option<String>;
    fn get_llm_type(&self) -> LlmType;

    /// Whether the conversation is sent as a message list rather than one
    /// flattened prompt.
    fn supports_structured_messages(&self) -> bool {
        true
    }
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, RelayError> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Gemini => {
            let specific_client = GeminiChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::Ollama => {
            let specific_client = OllamaClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}

pub(crate) fn build_http_client(connect_timeout: Duration) -> Result<HttpClient, RelayError> {
    HttpClient::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Renders a conversation as a plain transcript for completion-style
/// endpoints, ending with an open assistant turn.
pub fn format_conversation_for_prompt(messages: &[WireMessage]) -> String {
    let mut result = String::new();
    for msg in messages {
        if msg.content.is_empty() {
            continue;
        }
        let role_display = match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        result.push_str(&format!("{}: {}\n", role_display, msg.content));
    }
    result.push_str("Assistant:");
    result
}

/// What one provider line contributed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedLine {
    pub text: Option<String>,
    pub done: bool,
}

impl ParsedLine {
    pub fn skip() -> Self {
        Self::default()
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), done: false }
    }

    pub fn done() -> Self {
        Self { text: None, done: true }
    }

    pub fn finished(mut self, done: bool) -> Self {
        self.done = done;
        self
    }
}

pub type LineParser = fn(&str) -> Result<ParsedLine, RelayError>;

/// Payload of an SSE `data:` line, or `None` for comments, event names and
/// anything else.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|d| d.trim_start())
}

pub async fn http_stream_generate(
    request: RequestBuilder,
    line_parser: LineParser,
) -> Result<ChunkStream, RelayError> {
    let resp = request
        .send().await
        .map_err(|e| RelayError::provider("failed to reach provider", e))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(RelayError::ProviderStatus { status, body });
    }

    Ok(decode_lines(resp.bytes_stream(), line_parser))
}

struct LineState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    eof: bool,
    finished: bool,
}

/// Splits a byte stream into lines and runs each through `line_parser`.
/// Lines may straddle network chunks; UTF-8 is decoded per complete line. A
/// byte stream that ends before the parser reports completion yields
/// `StreamInterrupted`.
pub fn decode_lines<S, E>(bytes: S, line_parser: LineParser) -> ChunkStream
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static
{
    let state = LineState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        eof: false,
        finished: false,
    };

    Box::pin(
        stream::unfold(state, move |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }

                if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                    match parse_line(&line, line_parser) {
                        Ok(parsed) => {
                            state.finished = parsed.done;
                            if let Some(text) = parsed.text.filter(|t| !t.is_empty()) {
                                return Some((Ok(text), state));
                            }
                            continue;
                        }
                        Err(e) => {
                            state.finished = true;
                            return Some((Err(e), state));
                        }
                    }
                }

                if state.eof {
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                        continue;
                    }
                    state.finished = true;
                    return Some((Err(RelayError::StreamInterrupted), state));
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(RelayError::provider("provider stream failed", e)), state));
                    }
                    None => {
                        state.eof = true;
                    }
                }
            }
        })
    )
}

fn parse_line(raw: &[u8], line_parser: LineParser) -> Result<ParsedLine, RelayError> {
    let line = std::str::from_utf8(raw).map_err(|e|
        RelayError::provider("provider sent invalid UTF-8", e)
    )?;
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return Ok(ParsedLine::skip());
    }
    line_parser(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn plain(line: &str) -> Result<ParsedLine, RelayError> {
        if line == "END" {
            return Ok(ParsedLine::done());
        }
        if line == "BOOM" {
            return Err(RelayError::Provider { message: "boom".into(), source: None });
        }
        Ok(ParsedLine::text(line))
    }

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        let owned: Vec<Result<Bytes, Infallible>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        stream::iter(owned)
    }

    async fn collect(stream: ChunkStream) -> Vec<Result<String, RelayError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_joined() {
        let out = collect(decode_lines(chunks(&[b"Hel", b"lo\nwor", b"ld\nEND\n"]), plain)).await;
        let texts: Vec<String> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["Hello".to_string(), "world".to_string()]);
    }

    #[tokio::test]
    async fn multibyte_char_split_across_chunks() {
        let snowman = "\u{2603}".as_bytes();
        let second = [&snowman[1..], b"\nEND\n".as_slice()].concat();
        let out = collect(decode_lines(chunks(&[&snowman[..1], second.as_slice()]), plain)).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap(), "\u{2603}");
    }

    #[tokio::test]
    async fn close_without_done_is_interrupted() {
        let out = collect(decode_lines(chunks(&[b"partial\n"]), plain)).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), "partial");
        assert!(matches!(out[1], Err(RelayError::StreamInterrupted)));
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_parsed() {
        let out = collect(decode_lines(chunks(&[b"a\nEND"]), plain)).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap(), "a");
    }

    #[tokio::test]
    async fn nothing_after_done_is_read() {
        let out = collect(decode_lines(chunks(&[b"a\nEND\nignored\n"]), plain)).await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn parser_error_terminates() {
        let out = collect(decode_lines(chunks(&[b"a\nBOOM\nb\nEND\n"]), plain)).await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
    }

    #[test]
    fn transcript_ends_with_open_assistant_turn() {
        let msgs = vec![
            WireMessage { role: Role::System, content: "Be brief.".into() },
            WireMessage { role: Role::User, content: "Hi".into() },
            WireMessage { role: Role::Assistant, content: "".into() },
        ];
        assert_eq!(
            format_conversation_for_prompt(&msgs),
            "System: Be brief.\nUser: Hi\nAssistant:"
        );
    }

    #[test]
    fn sse_data_prefix() {
        assert_eq!(sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data(": keep-alive"), None);
        assert_eq!(sse_data("event: message"), None);
    }
}
