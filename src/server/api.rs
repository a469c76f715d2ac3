use std::convert::Infallible;
use std::sync::Arc;
use axum::{
    body::Bytes,
    extract::State,
    response::{ sse::{ Event, KeepAlive, Sse }, IntoResponse, Response },
    routing::{ get, post },
    Json,
    Router,
};
use futures::{ stream, Stream, StreamExt };
use governor::{ DefaultDirectRateLimiter, Quota, RateLimiter };
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use log::{ debug, error, info, warn };

use crate::config::RelayConfig;
use crate::error::{ error_chain, RelayError, NO_MESSAGES };
use crate::llm::chat::{ ChatClient, ChunkStream };
use crate::models::chat::{ ChunkFrame, DoneFrame, ErrorBody, RequestEnvelope, Role, WireMessage };

#[derive(Clone)]
pub struct AppState {
    chat_client: Arc<dyn ChatClient>,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl AppState {
    pub fn new(chat_client: Arc<dyn ChatClient>, config: &RelayConfig) -> Self {
        Self::with_quota(chat_client, Quota::per_second(config.rate_limit_per_second))
    }

    pub fn with_quota(chat_client: Arc<dyn ChatClient>, quota: Quota) -> Self {
        Self {
            chat_client,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    provider: String,
    model: String,
}

#[derive(Deserialize)]
struct LooseEnvelope {
    #[serde(default)]
    messages: Option<Vec<WireMessage>>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

/// Validates a raw request body. Missing, null and empty message lists all
/// read as "no messages"; anything else that fails to decode is malformed.
pub fn parse_envelope(body: &[u8]) -> Result<RequestEnvelope, RelayError> {
    let loose: LooseEnvelope = serde_json::from_slice(body).map_err(|e|
        RelayError::InvalidRequest(format!("malformed conversation: {}", e))
    )?;

    let messages = match loose.messages {
        Some(messages) if !messages.is_empty() => messages,
        _ => {
            return Err(RelayError::InvalidRequest(NO_MESSAGES.to_string()));
        }
    };

    // providers refuse a request with nothing but instructions in it
    let has_turn = messages.iter().any(|m| m.role != Role::System && !m.content.trim().is_empty());
    if !has_turn {
        return Err(RelayError::InvalidRequest("conversation has no user or assistant content".to_string()));
    }

    Ok(RequestEnvelope { messages })
}

async fn chat_handler(State(state): State<AppState>, body: Bytes) -> Result<Response, RelayError> {
    if state.limiter.check().is_err() {
        warn!("Relay rate limit exceeded. Rejecting request.");
        return Err(RelayError::RateLimited);
    }

    let envelope = parse_envelope(&body).map_err(|e| {
        info!("Rejected chat request: {}", e);
        e
    })?;

    info!(
        "Relaying conversation: messages={} provider={} model={} encoding={}",
        envelope.messages.len(),
        state.chat_client.get_llm_type(),
        state.chat_client.get_model(),
        if state.chat_client.supports_structured_messages() { "structured" } else { "flattened" }
    );

    let chunks = state.chat_client.stream_chat(&envelope.messages).await.map_err(|e| {
        error!("Provider call failed before streaming: {}", error_chain(&e));
        e
    })?;

    Ok(Sse::new(relay_events(chunks)).keep_alive(KeepAlive::default()).into_response())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        provider: state.chat_client.get_llm_type().to_string(),
        model: state.chat_client.get_model(),
    })
}

fn frame<T: Serialize>(name: &str, payload: &T) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(name).data(data)
}

/// Maps provider chunks to SSE frames one for one. A clean end adds `done`;
/// a failure adds `error` and ends the stream without `done`.
fn relay_events(chunks: ChunkStream) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold(Some((chunks, 0usize)), |state| async move {
        let (mut chunks, forwarded) = state?;
        match chunks.next().await {
            Some(Ok(text)) => {
                let event = frame("chunk", &ChunkFrame { text });
                Some((Ok(event), Some((chunks, forwarded + 1))))
            }
            Some(Err(e)) => {
                error!("Provider stream failed after {} chunks: {}", forwarded, error_chain(&e));
                let body = ErrorBody { error: e.summary(), details: None };
                Some((Ok(frame("error", &body)), None))
            }
            None => {
                debug!("Provider stream finished after {} chunks", forwarded);
                let done = DoneFrame { finish_reason: "stop".to_string() };
                Some((Ok(frame("done", &done)), None))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{ to_bytes, Body };
    use axum::http::{ header, Request, StatusCode };
    use std::num::NonZeroU32;
    use std::sync::Mutex;
    use tower::ServiceExt;

    use crate::llm::LlmType;

    #[derive(Clone, Copy)]
    enum Step {
        Text(&'static str),
        Fail,
    }

    struct StubClient {
        script: Vec<Step>,
        fail_setup: bool,
        calls: Mutex<Vec<Vec<WireMessage>>>,
    }

    impl StubClient {
        fn new(script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self { script, fail_setup: false, calls: Mutex::new(Vec::new()) })
        }

        fn failing_setup() -> Arc<Self> {
            Arc::new(Self { script: vec![], fail_setup: true, calls: Mutex::new(Vec::new()) })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatClient for StubClient {
        async fn stream_chat(&self, messages: &[WireMessage]) -> Result<ChunkStream, RelayError> {
            self.calls.lock().unwrap().push(messages.to_vec());
            if self.fail_setup {
                return Err(RelayError::ProviderStatus {
                    status: reqwest::StatusCode::UNAUTHORIZED,
                    body: "API key not valid".into(),
                });
            }
            let items: Vec<Result<String, RelayError>> = self.script
                .iter()
                .map(|step| match step {
                    Step::Text(t) => Ok(t.to_string()),
                    Step::Fail => Err(RelayError::StreamInterrupted),
                })
                .collect();
            Ok(Box::pin(stream::iter(items)))
        }

        fn get_model(&self) -> String {
            "stub-model".into()
        }

        fn get_base_url(&self) -> Option<String> {
            None
        }

        fn get_llm_type(&self) -> LlmType {
            LlmType::Gemini
        }
    }

    fn app(client: Arc<StubClient>) -> Router {
        let quota = Quota::per_second(NonZeroU32::new(100).unwrap());
        router(AppState::with_quota(client, quota))
    }

    fn post_chat(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn empty_conversation_is_rejected_without_provider_call() {
        let client = StubClient::new(vec![Step::Text("never")]);
        let resp = app(client.clone()).oneshot(post_chat(r#"{"messages":[]}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body.error, "No messages provided");
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_messages_field_is_rejected() {
        let client = StubClient::new(vec![]);
        let resp = app(client.clone()).oneshot(post_chat("{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_message_is_rejected() {
        let client = StubClient::new(vec![]);
        let resp = app(client.clone())
            .oneshot(post_chat(r#"{"messages":[{"role":"user"}]}"#)).await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body.error, "Invalid request");
        assert!(body.details.is_some());
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn system_only_conversation_is_rejected() {
        let client = StubClient::new(vec![Step::Text("never")]);
        let body = r#"{"messages":[{"role":"system","content":"be brief"},{"role":"user","content":"  "}]}"#;
        let resp = app(client.clone()).oneshot(post_chat(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body.error, "Invalid request");
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn non_json_body_is_rejected() {
        let client = StubClient::new(vec![]);
        let resp = app(client.clone()).oneshot(post_chat("hello")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn chunks_are_streamed_in_order_then_done() {
        let client = StubClient::new(vec![Step::Text("Hel"), Step::Text("lo")]);
        let resp = app(client.clone())
            .oneshot(post_chat(r#"{"messages":[{"role":"user","content":"Hi"}]}"#)).await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let text = body_text(resp).await;
        let first = text.find("event: chunk\ndata: {\"text\":\"Hel\"}").unwrap();
        let second = text.find("event: chunk\ndata: {\"text\":\"lo\"}").unwrap();
        let done = text.find("event: done").unwrap();
        assert!(first < second && second < done);

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![WireMessage { role: Role::User, content: "Hi".into() }]);
    }

    #[tokio::test]
    async fn setup_failure_is_500_with_details() {
        let client = StubClient::failing_setup();
        let resp = app(client)
            .oneshot(post_chat(r#"{"messages":[{"role":"user","content":"Hi"}]}"#)).await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body.error, "An error occurred");
        assert!(body.details.unwrap().contains("401"));
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_frame() {
        let client = StubClient::new(vec![Step::Text("partial"), Step::Fail, Step::Text("lost")]);
        let resp = app(client)
            .oneshot(post_chat(r#"{"messages":[{"role":"user","content":"Hi"}]}"#)).await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("partial"));
        assert!(text.contains("event: error"));
        assert!(!text.contains("lost"));
        assert!(!text.contains("event: done"));
    }

    #[tokio::test]
    async fn rate_limit_rejects_excess_requests() {
        let client = StubClient::new(vec![]);
        let quota = Quota::per_second(NonZeroU32::new(1).unwrap());
        let app = router(AppState::with_quota(client, quota));
        let body = r#"{"messages":[{"role":"user","content":"Hi"}]}"#;

        let first = app.clone().oneshot(post_chat(body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(post_chat(body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn health_reports_provider() {
        let client = StubClient::new(vec![]);
        let req = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let resp = app(client).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["provider"], "gemini");
        assert_eq!(json["model"], "stub-model");
    }
}
