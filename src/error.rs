use axum::{ http::StatusCode, response::{ IntoResponse, Response }, Json };
use std::error::Error as StdError;
use thiserror::Error;

use crate::models::chat::ErrorBody;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Formats an error with every `source()` below it, for server-side logs.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        current = cause.source();
    }
    out
}

/// Failures of the relay endpoint and its provider adapters.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider error: {message}")]
    Provider {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("provider returned HTTP {status}: {body}")]
    ProviderStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("stream ended before the provider signalled completion")]
    StreamInterrupted,

    #[error("too many requests")]
    RateLimited,

    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn provider(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RelayError::Provider { message: message.into(), source: Some(source.into()) }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short description that is safe to hand to a browser. Provider bodies and
    /// source chains stay in the server log.
    pub fn summary(&self) -> String {
        match self {
            RelayError::InvalidRequest(detail) => detail.clone(),
            RelayError::Provider { message, .. } => message.clone(),
            RelayError::ProviderStatus { status, .. } => {
                format!("provider responded with status {}", status.as_u16())
            }
            RelayError::StreamInterrupted => "provider stream interrupted".to_string(),
            RelayError::RateLimited => "rate limit exceeded".to_string(),
            RelayError::Config(_) => "relay misconfigured".to_string(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            RelayError::InvalidRequest(detail) if detail == NO_MESSAGES => {
                ErrorBody { error: NO_MESSAGES.to_string(), details: None }
            }
            RelayError::InvalidRequest(detail) => {
                ErrorBody { error: "Invalid request".to_string(), details: Some(detail.clone()) }
            }
            RelayError::RateLimited => {
                ErrorBody { error: "Too many requests".to_string(), details: None }
            }
            other => {
                ErrorBody { error: "An error occurred".to_string(), details: Some(other.summary()) }
            }
        }
    }
}

pub const NO_MESSAGES: &str = "No messages provided";

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

/// Failures seen by the chat session controller, plus rejected intents.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("relay rejected the request: {0}")]
    InvalidRequest(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("stream closed before completion")]
    StreamInterrupted,

    #[error("no data received for {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("message is empty")]
    EmptyInput,

    #[error("a response is still streaming")]
    Busy,

    #[error("there is no failed request to retry")]
    NothingToRetry,

    #[error("message {0} cannot be edited")]
    InvalidEdit(usize),

    #[error("chat session has shut down")]
    Closed,
}

impl SessionError {
    /// Whether this error ends a turn (as opposed to a rejected intent).
    pub fn is_stream_failure(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidRequest(_)
                | SessionError::Provider(_)
                | SessionError::StreamInterrupted
                | SessionError::Timeout(_)
                | SessionError::Transport(_)
                | SessionError::Frame(_)
        )
    }

    /// Text shown next to the retry affordance.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::InvalidRequest(detail) => format!("Request rejected: {}", detail),
            SessionError::Timeout(_) => "The response timed out".to_string(),
            _ if self.is_stream_failure() => "An error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_conversation_maps_to_400() {
        let err = RelayError::InvalidRequest(NO_MESSAGES.to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.body(), ErrorBody { error: NO_MESSAGES.into(), details: None });
    }

    #[test]
    fn provider_status_hides_body() {
        let err = RelayError::ProviderStatus {
            status: reqwest::StatusCode::UNAUTHORIZED,
            body: "{\"error\":\"API key not valid. key=secret\"}".into(),
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = err.body();
        assert_eq!(body.error, "An error occurred");
        let details = body.details.unwrap();
        assert!(details.contains("401"));
        assert!(!details.contains("secret"));
    }

    #[test]
    fn rate_limit_maps_to_429() {
        assert_eq!(RelayError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn interrupted_stream_reads_as_generic_error() {
        assert!(SessionError::StreamInterrupted.is_stream_failure());
        assert_eq!(SessionError::StreamInterrupted.user_message(), "An error occurred");
        assert!(!SessionError::Busy.is_stream_failure());
    }
}
