//! Client side of the relay wire protocol.
//!
//! The relay answers `POST /api/chat` with a `text/event-stream` body made of
//! `chunk` frames, then exactly one `done` or `error` frame. Anything that ends
//! the body before one of those two is an interrupted stream.

use std::error::Error as StdError;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{ self, Stream, StreamExt, TryStreamExt };
use log::debug;
use reqwest::{ header::{ ACCEPT, CONTENT_TYPE }, Client as HttpClient, StatusCode };
use url::Url;

use crate::error::SessionError;
use crate::models::chat::{ ChunkFrame, ErrorBody };

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Done,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, SessionError>> + Send>>;

/// Opens one relay request per call. The request is issued when the returned
/// stream is first polled; dropping the stream cancels it.
pub trait ChatTransport: Send + Sync + 'static {
    fn open(&self, body: Bytes) -> EventStream;
}

pub struct HttpTransport {
    http: HttpClient,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Self, SessionError> {
        let endpoint = Url::parse(endpoint).map_err(|e|
            SessionError::InvalidRequest(format!("invalid relay endpoint '{}': {}", endpoint, e))
        )?;
        let http = HttpClient::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl ChatTransport for HttpTransport {
    fn open(&self, body: Bytes) -> EventStream {
        let request = self.http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .body(body);

        let response = async move {
            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(error_for_status(status, resp.json::<ErrorBody>().await.ok()));
            }
            Ok::<EventStream, SessionError>(decode_frames(resp.bytes_stream()))
        };

        Box::pin(stream::once(response).try_flatten())
    }
}

fn error_for_status(status: StatusCode, body: Option<ErrorBody>) -> SessionError {
    let message = body
        .map(|b| b.details.unwrap_or(b.error))
        .unwrap_or_else(|| status.to_string());
    if status == StatusCode::BAD_REQUEST {
        SessionError::InvalidRequest(message)
    } else {
        SessionError::Provider(message)
    }
}

struct FrameState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    finished: bool,
}

/// Turns a relay response body into stream events.
pub fn decode_frames<S, E>(bytes: S) -> EventStream
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static
{
    let state = FrameState { bytes: Box::pin(bytes), buffer: Vec::new(), finished: false };

    Box::pin(
        stream::unfold(state, |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }

                if let Some(block) = take_block(&mut state.buffer) {
                    match parse_block(&block) {
                        Ok(None) => continue,
                        Ok(Some(StreamEvent::Done)) => {
                            state.finished = true;
                            return Some((Ok(StreamEvent::Done), state));
                        }
                        Ok(Some(event)) => return Some((Ok(event), state)),
                        Err(e) => {
                            state.finished = true;
                            return Some((Err(e), state));
                        }
                    }
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        debug!("Relay body failed: {}", e);
                        state.finished = true;
                        return Some((Err(SessionError::StreamInterrupted), state));
                    }
                    None => {
                        state.finished = true;
                        return Some((Err(SessionError::StreamInterrupted), state));
                    }
                }
            }
        })
    )
}

/// Removes one blank-line-terminated block from the front of the buffer.
/// Lines may end in `\n` or `\r\n`.
fn take_block(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let mut line_start = 0;
    let mut end = None;
    for (i, byte) in buffer.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &buffer[line_start..i];
        if line.is_empty() || line == b"\r" {
            end = Some(i);
            break;
        }
        line_start = i + 1;
    }
    let end = end?;
    Some(buffer.drain(..=end).collect())
}

fn parse_block(block: &[u8]) -> Result<Option<StreamEvent>, SessionError> {
    let text = std::str::from_utf8(block).map_err(|e| SessionError::Frame(e.to_string()))?;

    let mut event = None;
    let mut data = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    let data = data.join("\n");

    match event {
        Some("chunk") => {
            let frame: ChunkFrame = serde_json::from_str(&data).map_err(|e|
                SessionError::Frame(format!("bad chunk frame: {}", e))
            )?;
            Ok(Some(StreamEvent::Chunk(frame.text)))
        }
        Some("done") => Ok(Some(StreamEvent::Done)),
        Some("error") => {
            let message = serde_json::from_str::<ErrorBody>(&data)
                .map(|b| b.error)
                .unwrap_or(data);
            Err(SessionError::Provider(message))
        }
        // keep-alive comments and unknown events
        _ => Ok(None),
    }
}
