//! Client-side chat session: the message list, the Idle/Streaming/Error state
//! machine, and the per-turn bookkeeping that retry and abort rely on.
//!
//! [`Session`] is synchronous and owns no I/O. [`controller`] drives it from a
//! single task and [`transport`] talks to the relay.

pub mod controller;
pub mod transport;

use bytes::Bytes;
use log::debug;
use uuid::Uuid;

use crate::error::SessionError;
use crate::models::chat::{ Message, RequestEnvelope, Role };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Error,
}

/// Everything the presentation layer needs to render the chat panel. The
/// system message is never part of `messages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub messages: Vec<Message>,
    pub state: SessionState,
    pub editing_index: Option<usize>,
    pub open: bool,
    pub last_error: Option<String>,
}

impl SessionView {
    pub fn can_submit(&self) -> bool {
        self.state != SessionState::Streaming
    }
}

/// A request ready for the transport. `body` is the serialized envelope and is
/// reused as-is on retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub turn: u64,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
struct PendingTurn {
    body: Bytes,
    assistant_id: Uuid,
}

#[derive(Debug)]
pub struct Session {
    messages: Vec<Message>,
    state: SessionState,
    editing_index: Option<usize>,
    open: bool,
    last_error: Option<String>,
    turn: u64,
    pending: Option<PendingTurn>,
}

impl Session {
    pub fn new(system_prompt: Option<String>) -> Self {
        let messages = system_prompt
            .filter(|p| !p.trim().is_empty())
            .map(Message::system)
            .into_iter()
            .collect();

        Self {
            messages,
            state: SessionState::Idle,
            editing_index: None,
            open: false,
            last_error: None,
            turn: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Full conversation, system message included.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            messages: self.messages[self.hidden()..].to_vec(),
            state: self.state,
            editing_index: self.editing_index,
            open: self.open,
            last_error: self.last_error.clone(),
        }
    }

    fn hidden(&self) -> usize {
        match self.messages.first() {
            Some(m) if m.role == Role::System => 1,
            _ => 0,
        }
    }

    /// Appends the user message and an empty assistant message and returns the
    /// request for the new turn. A turn still streaming is abandoned first.
    pub fn submit(&mut self, text: &str) -> Result<OutboundRequest, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyInput);
        }
        if self.abort() {
            debug!("Submission while streaming; turn {} abandoned", self.turn);
        }

        self.messages.push(Message::user(text));
        let envelope = RequestEnvelope::from_messages(&self.messages);
        let body = Bytes::from(
            serde_json::to_vec(&envelope).map_err(|e| SessionError::Frame(e.to_string()))?
        );

        let placeholder = Message::assistant("");
        let assistant_id = placeholder.id;
        self.messages.push(placeholder);

        self.pending = Some(PendingTurn { body, assistant_id });
        Ok(self.begin_turn())
    }

    /// Re-issues the last request that did not complete, streaming into the
    /// same assistant message from scratch.
    pub fn retry(&mut self) -> Result<OutboundRequest, SessionError> {
        if self.state == SessionState::Streaming {
            return Err(SessionError::Busy);
        }
        let pending = self.pending.clone().ok_or(SessionError::NothingToRetry)?;
        if let Some(msg) = self.messages.iter_mut().find(|m| m.id == pending.assistant_id) {
            msg.content.clear();
        }
        Ok(self.begin_turn())
    }

    fn begin_turn(&mut self) -> OutboundRequest {
        self.turn += 1;
        self.state = SessionState::Streaming;
        self.last_error = None;
        self.editing_index = None;
        let body = self.pending
            .as_ref()
            .map(|p| p.body.clone())
            .unwrap_or_default();
        OutboundRequest { turn: self.turn, body }
    }

    fn is_live(&self, turn: u64) -> bool {
        self.state == SessionState::Streaming && turn == self.turn
    }

    /// Appends a chunk to the streaming assistant message. Chunks for any turn
    /// other than the live one are dropped; returns whether it was applied.
    pub fn apply_chunk(&mut self, turn: u64, text: &str) -> bool {
        if !self.is_live(turn) {
            return false;
        }
        let Some(id) = self.pending.as_ref().map(|p| p.assistant_id) else {
            return false;
        };
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(msg) => {
                msg.content.push_str(text);
                true
            }
            None => false,
        }
    }

    pub fn complete(&mut self, turn: u64) -> bool {
        if !self.is_live(turn) {
            return false;
        }
        self.state = SessionState::Idle;
        self.pending = None;
        true
    }

    pub fn fail(&mut self, turn: u64, err: &SessionError) -> bool {
        if !self.is_live(turn) {
            return false;
        }
        self.state = SessionState::Error;
        self.last_error = Some(err.user_message());
        true
    }

    /// Stops the live turn, keeping whatever content arrived. Returns false
    /// when nothing was streaming.
    pub fn abort(&mut self) -> bool {
        if self.state != SessionState::Streaming {
            return false;
        }
        self.state = SessionState::Idle;
        true
    }

    fn user_message_index(&self, index: usize) -> Result<usize, SessionError> {
        if self.state == SessionState::Streaming {
            return Err(SessionError::Busy);
        }
        let absolute = index + self.hidden();
        match self.messages.get(absolute) {
            Some(m) if m.role == Role::User => Ok(absolute),
            _ => Err(SessionError::InvalidEdit(index)),
        }
    }

    pub fn start_edit(&mut self, index: usize) -> Result<(), SessionError> {
        self.user_message_index(index)?;
        self.editing_index = Some(index);
        Ok(())
    }

    pub fn cancel_edit(&mut self) {
        self.editing_index = None;
    }

    /// Replaces the content of the user message at `index` (counted over the
    /// visible messages). Nothing is re-sent and later replies stay as they are.
    pub fn edit(&mut self, index: usize, text: &str) -> Result<(), SessionError> {
        let absolute = self.user_message_index(index)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyInput);
        }
        self.messages[absolute].content = text.to_string();
        self.editing_index = None;
        Ok(())
    }

    pub fn open(&mut self) {
        self.open = true;
    }

    pub fn close(&mut self) {
        self.open = false;
    }
}
