//! Single-task driver for a [`Session`].
//!
//! The controller task owns the session and at most one open event stream. It
//! waits on user intents and the next stream event at the same time, so an
//! abort is handled while a chunk is still pending, and stream events are
//! applied one at a time in arrival order.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{ debug, info, warn };
use tokio::sync::{ mpsc, oneshot, watch };
use tokio::time::Instant;

use super::transport::{ ChatTransport, EventStream, StreamEvent };
use super::{ OutboundRequest, Session, SessionView };
use crate::error::SessionError;

type Reply = oneshot::Sender<Result<(), SessionError>>;

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub system_prompt: Option<String>,
    /// Longest wait for the next stream event before the turn fails.
    pub chunk_timeout: Option<Duration>,
}

enum Intent {
    Submit(String, Reply),
    Abort(Reply),
    Retry(Reply),
    StartEdit(usize, Reply),
    CancelEdit(Reply),
    Edit(usize, String, Reply),
    Open(Reply),
    Close(Reply),
}

struct ActiveStream {
    turn: u64,
    events: EventStream,
    deadline: Option<Instant>,
}

enum StreamOutcome {
    Event(Option<Result<StreamEvent, SessionError>>),
    TimedOut,
}

enum Action {
    Intent(Option<Intent>),
    Stream(StreamOutcome),
}

pub struct ChatController {
    session: Session,
    transport: Arc<dyn ChatTransport>,
    chunk_timeout: Option<Duration>,
    active: Option<ActiveStream>,
    intents: mpsc::Receiver<Intent>,
    views: watch::Sender<SessionView>,
}

impl ChatController {
    /// Starts the controller task. It runs until every handle is dropped.
    pub fn spawn(transport: Arc<dyn ChatTransport>, config: SessionConfig) -> SessionHandle {
        let session = Session::new(config.system_prompt);
        let (intent_tx, intent_rx) = mpsc::channel(32);
        let (view_tx, view_rx) = watch::channel(session.view());

        let controller = ChatController {
            session,
            transport,
            chunk_timeout: config.chunk_timeout,
            active: None,
            intents: intent_rx,
            views: view_tx,
        };
        tokio::spawn(controller.run());

        SessionHandle { intents: intent_tx, views: view_rx }
    }

    async fn run(mut self) {
        loop {
            let action = tokio::select! {
                intent = self.intents.recv() => Action::Intent(intent),
                outcome = next_event(&mut self.active), if self.active.is_some() => {
                    Action::Stream(outcome)
                }
            };

            match action {
                Action::Intent(Some(intent)) => self.handle_intent(intent),
                Action::Intent(None) => break,
                Action::Stream(outcome) => self.handle_stream(outcome),
            }
        }
        debug!("Chat controller stopped");
    }

    fn publish(&self) {
        self.views.send_replace(self.session.view());
    }

    fn start(&mut self, request: OutboundRequest) {
        debug!("Opening relay stream for turn {} ({} bytes)", request.turn, request.body.len());
        // replacing the previous stream drops it, which closes its connection
        self.active = Some(ActiveStream {
            turn: request.turn,
            events: self.transport.open(request.body),
            deadline: self.chunk_timeout.map(|d| Instant::now() + d),
        });
    }

    fn handle_intent(&mut self, intent: Intent) {
        let (result, reply) = match intent {
            Intent::Submit(text, reply) => {
                let streaming = self.active.is_some();
                let result = self.session.submit(&text).map(|request| {
                    if streaming {
                        info!("New submission while streaming; cancelling the previous turn");
                    }
                    self.start(request);
                });
                (result, reply)
            }
            Intent::Abort(reply) => {
                if self.session.abort() {
                    info!("Turn {} aborted by user", self.session.turn());
                }
                self.active = None;
                (Ok(()), reply)
            }
            Intent::Retry(reply) => {
                let result = self.session.retry().map(|request| {
                    info!("Retrying last request as turn {}", request.turn);
                    self.start(request);
                });
                (result, reply)
            }
            Intent::StartEdit(index, reply) => (self.session.start_edit(index), reply),
            Intent::CancelEdit(reply) => {
                self.session.cancel_edit();
                (Ok(()), reply)
            }
            Intent::Edit(index, text, reply) => (self.session.edit(index, &text), reply),
            Intent::Open(reply) => {
                self.session.open();
                (Ok(()), reply)
            }
            Intent::Close(reply) => {
                self.session.close();
                (Ok(()), reply)
            }
        };

        if result.is_ok() {
            self.publish();
        }
        let _ = reply.send(result);
    }

    fn handle_stream(&mut self, outcome: StreamOutcome) {
        let Some(turn) = self.active.as_ref().map(|a| a.turn) else {
            return;
        };

        match outcome {
            StreamOutcome::Event(Some(Ok(StreamEvent::Chunk(text)))) => {
                self.session.apply_chunk(turn, &text);
                if let (Some(active), Some(limit)) = (self.active.as_mut(), self.chunk_timeout) {
                    active.deadline = Some(Instant::now() + limit);
                }
            }
            StreamOutcome::Event(Some(Ok(StreamEvent::Done))) => {
                debug!("Turn {} complete", turn);
                self.session.complete(turn);
                self.active = None;
            }
            StreamOutcome::Event(Some(Err(e))) => {
                warn!("Turn {} failed: {}", turn, e);
                self.session.fail(turn, &e);
                self.active = None;
            }
            StreamOutcome::Event(None) => {
                warn!("Turn {} stream closed without completion", turn);
                self.session.fail(turn, &SessionError::StreamInterrupted);
                self.active = None;
            }
            StreamOutcome::TimedOut => {
                let limit = self.chunk_timeout.unwrap_or_default();
                warn!("Turn {} received nothing for {:?}", turn, limit);
                self.session.fail(turn, &SessionError::Timeout(limit));
                self.active = None;
            }
        }
        self.publish();
    }
}

async fn next_event(active: &mut Option<ActiveStream>) -> StreamOutcome {
    let Some(active) = active.as_mut() else {
        return std::future::pending().await;
    };
    match active.deadline {
        Some(deadline) => {
            match tokio::time::timeout_at(deadline, active.events.next()).await {
                Ok(item) => StreamOutcome::Event(item),
                Err(_) => StreamOutcome::TimedOut,
            }
        }
        None => StreamOutcome::Event(active.events.next().await),
    }
}

/// Cloneable front for the presentation layer: sends intents and observes
/// views. Rejected intents come back as errors and leave the view untouched.
#[derive(Clone)]
pub struct SessionHandle {
    intents: mpsc::Sender<Intent>,
    views: watch::Receiver<SessionView>,
}

impl SessionHandle {
    async fn request(&self, make: impl FnOnce(Reply) -> Intent) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.intents.send(make(tx)).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn submit(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Intent::Submit(text, reply)).await
    }

    pub async fn abort(&self) -> Result<(), SessionError> {
        self.request(Intent::Abort).await
    }

    pub async fn retry(&self) -> Result<(), SessionError> {
        self.request(Intent::Retry).await
    }

    pub async fn start_edit(&self, index: usize) -> Result<(), SessionError> {
        self.request(|reply| Intent::StartEdit(index, reply)).await
    }

    pub async fn cancel_edit(&self) -> Result<(), SessionError> {
        self.request(Intent::CancelEdit).await
    }

    pub async fn edit(&self, index: usize, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Intent::Edit(index, text, reply)).await
    }

    pub async fn open(&self) -> Result<(), SessionError> {
        self.request(Intent::Open).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(Intent::Close).await
    }

    pub fn view(&self) -> SessionView {
        self.views.borrow().clone()
    }

    /// A receiver that is notified on every published view.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.views.clone()
    }
}
