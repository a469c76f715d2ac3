//! Terminal front end for a chat session against a running relay.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chat_relay::error::BoxError;
use chat_relay::session::controller::{ ChatController, SessionConfig, SessionHandle };
use chat_relay::session::transport::HttpTransport;
use chat_relay::session::{ SessionState, SessionView };
use chat_relay::models::chat::Role;
use clap::Parser;
use dotenv::dotenv;
use log::{ debug, info };
use tokio::io::{ AsyncBufReadExt, BufReader };
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat with an LLM through the streaming relay", long_about = None)]
struct ClientArgs {
    #[arg(long, env = "RELAY_ENDPOINT", default_value = "http://127.0.0.1:4000/api/chat")]
    endpoint: String,

    #[arg(long, env = "SYSTEM_PROMPT")]
    system_prompt: Option<String>,

    /// Seconds to wait for the next chunk before giving up on a reply
    #[arg(long, env = "CHUNK_TIMEOUT_SECS", default_value_t = 60)]
    chunk_timeout_secs: u64,

    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

enum Command {
    Abort,
    Retry,
    Edit(usize, String),
    Open,
    Close,
    Quit,
    Submit(String),
}

fn parse_command(line: &str) -> Result<Command, String> {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Ok(Command::Submit(line.to_string()));
    };
    let (name, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    match name {
        "abort" => Ok(Command::Abort),
        "retry" => Ok(Command::Retry),
        "open" => Ok(Command::Open),
        "close" => Ok(Command::Close),
        "quit" | "exit" => Ok(Command::Quit),
        "edit" => {
            let (index, text) = arg.trim().split_once(char::is_whitespace).ok_or("usage: /edit N text")?;
            let index = index.parse::<usize>().map_err(|_| format!("not a message index: {}", index))?;
            Ok(Command::Edit(index, text.trim().to_string()))
        }
        other => Err(format!("unknown command /{}", other)),
    }
}

/// Prints only what changed between successive views.
#[derive(Default)]
struct Renderer {
    assistant: Option<Uuid>,
    printed: usize,
    state: Option<SessionState>,
}

impl Renderer {
    fn render(&mut self, view: &SessionView) {
        let mut out = std::io::stdout().lock();

        if let Some(reply) = view.messages.iter().rev().find(|m| m.role == Role::Assistant) {
            if self.assistant != Some(reply.id) {
                self.assistant = Some(reply.id);
                self.printed = 0;
                let _ = write!(out, "assistant> ");
            } else if reply.content.len() < self.printed {
                // retried: the reply starts over
                self.printed = 0;
                let _ = write!(out, "\n(retrying)\nassistant> ");
            }
            if let Some(delta) = reply.content.get(self.printed..) {
                let _ = write!(out, "{}", delta);
                self.printed = reply.content.len();
            }
        }

        if self.state != Some(view.state) {
            match view.state {
                SessionState::Idle if self.state == Some(SessionState::Streaming) => {
                    let _ = writeln!(out);
                }
                SessionState::Error => {
                    let message = view.last_error.as_deref().unwrap_or("An error occurred");
                    let _ = writeln!(out, "\n[error] {} (/retry to try again)", message);
                }
                _ => {}
            }
            self.state = Some(view.state);
        }
        let _ = out.flush();
    }
}

fn print_history(view: &SessionView) {
    for (i, message) in view.messages.iter().enumerate() {
        println!("[{}] {}: {}", i, message.role, message.content);
    }
}

async fn render_loop(handle: SessionHandle) {
    let mut views = handle.subscribe();
    let mut renderer = Renderer::default();
    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        renderer.render(&view);
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    let args = ClientArgs::parse();

    let default_level = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let transport = HttpTransport::new(&args.endpoint, Duration::from_secs(args.connect_timeout_secs))?;
    info!("Relay endpoint: {}", transport.endpoint());

    let config = SessionConfig {
        system_prompt: Some(
            args.system_prompt.unwrap_or_else(|| chat_relay::DEFAULT_SYSTEM_PROMPT.to_string())
        ),
        chunk_timeout: Some(Duration::from_secs(args.chunk_timeout_secs)).filter(|d| !d.is_zero()),
    };
    let handle = ChatController::spawn(Arc::new(transport), config);
    handle.open().await?;

    tokio::spawn(render_loop(handle.clone()));

    println!("Connected to {}. Type a message, or /abort /retry /edit N text /open /close /quit", args.endpoint);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        let result = match command {
            Command::Abort => handle.abort().await,
            Command::Retry => handle.retry().await,
            Command::Edit(index, text) => handle.edit(index, text).await,
            Command::Open => {
                let result = handle.open().await;
                print_history(&handle.view());
                result
            }
            Command::Close => handle.close().await,
            Command::Quit => break,
            Command::Submit(_) if !handle.view().can_submit() => {
                eprintln!("still answering; /abort first");
                continue;
            }
            Command::Submit(text) => handle.submit(text).await,
        };

        if let Err(e) = result {
            debug!("Intent rejected: {:?}", e);
            eprintln!("{}", e);
        }
    }

    handle.abort().await.ok();
    Ok(())
}
