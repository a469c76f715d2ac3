pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod server;
pub mod session;

use cli::Args;
use config::RelayConfig;
use error::BoxError;
use llm::chat::new_client as new_chat_client;
use log::info;
use server::Server;

/// The general-purpose assistant persona the chat widget starts with.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an intelligent, knowledgeable, and helpful AI assistant. Your goal is to provide clear, accurate, and well-explained answers to any question.

- **Accuracy & Depth**: Provide factual, well-researched responses. If a question requires real-time information, suggest checking reliable sources.
- **Clarity & Simplicity**: Break down complex topics into simple, understandable explanations.
- **Adaptability**: Adjust your tone based on the user's query: formal for professional questions, casual for general inquiries, and engaging when needed.
- **Conciseness & Relevance**: Keep answers clear and to the point while covering all necessary details.
- **Ethical & Neutral**: Avoid biased opinions and misinformation. If a question is outside your knowledge, be honest and suggest alternative sources.
- **Problem-Solving**: Assist with coding, troubleshooting, brainstorming, and decision-making based on best practices.
- **Creativity & Engagement**: Provide creative ideas, insightful perspectives, and engaging responses when necessary.

If the question is ambiguous, ask clarifying questions before responding. Your goal is to be the most reliable and versatile assistant possible.";

pub async fn run(args: Args) -> Result<(), BoxError> {
    let config = RelayConfig::from_args(&args)?;
    config.log_summary();

    let chat_client = new_chat_client(&config.llm)?;
    info!(
        "Chat client configured: Type={}, Model={}, BaseURL={:?}",
        chat_client.get_llm_type(),
        chat_client.get_model(),
        chat_client.get_base_url()
    );

    let server = Server::new(config, chat_client);
    server.run().await?;

    Ok(())
}
