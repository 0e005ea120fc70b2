//! Provider clients for chat completion and batch execution.
//!
//! Two seams are exposed as traits so the engine can be driven by scripted
//! providers in tests:
//!
//! ```ignore
//! use eval_forge::llm::{ChatClient, ChatRequest, OpenAiChatClient};
//!
//! let client = OpenAiChatClient::from_env()?;
//! let response = client
//!     .chat(ChatRequest::new("gpt-4.1-mini", "Say hello").with_system("Be brief"))
//!     .await?;
//! println!("{}", response.text);
//! ```

mod batch;
mod chat;

pub use batch::{
    index_results, BatchClient, BatchItem, BatchItemResult, BatchPoll, ItemOutcome,
    OpenAiBatchClient,
};
pub use chat::{
    ChatClient, ChatRequest, ChatResponse, Message, OpenAiChatClient, DEFAULT_API_BASE,
};
