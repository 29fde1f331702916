pub mod client;
pub mod openai;
pub mod repair;

pub use client::{DialogueInput, LlmClient, LlmError, SemanticInput};
pub use openai::OpenAiClient;
