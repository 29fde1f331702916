use async_trait::async_trait;
use thiserror::Error;

use salesnote_core::domain::normalize::{NormalizationRequest, NormalizationResult};
use salesnote_core::domain::SemanticAnalysisResult;
use salesnote_core::states::SessionStage;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("llm returned no choices")]
    EmptyResponse,
    #[error("could not parse llm output: {message}")]
    Parse { message: String, content: String },
}

/// Inputs for the extraction operation.
#[derive(Clone, Copy, Debug)]
pub struct SemanticInput<'a> {
    pub utterance: &'a str,
    pub stage: SessionStage,
    pub focus_customer: &'a str,
    pub expected_field: &'a str,
    pub conversation_history: &'a str,
}

/// Inputs for reply generation.
#[derive(Clone, Copy, Debug)]
pub struct DialogueInput<'a> {
    pub stage: SessionStage,
    pub focus_customer: &'a str,
    pub expected_info: &'a str,
    pub utterance: &'a str,
    /// CONFIRMING: the full recap JSON to restate.
    pub history_context: &'a str,
    /// COLLECTING: the current customer's pending-data summary.
    pub summary: &'a str,
    pub conversation_history: &'a str,
}

/// The six conversational operations plus entity normalization.
///
/// Implementations parse untrusted model output; callers own the failure
/// policy (classifiers fall back to `false`, extraction errors leave the
/// turn without updates).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn is_customer_follow_related(&self, utterance: &str) -> Result<bool, LlmError>;
    async fn is_user_confirmation(&self, utterance: &str) -> Result<bool, LlmError>;
    async fn is_user_no_more_customers(&self, utterance: &str) -> Result<bool, LlmError>;
    async fn semantic_analysis(
        &self,
        input: SemanticInput<'_>,
    ) -> Result<SemanticAnalysisResult, LlmError>;
    async fn generate_dialogue(&self, input: DialogueInput<'_>) -> Result<String, LlmError>;
    async fn summarize_customer_info(&self, record_json: &str) -> Result<String, LlmError>;
    async fn entity_normalization(
        &self,
        request: &NormalizationRequest,
    ) -> Result<Vec<NormalizationResult>, LlmError>;
}
