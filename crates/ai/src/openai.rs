use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use salesnote_core::config::{LlmConfig, ModelConfig, Prompts};
use salesnote_core::domain::normalize::{NormalizationRequest, NormalizationResult};
use salesnote_core::domain::SemanticAnalysisResult;
use salesnote_core::states::SessionStage;

use crate::client::{DialogueInput, LlmClient, LlmError, SemanticInput};
use crate::repair::repair_json;

/// Client for any OpenAI-compatible chat-completions endpoint. One HTTP
/// client is shared across all operations; semantic and dialogue operations
/// carry their own model settings.
pub struct OpenAiClient {
    http: reqwest::Client,
    config: LlmConfig,
    prompts: Prompts,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig, prompts: Prompts) -> OpenAiClient {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        OpenAiClient { http, config, prompts }
    }

    async fn chat(
        &self,
        model: &ModelConfig,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": model.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "temperature": model.temperature,
            "max_completion_tokens": model.max_completion_tokens,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status: status.as_u16(), body });
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(LlmError::EmptyResponse)?;
        Ok(extract_final_content(&content).to_string())
    }

    async fn classify(&self, prompt: &str, utterance: &str) -> Result<bool, LlmError> {
        if prompt.is_empty() {
            return Ok(false);
        }
        let user_prompt = format!("用户输入：{utterance}");
        let content = self.chat(&self.config.semantic, prompt, &user_prompt).await?;
        Ok(content == "true")
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Drops a reasoning preamble from models that emit
/// `<think>...</think>answer` (case-insensitive on the closing tag).
pub fn extract_final_content(raw: &str) -> &str {
    let trimmed = raw.trim();
    // ASCII lowercasing keeps byte offsets aligned with the original.
    let lowered = trimmed.to_ascii_lowercase();
    match lowered.find("</think>") {
        Some(index) => trimmed[index + "</think>".len()..].trim(),
        None => trimmed,
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn is_customer_follow_related(&self, utterance: &str) -> Result<bool, LlmError> {
        self.classify(&self.prompts.is_customer_follow_related, utterance).await
    }

    async fn is_user_confirmation(&self, utterance: &str) -> Result<bool, LlmError> {
        self.classify(&self.prompts.is_user_confirmation, utterance).await
    }

    async fn is_user_no_more_customers(&self, utterance: &str) -> Result<bool, LlmError> {
        self.classify(&self.prompts.is_user_no_more_customers, utterance).await
    }

    async fn semantic_analysis(
        &self,
        input: SemanticInput<'_>,
    ) -> Result<SemanticAnalysisResult, LlmError> {
        let conversation_prefix = if input.conversation_history.is_empty() {
            String::new()
        } else {
            format!("此前对话内容：\n{}\n\n", input.conversation_history)
        };
        // While confirming, corrections must land on the focus customer even
        // when the user does not repeat the name.
        let extra_hint = if input.stage == SessionStage::Confirming
            && !input.focus_customer.is_empty()
        {
            format!(
                "（重要：用户若对复述内容提出修正，必须将修正字段归入【{}】的 field_updates，即使用户未重复客户名）\n",
                input.focus_customer
            )
        } else {
            String::new()
        };

        let user_prompt = format!(
            "当前会话阶段：{}\n当前关注的客户：{}\n当前客户所需信息点：{}\n{}{}用户输入：{}",
            input.stage.as_str(),
            input.focus_customer,
            input.expected_field,
            extra_hint,
            conversation_prefix,
            input.utterance,
        );
        debug!(user_prompt, "semantic analysis prompt");

        let content =
            self.chat(&self.config.semantic, &self.prompts.semantic_analysis, &user_prompt).await?;

        match serde_json::from_str::<SemanticAnalysisResult>(&content) {
            Ok(result) => Ok(result),
            Err(first_error) => {
                let repaired = repair_json(&content).ok_or_else(|| LlmError::Parse {
                    message: first_error.to_string(),
                    content: content.clone(),
                })?;
                serde_json::from_str(&repaired).map_err(|repair_error| {
                    error!(%repair_error, content, "semantic analysis unparseable after repair");
                    LlmError::Parse { message: repair_error.to_string(), content }
                })
            }
        }
    }

    async fn generate_dialogue(&self, input: DialogueInput<'_>) -> Result<String, LlmError> {
        let (system_prompt, user_prompt) = match input.stage {
            SessionStage::Collecting => {
                let conversation_prefix = if input.conversation_history.is_empty() {
                    String::new()
                } else {
                    format!("此前对话内容：\n{}\n\n", input.conversation_history)
                };
                let user_prompt = format!(
                    "请生成下一句你要对用户说的话。\n当前对话背景：\n\
                     - 这是一次工作跟进的复盘对话\n\
                     - 允许信息不完整、顺序混乱\n\
                     - 重点是复盘发生了什么，而不是填写信息\n\n\
                     当前聚焦客户：\n{}\n\n\
                     希望收集的信息：\n{}\n\n\
                     已知跟进情况摘要：\n{}\n\n\
                     {}用户刚刚说：\n{}\n\n请你自然地继续这段对话。",
                    input.focus_customer,
                    input.expected_info,
                    input.summary,
                    conversation_prefix,
                    input.utterance,
                );
                (self.prompts.dialogue_collecting.as_str(), user_prompt)
            }
            SessionStage::Confirming => {
                let user_prompt = format!(
                    "根据以下跟进记录和用户说的，生成下一句你要对用户说的话。\n\
                     注意：跟进记录（JSON）即为待确认的全部数据，请仅基于此复述，不得虚构、杜撰或补充任何未出现的信息。\n\n\
                     跟进记录（JSON）：{}\n用户刚才说：{}",
                    input.history_context, input.utterance,
                );
                (self.prompts.dialogue_confirming.as_str(), user_prompt)
            }
            other => {
                return Err(LlmError::Parse {
                    message: format!("unsupported dialogue stage {}", other.as_str()),
                    content: String::new(),
                });
            }
        };

        debug!(user_prompt, "dialogue prompt");
        self.chat(&self.config.dialogue, system_prompt, &user_prompt).await
    }

    async fn summarize_customer_info(&self, record_json: &str) -> Result<String, LlmError> {
        let user_prompt = format!(
            "以下是某一客户已经确认过的跟进事实，请将其整理为可用于对话中的自然复盘摘要。\n输入事实（JSON）：{record_json}"
        );
        self.chat(&self.config.dialogue, &self.prompts.customer_summary, &user_prompt).await
    }

    async fn entity_normalization(
        &self,
        request: &NormalizationRequest,
    ) -> Result<Vec<NormalizationResult>, LlmError> {
        let mentions = serde_json::to_string(&request.mentions_entity).unwrap_or_default();
        let candidates = serde_json::to_string(&request.candidate_entities).unwrap_or_default();
        let user_prompt = format!(
            "对话上下文：\n{}\n\n已抽取的客户/联系人实体：\n{}\n\n候选客户/联系人实体：\n{}",
            request.dialog_context, mentions, candidates,
        );

        let content = self
            .chat(&self.config.semantic, &self.prompts.entity_normalization, &user_prompt)
            .await?;

        let mut results: Vec<NormalizationResult> = serde_json::from_str(&content)
            .map_err(|source| LlmError::Parse { message: source.to_string(), content })?;
        for result in &mut results {
            result.grade();
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_content_strips_think_preamble() {
        assert_eq!(extract_final_content("<think>推理过程</think>\ntrue"), "true");
        assert_eq!(extract_final_content("<THINK>x</THINK>  false"), "false");
        assert_eq!(extract_final_content("  true  "), "true");
        assert_eq!(extract_final_content(""), "");
    }

    #[test]
    fn final_content_keeps_text_without_tag() {
        let reply = "明白了，阿里巴巴这次是电话跟进对吧？";
        assert_eq!(extract_final_content(reply), reply);
    }

    #[test]
    fn chat_completion_decodes_expected_shape() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "true"}}
            ]
        }"#;
        let completion: ChatCompletion = serde_json::from_str(raw).expect("decode");
        assert_eq!(completion.choices[0].message.content, "true");
    }
}
