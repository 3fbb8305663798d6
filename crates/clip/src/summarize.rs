//! LLM summarization of oversized tool responses.
//!
//! The summarizer speaks the OpenAI chat/completions dialect: one POST to the
//! configured base URL, bearer auth when an API key is present, summary text
//! taken from the first choice. It fails upward on timeout, non-2xx status,
//! or malformed output; the pipeline decides what to serve instead.

use crate::config::LlmConfig;
use crate::error::ClipError;
use crate::policy::CompressionPolicy;
use crate::token::estimate_tokens;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A produced summary plus the token accounting the response metadata needs.
#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub original_tokens: u32,
    pub summary_tokens: u32,
}

/// Seam between the pipeline and the LLM. Tests swap in a canned impl.
#[async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize(
        &self,
        body: &str,
        policy: &CompressionPolicy,
        max_output_tokens: u32,
        goal: Option<&str>,
    ) -> Result<Summary, ClipError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// One OpenAI-style chat call; shared with the masker's fallback pass.
/// Returns the first choice's text or a plain error message.
pub(crate) async fn chat_completion(
    client: &reqwest::Client,
    config: &LlmConfig,
    system: String,
    user: String,
    max_tokens: u32,
    timeout: Duration,
) -> Result<String, String> {
    let request = ChatRequest {
        model: &config.model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ],
        max_tokens,
    };

    let mut builder = client.post(&config.base_url).timeout(timeout).json(&request);
    if let Some(api_key) = &config.api_key {
        builder = builder.bearer_auth(api_key);
    }

    let response = builder.send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("HTTP {status}: {body}"));
    }

    let parsed: ChatResponse = response.json().await.map_err(|e| e.to_string())?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| "response contained no message content".to_string())
}

pub struct LlmSummarizer {
    client: reqwest::Client,
    config: LlmConfig,
    timeout: Duration,
}

impl LlmSummarizer {
    pub fn new(config: LlmConfig, timeout: Duration) -> Result<Self, ClipError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClipError::Summarizer(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            timeout,
        })
    }

    fn system_prompt(policy: &CompressionPolicy, max_output_tokens: u32, goal: Option<&str>) -> String {
        let mut prompt = format!(
            "You compress tool output for an AI agent. Rewrite the user \
             message as a summary that preserves every load-bearing fact, \
             identifier, number, and error verbatim. Stay under \
             {max_output_tokens} tokens. Output only the summary."
        );
        if let Some(goal) = goal {
            prompt.push_str(&format!(
                "\nThe agent's current goal, prioritize information relevant to it: {goal}"
            ));
        }
        if let Some(instructions) = &policy.custom_instructions {
            prompt.push('\n');
            prompt.push_str(instructions);
        }
        prompt
    }
}

#[async_trait]
impl Summarize for LlmSummarizer {
    async fn summarize(
        &self,
        body: &str,
        policy: &CompressionPolicy,
        max_output_tokens: u32,
        goal: Option<&str>,
    ) -> Result<Summary, ClipError> {
        let system = Self::system_prompt(policy, max_output_tokens, goal);
        let text = chat_completion(
            &self.client,
            &self.config,
            system,
            body.to_string(),
            max_output_tokens,
            self.timeout,
        )
        .await
        .map_err(ClipError::Summarizer)?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ClipError::Summarizer("empty summary".into()));
        }
        Ok(Summary {
            original_tokens: estimate_tokens(body),
            summary_tokens: estimate_tokens(&text),
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CompressionPolicy {
        CompressionPolicy {
            enabled: true,
            token_threshold: 1000,
            max_output_tokens: 500,
            custom_instructions: Some("Keep URLs.".to_string()),
            goal_aware: true,
        }
    }

    #[test]
    fn system_prompt_includes_budget_goal_and_instructions() {
        let prompt = LlmSummarizer::system_prompt(&policy(), 750, Some("find the bug"));
        assert!(prompt.contains("750 tokens"));
        assert!(prompt.contains("find the bug"));
        assert!(prompt.contains("Keep URLs."));
    }

    #[test]
    fn system_prompt_without_goal() {
        let prompt = LlmSummarizer::system_prompt(&policy(), 500, None);
        assert!(!prompt.contains("current goal"));
    }

    #[test]
    fn chat_response_parses_first_choice() {
        let raw = r#"{"choices": [{"message": {"role": "assistant", "content": "short"}}],
                      "usage": {"total_tokens": 10}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("short"));
    }
}
