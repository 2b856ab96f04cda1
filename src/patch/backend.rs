use crate::config::{secret_from_env, PatchConfig};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One corrective-rewrite request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub artifact_path: String,
    /// Current source, already cut to the prompt budget
    pub artifact: String,
    /// What broke, including the error excerpt
    pub description: String,
}

impl CompletionRequest {
    pub fn user_message(&self) -> String {
        format!(
            "A scheduled job failed. Fix the file below.\n\n\
             FAILURE:\n{}\n\n\
             CURRENT SOURCE ({}):\n{}\n\n\
             Rules:\n\
             - Fix only what is broken. Do not refactor unrelated code.\n\
             - Preserve all existing behavior.\n\
             - If an external service is unreliable, add a graceful fallback instead of crashing.\n\
             - Reply with the complete corrected file and nothing else.",
            self.description, self.artifact_path, self.artifact
        )
    }
}

/// Something that turns a failing file plus its error into a corrected file.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Extract a retry-after hint from a rate-limit body, if present.
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

/// OpenAI-compatible chat-completions backend (OpenRouter by default).
pub struct ChatCompletionsGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ChatCompletionsGenerator {
    /// `None` when no API key is configured; patching is skipped in that case.
    pub fn from_config(config: &PatchConfig) -> Result<Option<Self>> {
        let Some(api_key) = secret_from_env(&config.api_key_env) else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Some(Self {
            client,
            url: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }))
    }
}

#[async_trait]
impl CodeGenerator for ChatCompletionsGenerator {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let user = request.user_message();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &user,
                },
            ],
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Title", "hyphae")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to parse completion response: {} ({})",
                        e,
                        crate::util::truncate(&text, 200)
                    )
                })?;
                return Ok(parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default());
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text).unwrap_or(
                    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1)) / 1000,
                );
                tracing::warn!(
                    retry_after,
                    attempt = retry_count,
                    max = MAX_RETRIES,
                    "code generation rate limited"
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            let message = match status.as_u16() {
                401 => "Invalid API key for the code generation backend".to_string(),
                429 => format!("Rate limited after {} retries", retry_count),
                500..=599 => format!("Code generation backend error ({})", status),
                _ => format!(
                    "Code generation API error {}: {}",
                    status,
                    crate::util::truncate(&text, 200)
                ),
            };
            return Err(anyhow::anyhow!(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_read_from_body() {
        assert_eq!(parse_retry_after("Please retry after 12 seconds"), Some(12));
        assert_eq!(parse_retry_after("retry in 0 or 900s"), None);
        assert_eq!(parse_retry_after("slow down"), None);
    }

    #[test]
    fn user_message_carries_failure_and_source() {
        let request = CompletionRequest {
            system: "sys".to_string(),
            artifact_path: "src/news.py".to_string(),
            artifact: "print('hi')".to_string(),
            description: "KeyError: 'x'".to_string(),
        };
        let msg = request.user_message();
        assert!(msg.contains("KeyError: 'x'"));
        assert!(msg.contains("CURRENT SOURCE (src/news.py)"));
        assert!(msg.contains("print('hi')"));
    }

    #[test]
    fn missing_key_disables_backend() {
        let config = PatchConfig {
            api_key_env: "HYPHAE_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..PatchConfig::default()
        };
        assert!(ChatCompletionsGenerator::from_config(&config).unwrap().is_none());
    }
}
