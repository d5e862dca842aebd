use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

pub const MAX_SUMMARY_CHARS: usize = 200;
const FALLBACK_BODY_CHARS: usize = 150;

#[derive(Debug, Error)]
pub enum SummarizerError {
    #[error("summarizer request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("summarizer returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("summarizer returned no content")]
    Empty,
}

#[async_trait]
pub trait Summarizer: Send + Sync + 'static {
    async fn summarize(&self, content: &str, title: Option<&str>)
        -> Result<String, SummarizerError>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionSummarizer {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ChatCompletionSummarizer {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build summarizer HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

fn build_prompt(content: &str, title: Option<&str>) -> String {
    let mut prompt = format!(
        "Write a concise summary (at most {MAX_SUMMARY_CHARS} characters) of the following note.\n\n"
    );
    if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
        prompt.push_str(&format!("Title: {title}\n\n"));
    }
    prompt.push_str(&format!(
        "Content:\n{content}\n\nKeep the key points, stay factual and use plain language."
    ));
    prompt
}

fn extract_summary(response: ChatCompletionResponse) -> Result<String, SummarizerError> {
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or(SummarizerError::Empty)?;
    Ok(clamp_summary(&text))
}

#[async_trait]
impl Summarizer for ChatCompletionSummarizer {
    async fn summarize(
        &self,
        content: &str,
        title: Option<&str>,
    ) -> Result<String, SummarizerError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You summarize personal notes accurately and briefly."},
                {"role": "user", "content": build_prompt(content, title)},
            ],
            "max_tokens": 300,
            "temperature": 0.3,
            "top_p": 0.9,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizerError::Status { status, body });
        }

        let data: ChatCompletionResponse = response.json().await?;
        let summary = extract_summary(data)?;
        debug!(chars = summary.chars().count(), "remote summary generated");
        Ok(summary)
    }
}

/// Used when no remote summarizer is configured.
pub struct LocalSummarizer;

#[async_trait]
impl Summarizer for LocalSummarizer {
    async fn summarize(
        &self,
        content: &str,
        title: Option<&str>,
    ) -> Result<String, SummarizerError> {
        Ok(fallback_summary(content, title))
    }
}

pub fn from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn Summarizer>> {
    match &config.openai_api_key {
        Some(api_key) => {
            info!(base_url = %config.openai_base_url, model = %config.openai_model, "remote summarizer enabled");
            Ok(Arc::new(ChatCompletionSummarizer::new(
                &config.openai_base_url,
                api_key.clone(),
                config.openai_model.clone(),
                Duration::from_secs(config.summarizer_timeout_seconds),
            )?))
        }
        None => {
            warn!("OPENAI_API_KEY not set, notes will use local summaries");
            Ok(Arc::new(LocalSummarizer))
        }
    }
}

/// Never fails: a summarizer error is logged and replaced by the local summary.
pub async fn summarize_or_fallback(
    summarizer: &dyn Summarizer,
    content: &str,
    title: Option<&str>,
) -> String {
    match summarizer.summarize(content, title).await {
        Ok(summary) => clamp_summary(&summary),
        Err(err) => {
            warn!(error = %err, "summarizer failed, using local summary");
            fallback_summary(content, title)
        }
    }
}

/// Markup-stripped, whitespace-collapsed prefix of the content, led by the title.
pub fn fallback_summary(content: &str, title: Option<&str>) -> String {
    let stripped: String = content
        .chars()
        .filter(|c| !matches!(c, '#' | '*' | '`'))
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let body: String = collapsed.chars().take(FALLBACK_BODY_CHARS).collect();

    let summary = match title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(title) => format!("{title}: {body}"),
        None => body,
    };
    clamp_summary(&summary)
}

pub fn clamp_summary(summary: &str) -> String {
    if summary.chars().count() <= MAX_SUMMARY_CHARS {
        return summary.to_string();
    }
    let mut clamped: String = summary.chars().take(MAX_SUMMARY_CHARS - 3).collect();
    clamped.push_str("...");
    clamped
}
