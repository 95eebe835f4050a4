//! Answer generation over retrieved passages.
//!
//! The language model is an external collaborator reached through the
//! [`Completer`] trait. This module only builds the prompt and ships it;
//! the returned prose is passed through uninspected.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AnswerLanguage, CompletionConfig};
use crate::models::QueryResultItem;

#[async_trait]
pub trait Completer: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String>;
}

pub struct DisabledCompleter;

#[async_trait]
impl Completer for DisabledCompleter {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _prompt: &str) -> Result<String> {
        bail!("Completion provider is disabled")
    }
}

/// Non-streaming `POST {url}/api/generate` against Ollama.
pub struct OllamaCompleter {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaCompleter {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Completer for OllamaCompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Ollama connection error (is Ollama running at {}?): {}", self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, text);
        }
        let json: serde_json::Value = response.json().await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response field"))
    }
}

pub fn create_completer(config: &CompletionConfig) -> Result<Arc<dyn Completer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompleter)),
        "ollama" => Ok(Arc::new(OllamaCompleter::new(config)?)),
        other => bail!("Unknown completion provider: {}", other),
    }
}

/// Instruction line, question, then numbered passages with their origin so
/// the answer can cite them.
pub fn build_prompt(query: &str, passages: &[QueryResultItem], language: AnswerLanguage) -> String {
    let (instruction, context_label, cite) = match language {
        AnswerLanguage::De => (
            "Beantworte die folgende Frage auf Deutsch:",
            "Quellen:",
            "Nenne die verwendeten Quellen mit ihrer Nummer.",
        ),
        AnswerLanguage::En => (
            "Answer the following question in English:",
            "Sources:",
            "Cite the sources you used by their number.",
        ),
    };

    let mut prompt = format!("{} {}\n\n{}\n", instruction, query.trim(), context_label);
    for (i, p) in passages.iter().enumerate() {
        let _ = write!(
            prompt,
            "\n[{}] {} ({}, {})\n{}\n",
            i + 1,
            p.title,
            p.source_kind,
            p.uri,
            p.snippet
        );
    }
    prompt.push('\n');
    prompt.push_str(cite);
    prompt
}
