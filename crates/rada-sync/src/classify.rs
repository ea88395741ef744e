//! Content classification: a short preview in, up to three descriptive tokens out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rada_core::Keywords;
use serde_json::json;
use tracing::{debug, warn};

use crate::ClassifierConfig;

/// Previews shorter than this (trimmed, in characters) are not classified.
pub const MIN_PREVIEW_CHARS: usize = 10;

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Best-effort; failures yield empty keywords.
    async fn classify(&self, preview: &str) -> Keywords;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClassifier;

#[async_trait]
impl Classifier for NoopClassifier {
    async fn classify(&self, _preview: &str) -> Keywords {
        Keywords::empty()
    }
}

/// Chat-completions classifier against an OpenRouter-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenRouterClassifier {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenRouterClassifier {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building classifier client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: endpoint.into(),
        })
    }

    async fn request(&self, preview: &str) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": classification_prompt(preview)}
            ],
            "max_tokens": 10,
            "temperature": 0.3
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("sending classification request")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("decoding classification response")?;
        if !status.is_success() {
            return Err(anyhow!("classifier error ({status}): {body}"));
        }

        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow!("unexpected classifier response format: {body}"))
    }
}

#[async_trait]
impl Classifier for OpenRouterClassifier {
    async fn classify(&self, preview: &str) -> Keywords {
        match self.request(preview).await {
            Ok(reply) => {
                let keywords = keywords_from_reply(&reply);
                debug!(keywords = %keywords.joined(), "classified preview");
                keywords
            }
            Err(err) => {
                warn!(error = %err, "classification failed; continuing without keywords");
                Keywords::empty()
            }
        }
    }
}

pub fn classification_prompt(preview: &str) -> String {
    format!(
        "Analyze this Polish document text (first 35 words) and provide exactly 3 words that best describe its main topic or purpose.\n\
         The response should be in Polish and contain ONLY the 3 words, separated by spaces, no punctuation.\n\n\
         Document text:\n{preview}\n\n\
         Respond with exactly 3 Polish words:"
    )
}

/// First three tokens of a model reply, reduced to filename-safe characters.
pub fn keywords_from_reply(reply: &str) -> Keywords {
    Keywords::new(reply.split_whitespace().map(|token| {
        token
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect::<String>()
    }))
}

pub fn classifier_from_config(config: &ClassifierConfig) -> Result<Arc<dyn Classifier>> {
    match config.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Ok(Arc::new(OpenRouterClassifier::new(
            key,
            config.model.clone(),
            config.endpoint.clone(),
        )?)),
        _ => Ok(Arc::new(NoopClassifier)),
    }
}
