//! Retrieval capability: query text in, top-k scored contexts out.
//!
//! The retrieval implementation is opaque. The scheduler bounds every call
//! with the configured budget and proceeds with zero contexts on timeout or
//! error; retrieval can degrade a turn, never abort it.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{opt_str, opt_u64, AdapterOptions};
use crate::errors::AdapterError;

/// One retrieved context with its relevance score.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredContext {
    pub text: String,
    #[serde(default)]
    pub score: f32,
}

/// Opaque retrieval function.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn id(&self) -> &str;

    async fn retrieve(
        &self,
        query: &str,
        options: &AdapterOptions,
    ) -> Result<Vec<ScoredContext>>;
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Retriever that always returns nothing, for agents without a knowledge
/// base.
pub struct NoopRetriever;

#[async_trait]
impl Retriever for NoopRetriever {
    fn id(&self) -> &str {
        "none.retrieval"
    }

    async fn retrieve(
        &self,
        _query: &str,
        _options: &AdapterOptions,
    ) -> Result<Vec<ScoredContext>> {
        Ok(Vec::new())
    }
}

/// HTTP retrieval adapter: `POST {url}` with `{"query", "topK"}`, expecting
/// `{"contexts": [{"text", "score"}]}`.
pub struct HttpRetriever {
    client: reqwest::Client,
}

impl HttpRetriever {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct RetrievalResponse {
    #[serde(default)]
    contexts: Vec<ScoredContext>,
}

#[async_trait]
impl Retriever for HttpRetriever {
    fn id(&self) -> &str {
        "http.retrieval"
    }

    async fn retrieve(
        &self,
        query: &str,
        options: &AdapterOptions,
    ) -> Result<Vec<ScoredContext>> {
        let url = opt_str(options, "url").ok_or(AdapterError::MissingOption("url"))?;
        let top_k = opt_u64(options, "topK").unwrap_or(5);

        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "query": query, "topK": top_k }))
            .send()
            .await
            .map_err(|e| AdapterError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Http { status: status.as_u16(), message }.into());
        }

        let parsed: RetrievalResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(e.to_string()))?;

        debug!("retrieval returned {} contexts", parsed.contexts.len());
        let mut contexts = parsed.contexts;
        contexts.truncate(top_k as usize);
        Ok(contexts)
    }
}

/// Concatenate contexts into the system-message block prepended to the
/// prompt. Empty input yields `None` (no extra message).
pub fn contexts_to_system_block(contexts: &[ScoredContext]) -> Option<String> {
    if contexts.is_empty() {
        return None;
    }
    let joined = contexts
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    Some(format!(
        "Use the following retrieved context to ground your answer:\n\n{}",
        joined
    ))
}
