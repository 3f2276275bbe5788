//! Adapter registry: stable string ids to capability factories.
//!
//! All provider instances are created through the registry rather than by
//! calling adapter constructors directly; sessions resolve their agent
//! snapshot's adapter ids here once, at creation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use super::llm::LlmAdapter;
use super::llm_openai::OpenAiLlmAdapter;
use super::retrieval::{HttpRetriever, NoopRetriever, Retriever};
use super::stt::SttAdapter;
use super::stt_ws::WsSttAdapter;
use super::tts::TtsAdapter;
use super::tts_ws::WsTtsAdapter;
use crate::errors::AdapterError;

/// Registry of provider adapters, keyed by `"provider.capability"` id.
///
/// Shared per-process; the contained HTTP client carries the connection
/// pools, so adapters are cheap handles.
#[derive(Default)]
pub struct ProviderRegistry {
    stt: HashMap<String, Arc<dyn SttAdapter>>,
    llm: HashMap<String, Arc<dyn LlmAdapter>>,
    tts: HashMap<String, Arc<dyn TtsAdapter>>,
    retrieval: HashMap<String, Arc<dyn Retriever>>,
}

impl ProviderRegistry {
    /// Empty registry, for tests that register only stubs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapters, sharing one HTTP client.
    pub fn builtin(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register_stt(Arc::new(WsSttAdapter::new(client.clone())));
        registry.register_llm(Arc::new(OpenAiLlmAdapter::new(client.clone())));
        registry.register_tts(Arc::new(WsTtsAdapter::new()));
        registry.register_retrieval("http.retrieval", Arc::new(HttpRetriever::new(client)));
        registry.register_retrieval("none.retrieval", Arc::new(NoopRetriever));
        registry
    }

    pub fn register_stt(&mut self, adapter: Arc<dyn SttAdapter>) {
        self.stt.insert(adapter.id().to_string(), adapter);
    }

    pub fn register_llm(&mut self, adapter: Arc<dyn LlmAdapter>) {
        self.llm.insert(adapter.id().to_string(), adapter);
    }

    pub fn register_tts(&mut self, adapter: Arc<dyn TtsAdapter>) {
        self.tts.insert(adapter.id().to_string(), adapter);
    }

    pub fn register_retrieval(&mut self, id: &str, adapter: Arc<dyn Retriever>) {
        self.retrieval.insert(id.to_string(), adapter);
    }

    pub fn stt(&self, id: &str) -> Result<Arc<dyn SttAdapter>> {
        self.stt
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(id.to_string()).into())
    }

    pub fn llm(&self, id: &str) -> Result<Arc<dyn LlmAdapter>> {
        self.llm
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(id.to_string()).into())
    }

    pub fn tts(&self, id: &str) -> Result<Arc<dyn TtsAdapter>> {
        self.tts
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(id.to_string()).into())
    }

    pub fn retrieval(&self, id: &str) -> Result<Arc<dyn Retriever>> {
        self.retrieval
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids_resolve() {
        let registry = ProviderRegistry::builtin(reqwest::Client::new());
        assert!(registry.stt("ws.stt").is_ok());
        assert!(registry.llm("openai.llm").is_ok());
        assert!(registry.tts("ws.tts").is_ok());
        assert!(registry.retrieval("http.retrieval").is_ok());
        assert!(registry.retrieval("none.retrieval").is_ok());
    }

    #[test]
    fn test_unknown_id_is_error() {
        let registry = ProviderRegistry::builtin(reqwest::Client::new());
        match registry.llm("nope.llm") {
            Err(err) => assert!(matches!(
                err.downcast_ref::<AdapterError>(),
                Some(AdapterError::UnknownAdapter(id)) if id == "nope.llm"
            )),
            Ok(_) => panic!("expected unknown adapter error"),
        }
    }
}
