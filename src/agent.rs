//! Agent snapshots.
//!
//! Agent records are administered elsewhere; the orchestrator reads an
//! immutable snapshot at session creation. A configuration change takes
//! effect on the next session, never mid-session.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AgentConfig, CapabilityConfig};
use crate::providers::AdapterOptions;

/// One capability binding resolved from the agent record.
#[derive(Debug, Clone)]
pub struct CapabilityRef {
    pub adapter: String,
    pub options: AdapterOptions,
}

impl From<&CapabilityConfig> for CapabilityRef {
    fn from(cfg: &CapabilityConfig) -> Self {
        Self {
            adapter: cfg.adapter.clone(),
            options: cfg.options.clone(),
        }
    }
}

/// Immutable per-session view of an agent record.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub id: String,
    pub system_prompt: String,
    pub stt: CapabilityRef,
    pub llm: CapabilityRef,
    pub tts: CapabilityRef,
    pub retrieval: Option<CapabilityRef>,
    /// OpenAI-style tool definitions passed to the LLM.
    pub tools: Vec<serde_json::Value>,
}

impl AgentSnapshot {
    pub fn from_config(id: &str, cfg: &AgentConfig) -> Self {
        Self {
            id: id.to_string(),
            system_prompt: cfg.system_prompt.clone(),
            stt: (&cfg.stt).into(),
            llm: (&cfg.llm).into(),
            tts: (&cfg.tts).into(),
            retrieval: cfg.retrieval.as_ref().map(CapabilityRef::from),
            tools: cfg.tools.clone(),
        }
    }
}

/// Read-only agent table, shared across sessions.
pub struct AgentStore {
    agents: HashMap<String, AgentConfig>,
}

impl AgentStore {
    pub fn new(agents: HashMap<String, AgentConfig>) -> Arc<Self> {
        Arc::new(Self { agents })
    }

    /// Capture an immutable snapshot of the named agent.
    pub fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.agents
            .get(agent_id)
            .map(|cfg| AgentSnapshot::from_config(agent_id, cfg))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_snapshot_captures_bindings() {
        let cfg = Config::default();
        let store = AgentStore::new(cfg.agents);
        let snap = store.snapshot("default").expect("default agent");
        assert_eq!(snap.id, "default");
        assert_eq!(snap.llm.adapter, "openai.llm");
        assert_eq!(snap.retrieval.as_ref().unwrap().adapter, "none.retrieval");
    }

    #[test]
    fn test_unknown_agent_is_none() {
        let store = AgentStore::new(HashMap::new());
        assert!(store.snapshot("ghost").is_none());
    }

    #[test]
    fn test_ids_sorted() {
        let mut agents = HashMap::new();
        agents.insert("zeta".to_string(), crate::config::AgentConfig::default());
        agents.insert("alpha".to_string(), crate::config::AgentConfig::default());
        let store = AgentStore::new(agents);
        assert_eq!(store.ids(), vec!["alpha", "zeta"]);
    }
}
