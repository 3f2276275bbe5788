//! Session management: creation, routing, teardown.
//!
//! The manager owns per-session wiring: it resolves the agent snapshot,
//! builds the event queue / notice bus / outbound audio channel, spawns the
//! VAD worker and the scheduler, and removes the session entry when the
//! scheduler exits. Sessions run on distinct schedulers; the only shared
//! state here is the immutable agent store, the provider registry, and the
//! process-wide tool executor.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};

use crate::agent::AgentStore;
use crate::audio::AudioFrame;
use crate::config::OrchestratorConfig;
use crate::providers::{NoToolExecutor, ProviderRegistry, ToolExecutor};
use crate::session::events::{
    session_queue, EventSink, SessionEvent, SessionNotice, NOTICE_CAPACITY,
    OUTBOUND_FRAME_CAPACITY,
};
use crate::session::scheduler::{ResolvedAdapters, SchedulerContext, SessionScheduler};
use crate::vad;

/// Cloneable per-session handle held by the control surface.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub agent_id: String,
    pub created_at: DateTime<Local>,
    pub sink: EventSink,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }
}

struct SessionEntry {
    handle: SessionHandle,
    /// Taken by the first media transport that attaches.
    outbound_rx: Option<mpsc::Receiver<AudioFrame>>,
}

/// Creates, routes, and tears down sessions.
pub struct SessionManager {
    registry: Arc<ProviderRegistry>,
    agents: Arc<AgentStore>,
    tuning: OrchestratorConfig,
    tools: Arc<dyn ToolExecutor>,
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        agents: Arc<AgentStore>,
        tuning: OrchestratorConfig,
    ) -> Arc<Self> {
        Self::with_tools(registry, agents, tuning, Arc::new(NoToolExecutor))
    }

    pub fn with_tools(
        registry: Arc<ProviderRegistry>,
        agents: Arc<AgentStore>,
        tuning: OrchestratorConfig,
        tools: Arc<dyn ToolExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            agents,
            tuning,
            tools,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create a session for the named agent and start its scheduler.
    pub async fn create_session(self: &Arc<Self>, agent_id: &str) -> Result<SessionHandle> {
        let agent = self
            .agents
            .snapshot(agent_id)
            .ok_or_else(|| anyhow!("unknown agent: {}", agent_id))?;

        let adapters = ResolvedAdapters {
            stt: self.registry.stt(&agent.stt.adapter)?,
            llm: self.registry.llm(&agent.llm.adapter)?,
            tts: self.registry.tts(&agent.tts.adapter)?,
            retrieval: match &agent.retrieval {
                Some(cap) => Some(self.registry.retrieval(&cap.adapter)?),
                None => None,
            },
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let conversation_id = uuid::Uuid::new_v4().to_string();
        let (sink, events) = session_queue();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_FRAME_CAPACITY);

        let vad = vad::spawn_worker(self.tuning.vad.clone(), sink.clone());

        let scheduler = SessionScheduler::new(SchedulerContext {
            session_id: session_id.clone(),
            conversation_id,
            agent,
            tuning: self.tuning.clone(),
            adapters,
            tools: self.tools.clone(),
            events,
            sink: sink.clone(),
            notices: notices.clone(),
            outbound: outbound_tx,
            vad,
        });

        let handle = SessionHandle {
            id: session_id.clone(),
            agent_id: agent_id.to_string(),
            created_at: Local::now(),
            sink,
            notices,
        };

        self.sessions.lock().await.insert(
            session_id.clone(),
            SessionEntry {
                handle: handle.clone(),
                outbound_rx: Some(outbound_rx),
            },
        );

        // Run the scheduler; reap the entry when it exits for any reason
        // (teardown, idle timeout, fatal fault).
        let sessions = self.sessions.clone();
        let reap_id = session_id.clone();
        let run = tokio::spawn(scheduler.run());
        tokio::spawn(async move {
            if let Err(e) = run.await {
                // Scheduler panics are contained here; the session dies,
                // the process does not.
                warn!(session = %reap_id, "scheduler aborted: {}", e);
            }
            sessions.lock().await.remove(&reap_id);
            info!(session = %reap_id, "session reaped");
        });

        info!(session = %session_id, agent = %agent_id, "session created");
        Ok(handle)
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|e| e.handle.clone())
    }

    /// Take the outbound audio receiver for a media transport. Only the
    /// first caller gets it; a second transport cannot attach.
    pub async fn attach_media(
        &self,
        session_id: &str,
    ) -> Option<(SessionHandle, mpsc::Receiver<AudioFrame>)> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(session_id)?;
        let rx = entry.outbound_rx.take()?;
        Some((entry.handle.clone(), rx))
    }

    /// Request teardown. Returns false for unknown sessions.
    pub async fn close_session(&self, session_id: &str) -> bool {
        match self.get(session_id).await {
            Some(handle) => {
                handle.sink.send(SessionEvent::Cancel);
                true
            }
            None => false,
        }
    }

    /// Feed text-mode input into a session.
    pub async fn post_text(&self, session_id: &str, text: String) -> bool {
        match self.get(session_id).await {
            Some(handle) => {
                handle.sink.send(SessionEvent::UserText(text));
                true
            }
            None => false,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn agents(&self) -> &AgentStore {
        &self.agents
    }
}
