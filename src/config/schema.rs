//! Configuration schema for voxbot.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so that the JSON
//! config file can use camelCase keys while Rust code uses snake_case fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Server config
// ---------------------------------------------------------------------------

/// HTTP control-surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty = permissive.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8790
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator tuning
// ---------------------------------------------------------------------------

/// Voice-activity-detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VadSettings {
    /// Probability threshold for classifying a frame as speech (0.0-1.0).
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,
    /// Consecutive speech frames required to emit speech-start (5 = 100 ms).
    #[serde(default = "default_vad_start_frames")]
    pub start_frames: u32,
    /// Consecutive silence frames required to emit speech-end (25 = 500 ms).
    #[serde(default = "default_vad_end_frames")]
    pub end_frames: u32,
    /// Heartbeat interval during sustained speech, in milliseconds.
    #[serde(default = "default_vad_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Consecutive detector errors before the session is declared dead.
    #[serde(default = "default_vad_error_saturation")]
    pub error_saturation: u32,
    /// Detector aggressiveness (0-3, 3 filters non-speech hardest).
    #[serde(default = "default_vad_mode")]
    pub mode: u8,
}

fn default_vad_threshold() -> f32 {
    0.5
}

fn default_vad_start_frames() -> u32 {
    5
}

fn default_vad_end_frames() -> u32 {
    25
}

fn default_vad_heartbeat_ms() -> u64 {
    200
}

fn default_vad_error_saturation() -> u32 {
    50
}

fn default_vad_mode() -> u8 {
    3
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            start_frames: default_vad_start_frames(),
            end_frames: default_vad_end_frames(),
            heartbeat_ms: default_vad_heartbeat_ms(),
            error_saturation: default_vad_error_saturation(),
            mode: default_vad_mode(),
        }
    }
}

/// Per-stage timeout budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSettings {
    /// Wait for the final transcript after speech end.
    #[serde(default = "default_stt_final_ms")]
    pub stt_final_ms: u64,
    /// Retrieval budget; on expiry the turn proceeds with zero contexts.
    #[serde(default = "default_retrieval_ms")]
    pub retrieval_ms: u64,
    /// Wait for the first LLM token.
    #[serde(default = "default_llm_first_token_ms")]
    pub llm_first_token_ms: u64,
    /// Wait for the first TTS audio chunk.
    #[serde(default = "default_tts_first_audio_ms")]
    pub tts_first_audio_ms: u64,
    /// Hard deadline for cancellation confirmations on barge-in.
    #[serde(default = "default_barge_in_cancel_ms")]
    pub barge_in_cancel_ms: u64,
    /// Session idle timeout in seconds.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
}

fn default_stt_final_ms() -> u64 {
    2_000
}

fn default_retrieval_ms() -> u64 {
    300
}

fn default_llm_first_token_ms() -> u64 {
    5_000
}

fn default_tts_first_audio_ms() -> u64 {
    5_000
}

fn default_barge_in_cancel_ms() -> u64 {
    300
}

fn default_idle_secs() -> u64 {
    600
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            stt_final_ms: default_stt_final_ms(),
            retrieval_ms: default_retrieval_ms(),
            llm_first_token_ms: default_llm_first_token_ms(),
            tts_first_audio_ms: default_tts_first_audio_ms(),
            barge_in_cancel_ms: default_barge_in_cancel_ms(),
            idle_secs: default_idle_secs(),
        }
    }
}

/// Orchestrator tuning shared by every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub vad: VadSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Pre-speech buffer length in milliseconds.
    #[serde(default = "default_preroll_ms")]
    pub preroll_ms: u64,
    /// Soft-flush the sentence accumulator after this many tokens with no
    /// sentence boundary. Bounds first-audio latency.
    #[serde(default = "default_soft_flush_tokens")]
    pub soft_flush_tokens: usize,
    /// Token budget for conversation history in the LLM prompt
    /// (chars/4 estimate; oldest turns elided first).
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: usize,
    /// Spoken reply when a turn fails and the user should try again.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    /// Per-language overrides for the fallback reply, keyed by the
    /// language tag STT attaches to final transcripts (e.g. `"en"`).
    /// Falls back to `fallback_reply` for unknown or missing tags.
    #[serde(default = "default_fallback_replies")]
    pub fallback_replies: HashMap<String, String>,
    /// Maximum tool-call rounds per turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
}

fn default_preroll_ms() -> u64 {
    500
}

fn default_soft_flush_tokens() -> usize {
    40
}

fn default_history_token_budget() -> usize {
    4096
}

fn default_fallback_reply() -> String {
    "Désolé, je n'ai pas entendu.".to_string()
}

fn default_fallback_replies() -> HashMap<String, String> {
    let mut replies = HashMap::new();
    replies.insert("en".to_string(), "Sorry, I didn't catch that.".to_string());
    replies
}

fn default_max_tool_rounds() -> u32 {
    5
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            vad: VadSettings::default(),
            timeouts: TimeoutSettings::default(),
            preroll_ms: default_preroll_ms(),
            soft_flush_tokens: default_soft_flush_tokens(),
            history_token_budget: default_history_token_budget(),
            fallback_reply: default_fallback_reply(),
            fallback_replies: default_fallback_replies(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent configs
// ---------------------------------------------------------------------------

/// One capability binding: an adapter id plus its free-form options.
///
/// Options are interpreted by the adapter; unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityConfig {
    /// Stable adapter identifier, e.g. `"openai.llm"` or `"ws.stt"`.
    pub adapter: String,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

impl CapabilityConfig {
    pub fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            options: HashMap::new(),
        }
    }
}

/// A configured agent: prompt, provider bindings, optional retrieval, tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    pub stt: CapabilityConfig,
    pub llm: CapabilityConfig,
    pub tts: CapabilityConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<CapabilityConfig>,
    /// OpenAI-style tool definitions passed through to the LLM.
    #[serde(default)]
    pub tools: Vec<Value>,
}

fn default_system_prompt() -> String {
    "You are a helpful voice assistant. Keep responses short and conversational. \
     Respond in the same language the user speaks."
        .to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            stt: CapabilityConfig::new("ws.stt"),
            llm: CapabilityConfig::new("openai.llm"),
            tts: CapabilityConfig::new("ws.tts"),
            retrieval: Some(CapabilityConfig::new("none.retrieval")),
            tools: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration (`~/.voxbot/config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Agent definitions keyed by agent id.
    #[serde(default = "default_agents")]
    pub agents: HashMap<String, AgentConfig>,
}

fn default_agents() -> HashMap<String, AgentConfig> {
    let mut agents = HashMap::new();
    agents.insert("default".to_string(), AgentConfig::default());
    agents
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            agents: default_agents(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec_budgets() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.timeouts.stt_final_ms, 2_000);
        assert_eq!(cfg.timeouts.retrieval_ms, 300);
        assert_eq!(cfg.timeouts.barge_in_cancel_ms, 300);
        assert_eq!(cfg.timeouts.idle_secs, 600);
        assert_eq!(cfg.preroll_ms, 500);
        assert_eq!(cfg.soft_flush_tokens, 40);
        assert_eq!(cfg.vad.start_frames, 5);
        assert_eq!(cfg.vad.end_frames, 25);
        assert!((cfg.vad.threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_default_config_has_default_agent() {
        let cfg = Config::default();
        let agent = cfg.agents.get("default").expect("default agent");
        assert_eq!(agent.llm.adapter, "openai.llm");
        assert_eq!(agent.stt.adapter, "ws.stt");
        assert_eq!(agent.tts.adapter, "ws.tts");
    }

    #[test]
    fn test_fallback_replies_default_has_english() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.fallback_reply.starts_with("Désolé"));
        assert_eq!(
            cfg.fallback_replies.get("en").map(String::as_str),
            Some("Sorry, I didn't catch that.")
        );
        assert!(!cfg.fallback_replies.contains_key("de"));
    }

    #[test]
    fn test_camel_case_round_trip() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("softFlushTokens"));
        assert!(json.contains("sttFinalMs"));
        assert!(json.contains("systemPrompt"));

        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.server.port, cfg.server.port);
        assert_eq!(
            parsed.orchestrator.fallback_reply,
            cfg.orchestrator.fallback_reply
        );
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"server": {"port": 9000}}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.orchestrator.timeouts.llm_first_token_ms, 5_000);
    }

    #[test]
    fn test_capability_unknown_option_keys_kept() {
        let json = r#"{"adapter": "openai.llm", "options": {"model": "x", "futureKnob": 3}}"#;
        let cap: CapabilityConfig = serde_json::from_str(json).unwrap();
        // Unknown keys survive into the options map; adapters ignore them.
        assert!(cap.options.contains_key("futureKnob"));
    }
}
