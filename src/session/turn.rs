//! Turn records, conversation history, and prompt construction.

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};

use super::events::TurnSummary;

/// One user-utterance / agent-response pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub user_text: String,
    /// May be partial when the turn was interrupted or the LLM failed.
    pub assistant_text: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub interrupted: bool,
    /// The turn proceeded with zero retrieved contexts after a retrieval
    /// failure or timeout.
    pub retrieval_failed: bool,
    pub language: Option<String>,
}

impl Turn {
    pub fn summary(&self) -> TurnSummary {
        TurnSummary {
            user_text: self.user_text.clone(),
            assistant_text: self.assistant_text.clone(),
            interrupted: self.interrupted,
            retrieval_failed: self.retrieval_failed,
        }
    }
}

/// Rough token estimate: one token per four characters. Used only for
/// history budgeting, where headroom matters more than precision.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Append-only conversation history for one session.
///
/// Earlier turns are never mutated; prompt construction elides oldest turns
/// first when the token budget is exceeded.
#[derive(Default)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        debug_assert!(
            !turn.user_text.trim().is_empty() || turn.interrupted,
            "history invariant: user text non-empty or interrupted"
        );
        self.turns.push(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Build the LLM message list:
    /// 1. agent system prompt,
    /// 2. retrieved contexts as a second system message (if any),
    /// 3. history capped by `token_budget` (oldest turns elided first),
    /// 4. the current user message.
    pub fn build_messages(
        &self,
        system_prompt: &str,
        context_block: Option<&str>,
        user_text: &str,
        token_budget: usize,
    ) -> Vec<Value> {
        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        if let Some(block) = context_block {
            messages.push(json!({"role": "system", "content": block}));
        }

        // Walk backwards, newest first, until the budget is spent.
        let mut include_from = self.turns.len();
        let mut spent = 0usize;
        for (i, turn) in self.turns.iter().enumerate().rev() {
            let cost = estimate_tokens(&turn.user_text) + estimate_tokens(&turn.assistant_text);
            if spent + cost > token_budget {
                break;
            }
            spent += cost;
            include_from = i;
        }

        for turn in &self.turns[include_from..] {
            if !turn.user_text.is_empty() {
                messages.push(json!({"role": "user", "content": turn.user_text}));
            }
            if !turn.assistant_text.is_empty() {
                messages.push(json!({"role": "assistant", "content": turn.assistant_text}));
            }
        }

        messages.push(json!({"role": "user", "content": user_text}));
        messages
    }
}
