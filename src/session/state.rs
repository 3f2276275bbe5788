//! The turn-taking state machine's states and legal transitions.
//!
//! The scheduler is the only writer; every state change goes through
//! [`is_legal_transition`] (a debug assertion in test builds, a warning in
//! release) so an illegal edge can never slip in silently.

use serde::Serialize;

/// Session states. Initial state is `Idle`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No user speech, no agent response. VAD and the pre-speech buffer are
    /// active; STT is closed.
    Idle,
    /// VAD fired start; STT is open and receiving frames.
    Listening,
    /// Final transcript received; retrieval and the LLM are in flight.
    Thinking,
    /// TTS is producing audio; barge-in is being watched for.
    Speaking,
    /// Unrecoverable session fault; transitions to `Closed`.
    Error,
    /// Terminal.
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from → to` is an edge of the state machine.
///
/// Beyond the main conversational cycle this admits the recovery edges:
/// fallback speech from `Listening`/`Thinking` (spoken apology), barge-in
/// from `Speaking`/`Thinking` back to `Listening`, and `Error`/`Closed`
/// from anywhere.
pub fn is_legal_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        // Terminal states never transition out.
        (Closed, _) => false,
        (Error, Closed) => true,
        (Error, _) => false,
        // Faults and teardown are reachable from any live state.
        (_, Error) | (_, Closed) => true,
        // The conversational cycle.
        (Idle, Listening) => true,
        (Idle, Thinking) => true, // text-mode input
        (Listening, Thinking) => true,
        (Listening, Idle) => true,     // empty/timed-out transcript
        (Listening, Speaking) => true, // spoken fallback after STT failure
        (Thinking, Speaking) => true,
        (Thinking, Idle) => true, // empty LLM response
        (Thinking, Listening) => true, // barge-in before first audio
        (Speaking, Idle) => true,
        (Speaking, Listening) => true, // barge-in
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 6] = [Idle, Listening, Thinking, Speaking, Error, Closed];

    #[test]
    fn test_main_cycle_is_legal() {
        assert!(is_legal_transition(Idle, Listening));
        assert!(is_legal_transition(Listening, Thinking));
        assert!(is_legal_transition(Thinking, Speaking));
        assert!(is_legal_transition(Speaking, Idle));
    }

    #[test]
    fn test_barge_in_edges() {
        assert!(is_legal_transition(Speaking, Listening));
        assert!(is_legal_transition(Thinking, Listening));
    }

    #[test]
    fn test_closed_is_terminal() {
        for to in ALL {
            assert!(!is_legal_transition(Closed, to), "closed -> {}", to);
        }
    }

    #[test]
    fn test_error_only_closes() {
        assert!(is_legal_transition(Error, Closed));
        for to in [Idle, Listening, Thinking, Speaking, Error] {
            assert!(!is_legal_transition(Error, to), "error -> {}", to);
        }
    }

    #[test]
    fn test_no_skipping_forward() {
        assert!(!is_legal_transition(Idle, Speaking));
        assert!(!is_legal_transition(Speaking, Thinking));
        assert!(!is_legal_transition(Thinking, Thinking));
    }

    #[test]
    fn test_every_live_state_can_fail() {
        for from in [Idle, Listening, Thinking, Speaking] {
            assert!(is_legal_transition(from, Error));
            assert!(is_legal_transition(from, Closed));
        }
    }

    #[test]
    fn test_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&Listening).unwrap(), "\"listening\"");
    }
}
