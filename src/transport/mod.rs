//! Media transport: bidirectional PCM between the peer and the session.
//!
//! The orchestrator is written against decoded frames, not wire formats:
//! anything that can deliver raw PCM chunks into the session queue and
//! drain outbound canonical frames is a valid binding. The concrete binding
//! shipped here is a WebSocket carrying 16 kHz int16 little-endian PCM in
//! chunks of at most 100 ms (peer-to-peer media arrives the same way from
//! the signaling layer, which is out of scope).

pub mod ws;

/// Inbound control messages a transport may carry alongside audio.
///
/// Binary frames are audio; text frames are JSON control messages of this
/// shape. Unknown types are ignored.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportControl {
    /// The peer detected an input gap of roughly `lost_ms` milliseconds.
    Discontinuity {
        #[serde(default)]
        lost_ms: u64,
    },
}

/// Parse a transport text message. `None` for unknown or malformed input.
pub fn parse_control(text: &str) -> Option<TransportControl> {
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discontinuity() {
        match parse_control(r#"{"type":"discontinuity","lost_ms":120}"#) {
            Some(TransportControl::Discontinuity { lost_ms }) => assert_eq!(lost_ms, 120),
            _ => panic!("expected discontinuity"),
        }
    }

    #[test]
    fn test_parse_unknown_is_none() {
        assert!(parse_control(r#"{"type":"mystery"}"#).is_none());
        assert!(parse_control("not json").is_none());
    }
}
