//! Vision trigger protocol.
//!
//! The vision system takes short ASCII requests over TCP (`T1`, `T2`, `FW,PV`,
//! `FW,NX`) and answers a trigger with `T1`. Replies are not reliably line
//! terminated, so each received chunk is split on CR/LF and trimmed.

use serde::{Deserialize, Serialize};

/// Reply the vision system sends for an accepted trigger.
pub const TRIGGER_ACK: &str = "T1";

/// Interpretation of a trigger reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reply", content = "text", rename_all = "snake_case")]
pub enum TriggerReply {
    /// Exactly `T1`.
    Expected,
    /// Anything else. Still accepted as the acknowledgement, but reported.
    Unexpected(String),
}

/// Interpret one reply from the vision system.
pub fn interpret_reply(text: &str) -> TriggerReply {
    let text = text.trim();
    if text == TRIGGER_ACK {
        TriggerReply::Expected
    } else {
        TriggerReply::Unexpected(text.to_string())
    }
}

/// Split a received chunk into individual replies.
pub fn split_replies(chunk: &str) -> Vec<String> {
    chunk
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// What to do when no trigger reply arrives in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyTimeoutPolicy {
    /// Treat the timeout as the acknowledgement and finish the cycle.
    #[default]
    CountAsAcknowledged,
    /// Halt the sequence with a command timeout.
    Halt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_t1_is_expected() {
        assert_eq!(interpret_reply("T1\r\n"), TriggerReply::Expected);
        assert_eq!(
            interpret_reply("ER,T1,03"),
            TriggerReply::Unexpected("ER,T1,03".into())
        );
        assert_eq!(interpret_reply(""), TriggerReply::Unexpected(String::new()));
    }

    #[test]
    fn chunks_split_on_line_breaks() {
        assert_eq!(split_replies("T1\r"), vec!["T1"]);
        assert_eq!(split_replies("T1\r\nFW\r\n"), vec!["T1", "FW"]);
        assert!(split_replies("\r\n").is_empty());
    }

    #[test]
    fn policy_parses_from_config_names() {
        let policy: ReplyTimeoutPolicy = serde_json::from_str("\"halt\"").unwrap();
        assert_eq!(policy, ReplyTimeoutPolicy::Halt);
        assert_eq!(ReplyTimeoutPolicy::default(), ReplyTimeoutPolicy::CountAsAcknowledged);
    }
}
