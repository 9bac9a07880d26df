//! Response classification.

use super::frame::{Marker, ResponseFrame, SUCCESS_CODE};
use serde::Serialize;

/// What a response frame means for the command awaiting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// `@` frame: the device received the command.
    Acknowledged,
    /// `$` frame: the command finished, successfully or with an alarm.
    Completed {
        /// True iff alarm code + subcode is `00000000`.
        success: bool,
        /// Alarm code.
        alarm_code: String,
        /// Alarm subcode.
        alarm_subcode: String,
    },
}

impl Outcome {
    /// True for a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed { success: true, .. })
    }

    /// Alarm code and subcode of a failed completion.
    pub fn alarm(&self) -> Option<(&str, &str)> {
        match self {
            Outcome::Completed {
                success: false,
                alarm_code,
                alarm_subcode,
            } => Some((alarm_code.as_str(), alarm_subcode.as_str())),
            _ => None,
        }
    }
}

/// Classify a frame on its marker and alarm fields alone.
///
/// The completed-command tag is deliberately ignored here; matching it against
/// the awaited command is the sequence controller's job.
pub fn classify(frame: &ResponseFrame) -> Outcome {
    match frame.marker {
        Marker::Acknowledgement => Outcome::Acknowledged,
        Marker::Completion => Outcome::Completed {
            success: frame.alarm_field() == SUCCESS_CODE,
            alarm_code: frame.alarm_code.clone(),
            alarm_subcode: frame.alarm_subcode.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::decode;

    #[test]
    fn acknowledgement_ignores_alarm_fields() {
        let frame = decode("@2300050002015").unwrap();
        assert_eq!(classify(&frame), Outcome::Acknowledged);
    }

    #[test]
    fn zero_alarm_field_is_success() {
        let outcome = classify(&decode("$23200000000MTRS5D").unwrap());
        assert!(outcome.is_success());
        assert_eq!(outcome.alarm(), None);
    }

    #[test]
    fn every_nonzero_alarm_field_is_failure() {
        for (code, sub) in [("0005", "0002"), ("0000", "0001"), ("1000", "0000"), ("00A0", "0000")] {
            let line = format!("$232{code}{sub}MTRS5D");
            let outcome = classify(&decode(&line).unwrap());
            assert!(!outcome.is_success(), "{line}");
            assert_eq!(outcome.alarm(), Some((code, sub)));
        }
    }

    #[test]
    fn missing_tag_still_classified() {
        let outcome = classify(&decode("$232000500021F").unwrap());
        assert_eq!(
            outcome,
            Outcome::Completed {
                success: false,
                alarm_code: "0005".into(),
                alarm_subcode: "0002".into(),
            }
        );
    }
}
