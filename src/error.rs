//! Custom error types for the prealigner.
//!
//! This module defines the primary error type, `PrealignError`, used by the protocol
//! engine, the links and the sequence controller. Using the `thiserror` crate, it
//! provides a single place where every failure the system can report is named.
//!
//! ## Error Hierarchy
//!
//! - **`TransportUnavailable`**: a command was attempted on a link that is not open.
//!   Rejected before anything is written; never retried.
//! - **`FrameMalformed`**: a received line does not match the device grammar. This is
//!   recoverable noise (a partial line split across reads) and never halts a sequence.
//! - **`ProtocolMismatch`**: a completion carried a command tag other than the one
//!   being awaited. The running sequence is halted.
//! - **`DeviceAlarm`**: the device reported a non-zero alarm/subcode on completion.
//!   The sequence is halted and the alarm latched until `clear()`.
//! - **`CommandTimeout`**: no response arrived inside the configured window.
//! - **`Config` / `Configuration`**: configuration parsing and validation failures.
//!
//! By using `#[from]`, `PrealignError` can be created from the underlying error types
//! with the `?` operator.

use crate::hardware::LinkKind;
use crate::protocol::FrameError;
use serde::Serialize;
use thiserror::Error;

/// Convenience alias for results using the prealigner error type.
pub type AppResult<T> = std::result::Result<T, PrealignError>;

/// Primary error type for the prealigner.
#[derive(Error, Debug)]
pub enum PrealignError {
    /// Command attempted with no open connection on the given link.
    #[error("{0} link is not connected")]
    TransportUnavailable(LinkKind),

    /// Received line could not be parsed as a response frame.
    #[error("Malformed frame: {0}")]
    FrameMalformed(#[from] FrameError),

    /// Completion tag does not match the command being awaited.
    #[error("Protocol mismatch: expected completion for {expected}, received {received}")]
    ProtocolMismatch {
        /// Tag of the outstanding command.
        expected: String,
        /// Tag carried by the completion frame (or `<none>`).
        received: String,
    },

    /// Device reported an alarm on completion.
    #[error("Device alarm {code} (subcode {subcode})")]
    DeviceAlarm {
        /// 4-character alarm code.
        code: String,
        /// 4-character alarm subcode.
        subcode: String,
    },

    /// No response within the bounded window.
    #[error("Timed out waiting for response to {command}")]
    CommandTimeout {
        /// Symbolic name of the command that timed out.
        command: String,
    },

    /// Symbolic command name not present in the command table.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Operation not permitted in the controller's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Cycle count is zero or below the number of completed cycles.
    #[error("Invalid cycle count {requested} (completed {completed})")]
    InvalidCycleCount {
        /// Requested total.
        requested: u32,
        /// Cycles already completed.
        completed: u32,
    },

    /// An alarm is latched and must be cleared before the sequence may start.
    #[error("Alarm {code}/{subcode} is latched; clear it before starting")]
    AlarmLatched {
        /// Latched alarm code.
        code: String,
        /// Latched alarm subcode.
        subcode: String,
    },

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure on a link or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    /// The sequence actor has shut down.
    #[error("Sequence controller is no longer running")]
    ControllerUnavailable,
}

impl From<figment::Error> for PrealignError {
    fn from(value: figment::Error) -> Self {
        PrealignError::Config(Box::new(value))
    }
}

/// Stable label for an error, carried in structured events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`PrealignError::TransportUnavailable`].
    TransportUnavailable,
    /// See [`PrealignError::FrameMalformed`].
    FrameMalformed,
    /// See [`PrealignError::ProtocolMismatch`].
    ProtocolMismatch,
    /// See [`PrealignError::DeviceAlarm`].
    DeviceAlarm,
    /// See [`PrealignError::CommandTimeout`].
    CommandTimeout,
    /// Anything else.
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::TransportUnavailable => "transport_unavailable",
            ErrorKind::FrameMalformed => "frame_malformed",
            ErrorKind::ProtocolMismatch => "protocol_mismatch",
            ErrorKind::DeviceAlarm => "device_alarm",
            ErrorKind::CommandTimeout => "command_timeout",
            ErrorKind::Other => "other",
        };
        write!(f, "{}", label)
    }
}

impl PrealignError {
    /// Classify this error for event reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrealignError::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            PrealignError::FrameMalformed(_) => ErrorKind::FrameMalformed,
            PrealignError::ProtocolMismatch { .. } => ErrorKind::ProtocolMismatch,
            PrealignError::DeviceAlarm { .. } | PrealignError::AlarmLatched { .. } => {
                ErrorKind::DeviceAlarm
            }
            PrealignError::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            _ => ErrorKind::Other,
        }
    }

    /// Whether the sequence must halt when this error is raised mid-cycle.
    ///
    /// Only malformed frames are recoverable noise.
    pub fn halts_sequence(&self) -> bool {
        !matches!(self, PrealignError::FrameMalformed(_))
    }
}
