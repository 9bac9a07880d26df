//! Message types for actor-based communication.
//!
//! Collaborators (the CLI, a GUI) never touch the [`SequenceController`]
//! directly. They send [`ControlCommand`]s to the
//! [`SequenceActor`](crate::sequence::SequenceActor) over an mpsc channel, and
//! each command carries a oneshot sender for its response.
//!
//! # Message Flow
//!
//! ```text
//! Caller                             Actor Task
//! ------                             ----------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                    3. Receive command
//!                                    4. Apply to controller
//!                                    5. Send response
//! 6. Await oneshot receiver   <------
//! ```
//!
//! Each variant has a helper that builds the command and returns the receiver:
//!
//! ```rust
//! use prealigner::messages::ControlCommand;
//!
//! let (cmd, rx) = ControlCommand::start(10);
//! // cmd_tx.send(cmd).await?;
//! // let result = rx.await?;
//! ```
//!
//! [`SequenceController`]: crate::sequence::SequenceController

use crate::error::AppResult;
use crate::hardware::{DynLink, LinkKind};
use crate::sequence::SequenceStatus;
use tokio::sync::oneshot;

/// Commands accepted by the sequence actor.
pub enum ControlCommand {
    /// Start a sequence of `total_cycles` cycles.
    Start {
        /// Requested number of cycles.
        total_cycles: u32,
        /// Start result.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Stop the running sequence. Always succeeds.
    Stop {
        /// Acknowledgement.
        response: oneshot::Sender<()>,
    },

    /// Stop and send the device emergency stop.
    EmergencyStop {
        /// Result of sending `CEMG`.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Send the device clear command and release the alarm latch.
    Clear {
        /// Result of sending `CCLR`.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Zero the cycle state (idle only).
    Reset {
        /// Reset result.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Change the requested number of cycles.
    UpdateTotalCycles {
        /// New total.
        total_cycles: u32,
        /// Update result.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Send a command from the table by name.
    SendCommand {
        /// Symbolic name, e.g. `MTRS`, `ChuckHold`, `NextCamera`.
        name: String,
        /// Send result.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Send raw text on a link.
    SendRaw {
        /// Target link.
        link: LinkKind,
        /// Text, sent verbatim with CR LF appended.
        text: String,
        /// Send result.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Hand an open stream to a link.
    Attach {
        /// Target link.
        link: LinkKind,
        /// The stream.
        stream: DynLink,
        /// Port name or address, for logs.
        label: String,
        /// Acknowledgement.
        response: oneshot::Sender<()>,
    },

    /// Close a link.
    Detach {
        /// Target link.
        link: LinkKind,
        /// Acknowledgement.
        response: oneshot::Sender<()>,
    },

    /// Snapshot of the controller state.
    Status {
        /// The snapshot.
        response: oneshot::Sender<SequenceStatus>,
    },

    /// Stop everything, close both links and end the actor.
    Shutdown {
        /// Acknowledgement, sent before the actor exits.
        response: oneshot::Sender<()>,
    },
}

impl std::fmt::Debug for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlCommand::Start { total_cycles, .. } => {
                write!(f, "Start {{ total_cycles: {total_cycles} }}")
            }
            ControlCommand::Stop { .. } => write!(f, "Stop"),
            ControlCommand::EmergencyStop { .. } => write!(f, "EmergencyStop"),
            ControlCommand::Clear { .. } => write!(f, "Clear"),
            ControlCommand::Reset { .. } => write!(f, "Reset"),
            ControlCommand::UpdateTotalCycles { total_cycles, .. } => {
                write!(f, "UpdateTotalCycles {{ total_cycles: {total_cycles} }}")
            }
            ControlCommand::SendCommand { name, .. } => write!(f, "SendCommand {{ name: {name:?} }}"),
            ControlCommand::SendRaw { link, text, .. } => {
                write!(f, "SendRaw {{ link: {link}, text: {text:?} }}")
            }
            ControlCommand::Attach { link, label, .. } => {
                write!(f, "Attach {{ link: {link}, label: {label:?} }}")
            }
            ControlCommand::Detach { link, .. } => write!(f, "Detach {{ link: {link} }}"),
            ControlCommand::Status { .. } => write!(f, "Status"),
            ControlCommand::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

impl ControlCommand {
    /// Creates a `Start` command.
    pub fn start(total_cycles: u32) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Start {
                total_cycles,
                response: tx,
            },
            rx,
        )
    }

    /// Creates a `Stop` command.
    pub fn stop() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }

    /// Creates an `EmergencyStop` command.
    pub fn emergency_stop() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::EmergencyStop { response: tx }, rx)
    }

    /// Creates a `Clear` command.
    pub fn clear() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Clear { response: tx }, rx)
    }

    /// Creates a `Reset` command.
    pub fn reset() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Reset { response: tx }, rx)
    }

    /// Creates an `UpdateTotalCycles` command.
    pub fn update_total_cycles(total_cycles: u32) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::UpdateTotalCycles {
                total_cycles,
                response: tx,
            },
            rx,
        )
    }

    /// Creates a `SendCommand` command.
    pub fn send_command(name: impl Into<String>) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SendCommand {
                name: name.into(),
                response: tx,
            },
            rx,
        )
    }

    /// Creates a `SendRaw` command.
    pub fn send_raw(
        link: LinkKind,
        text: impl Into<String>,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SendRaw {
                link,
                text: text.into(),
                response: tx,
            },
            rx,
        )
    }

    /// Creates an `Attach` command.
    pub fn attach(
        link: LinkKind,
        stream: DynLink,
        label: impl Into<String>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Attach {
                link,
                stream,
                label: label.into(),
                response: tx,
            },
            rx,
        )
    }

    /// Creates a `Detach` command.
    pub fn detach(link: LinkKind) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Detach { link, response: tx }, rx)
    }

    /// Creates a `Status` command.
    pub fn status() -> (Self, oneshot::Receiver<SequenceStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::Status { response: tx }, rx)
    }

    /// Creates a `Shutdown` command.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn helper_returns_matching_receiver() {
        let (cmd, rx) = ControlCommand::start(4);
        match cmd {
            ControlCommand::Start {
                total_cycles,
                response,
            } => {
                assert_eq!(total_cycles, 4);
                response.send(Ok(())).unwrap();
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn debug_omits_channels() {
        let (cmd, _rx) = ControlCommand::send_raw(LinkKind::Serial, "$2STAT");
        assert_eq!(format!("{cmd:?}"), "SendRaw { link: Serial, text: \"$2STAT\" }");
    }
}
