//! Prealigner wire protocol.
//!
//! Pure, stateless transformations between symbolic commands, wire bytes and
//! classified responses:
//!
//! ```text
//! CommandTable::encode ──> bytes ──> link
//! link ──> line ──> decode ──> ResponseFrame ──> classify ──> Outcome
//! ```

pub mod command;
pub mod frame;
pub mod outcome;
pub mod vision;

pub use command::{encode_raw, CommandEntry, CommandTable, CommandTag, TERMINATOR};
pub use frame::{decode, AlignmentOffset, FrameError, Marker, ResponseFrame, SUCCESS_CODE};
pub use outcome::{classify, Outcome};
pub use vision::{interpret_reply, split_replies, ReplyTimeoutPolicy, TriggerReply, TRIGGER_ACK};
