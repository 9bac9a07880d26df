//! Alignment cycle sequencing.
//!
//! - [`state`]: steps, counters and status snapshots
//! - [`scheduler`]: the controller's deadline queue
//! - [`controller`]: the synchronous state machine
//! - [`actor`]: the task that owns the controller and its links

pub mod actor;
pub mod controller;
pub mod scheduler;
pub mod state;

pub use actor::{SequenceActor, SequenceHandle, COMMAND_CHANNEL_CAPACITY};
pub use controller::{
    ControllerSettings, SequenceController, CYCLE_RESTART_DELAY, TRIGGER_SETTLE_DELAY,
};
pub use scheduler::{DeadlineQueue, TimerKind, TimerToken};
pub use state::{CycleState, LatchedAlarm, SequenceStatus, SequenceStep, StopReason};
