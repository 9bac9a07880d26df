//! Sequence state owned by the controller.

use crate::protocol::AlignmentOffset;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Active stage of the alignment pipeline.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> AwaitingMtrs ──$MTRS ok──> AwaitingMaln ──$MALN ok──> DelayBeforeTrigger
///  ▲                   ▲                                                     │ 3 s
///  │                   │ 0.1 s                                               ▼
///  └──── done ── CycleComplete <──────────── T1 reply / timeout ──── AwaitingTrigger
/// ```
///
/// Any alarm, mismatch, timeout or `stop()` returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStep {
    /// Nothing running.
    #[default]
    Idle,
    /// MTRS sent, waiting for its completion.
    AwaitingMtrs,
    /// MALN sent, waiting for its completion.
    AwaitingMaln,
    /// Settling before the vision trigger.
    DelayBeforeTrigger,
    /// Trigger sent, waiting for the vision reply.
    AwaitingTrigger,
    /// Cycle counted; waiting to restart or finish.
    CycleComplete,
}

impl std::fmt::Display for SequenceStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequenceStep::Idle => write!(f, "Idle"),
            SequenceStep::AwaitingMtrs => write!(f, "Awaiting MTRS"),
            SequenceStep::AwaitingMaln => write!(f, "Awaiting MALN"),
            SequenceStep::DelayBeforeTrigger => write!(f, "Delay before trigger"),
            SequenceStep::AwaitingTrigger => write!(f, "Awaiting trigger"),
            SequenceStep::CycleComplete => write!(f, "Cycle complete"),
        }
    }
}

impl SequenceStep {
    /// Check if the step allows starting a sequence.
    pub fn can_start(&self) -> bool {
        matches!(self, SequenceStep::Idle)
    }
}

/// Cycle counters and run flags.
///
/// Invariant: `completed_cycles <= total_cycles` while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CycleState {
    /// Requested number of cycles.
    pub total_cycles: u32,
    /// Fully completed cycles.
    pub completed_cycles: u32,
    /// A sequence is in progress.
    pub running: bool,
    /// A stop was requested; no further sends or timer actions.
    pub stop_requested: bool,
}

impl CycleState {
    /// Zero everything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fresh state for a run of `total_cycles`.
    pub fn begin(&mut self, total_cycles: u32) {
        *self = Self {
            total_cycles,
            completed_cycles: 0,
            running: true,
            stop_requested: false,
        };
    }

    /// Count one completed cycle.
    pub fn record_completed(&mut self) {
        self.completed_cycles = self.completed_cycles.saturating_add(1).min(self.total_cycles);
    }

    /// All requested cycles are done.
    pub fn is_finished(&self) -> bool {
        self.completed_cycles >= self.total_cycles
    }

    /// Running and not stopping.
    pub fn is_active(&self) -> bool {
        self.running && !self.stop_requested
    }
}

/// Why a sequence stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every cycle completed.
    Completed,
    /// `stop()` was called.
    Requested,
    /// `emergency_stop()` was called.
    EmergencyStop,
    /// The device reported an alarm.
    Alarm,
    /// Protocol mismatch, timeout or lost link.
    Fault,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::Requested => write!(f, "stopped by operator"),
            StopReason::EmergencyStop => write!(f, "emergency stop"),
            StopReason::Alarm => write!(f, "device alarm"),
            StopReason::Fault => write!(f, "fault"),
        }
    }
}

/// Alarm held until `clear()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatchedAlarm {
    /// Alarm code.
    pub code: String,
    /// Alarm subcode.
    pub subcode: String,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceStatus {
    /// Active step.
    pub step: SequenceStep,
    /// Counters and flags.
    pub cycles: CycleState,
    /// Latched alarm, if any.
    pub latched_alarm: Option<LatchedAlarm>,
    /// Most recent MALN offset.
    pub last_offset: Option<AlignmentOffset>,
    /// When the current or last sequence started.
    pub started_at: Option<DateTime<Local>>,
    /// Time since start (frozen when the sequence stops).
    pub elapsed: Option<Duration>,
    /// A manual or clear command is awaiting its completion.
    pub command_outstanding: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idle_can_start() {
        assert!(SequenceStep::Idle.can_start());
        assert!(!SequenceStep::AwaitingTrigger.can_start());
        assert!(!SequenceStep::CycleComplete.can_start());
    }

    #[test]
    fn completed_never_exceeds_total() {
        let mut cycles = CycleState::default();
        cycles.begin(2);
        cycles.record_completed();
        assert!(!cycles.is_finished());
        cycles.record_completed();
        cycles.record_completed();
        assert_eq!(cycles.completed_cycles, 2);
        assert!(cycles.is_finished());
    }

    #[test]
    fn begin_clears_stop_flag() {
        let mut cycles = CycleState {
            total_cycles: 5,
            completed_cycles: 3,
            running: false,
            stop_requested: true,
        };
        cycles.begin(4);
        assert!(cycles.is_active());
        assert_eq!(cycles.completed_cycles, 0);
        cycles.reset();
        assert_eq!(cycles, CycleState::default());
    }
}
