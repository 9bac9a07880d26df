//! The alignment sequence state machine.
//!
//! [`SequenceController`] is synchronous and owns every piece of sequence state.
//! It never sleeps and never reads from a link: the owner (normally
//! [`SequenceActor`](super::SequenceActor)) feeds it received lines, vision
//! replies and the current time, and asks it when the next deadline is due.
//! Every entry point takes `now` explicitly, which keeps transitions
//! deterministic under test.
//!
//! Only one serial command is outstanding at a time. Completions are matched
//! against it; frames that arrive with nothing outstanding are dropped.

use super::scheduler::{DeadlineQueue, TimerKind, TimerToken};
use super::state::{CycleState, LatchedAlarm, SequenceStatus, SequenceStep, StopReason};
use crate::alarms::{format_alarm_report, AlarmCatalog};
use crate::error::{AppResult, PrealignError};
use crate::hardware::{LineTransport, LinkKind};
use crate::notify::{Direction, LogChannel, NotificationSink, SequenceEvent};
use crate::protocol::{
    classify, decode, encode_raw, interpret_reply, AlignmentOffset, CommandTable, CommandTag,
    Outcome, ReplyTimeoutPolicy, ResponseFrame, TriggerReply,
};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Settle time between a successful MALN and the vision trigger.
pub const TRIGGER_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Pause between the end of one cycle and the next MTRS.
pub const CYCLE_RESTART_DELAY: Duration = Duration::from_millis(100);

/// Name of the vision trigger in the command table.
const TRIGGER_COMMAND: &str = "T1";

/// Tunable timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Bound on waiting for a serial completion.
    pub command_timeout: Duration,
    /// Bound on waiting for the vision trigger reply.
    pub reply_timeout: Duration,
    /// What a missing trigger reply means.
    pub on_reply_timeout: ReplyTimeoutPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(5),
            on_reply_timeout: ReplyTimeoutPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Sequence,
    Manual,
}

#[derive(Debug, Clone)]
struct Outstanding {
    label: String,
    tag: Option<CommandTag>,
    origin: Origin,
    timeout: TimerToken,
}

/// Drives the MTRS → MALN → settle → trigger cycle.
pub struct SequenceController {
    serial: Arc<dyn LineTransport>,
    vision: Arc<dyn LineTransport>,
    sink: Arc<dyn NotificationSink>,
    catalog: Arc<dyn AlarmCatalog>,
    table: CommandTable,
    settings: ControllerSettings,

    step: SequenceStep,
    cycles: CycleState,
    timers: DeadlineQueue,
    outstanding: Option<Outstanding>,
    latched: Option<LatchedAlarm>,
    last_offset: Option<AlignmentOffset>,
    started_at: Option<DateTime<Local>>,
    started: Option<Instant>,
    stopped_after: Option<Duration>,
}

impl SequenceController {
    /// Create an idle controller.
    pub fn new(
        serial: Arc<dyn LineTransport>,
        vision: Arc<dyn LineTransport>,
        sink: Arc<dyn NotificationSink>,
        catalog: Arc<dyn AlarmCatalog>,
        table: CommandTable,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            serial,
            vision,
            sink,
            catalog,
            table,
            settings,
            step: SequenceStep::Idle,
            cycles: CycleState::default(),
            timers: DeadlineQueue::new(),
            outstanding: None,
            latched: None,
            last_offset: None,
            started_at: None,
            started: None,
            stopped_after: None,
        }
    }

    /// Active step.
    pub fn step(&self) -> SequenceStep {
        self.step
    }

    /// Cycle counters and flags.
    pub fn cycles(&self) -> CycleState {
        self.cycles
    }

    /// Latched alarm, if any.
    pub fn latched_alarm(&self) -> Option<&LatchedAlarm> {
        self.latched.as_ref()
    }

    /// Command table in use.
    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Earliest pending deadline; the owner should call [`tick`](Self::tick) then.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Snapshot for display.
    pub fn status(&self, now: Instant) -> SequenceStatus {
        let elapsed = match (self.cycles.running, self.started) {
            (true, Some(started)) => Some(now.saturating_duration_since(started)),
            _ => self.stopped_after,
        };
        SequenceStatus {
            step: self.step,
            cycles: self.cycles,
            latched_alarm: self.latched.clone(),
            last_offset: self.last_offset,
            started_at: self.started_at,
            elapsed,
            command_outstanding: self.outstanding.is_some(),
        }
    }

    // ---------------------------------------------------------------------
    // Operator commands
    // ---------------------------------------------------------------------

    /// Start a run of `total_cycles` cycles.
    ///
    /// Valid only from `Idle` with no latched alarm, no outstanding command and
    /// both links open.
    #[instrument(skip(self, now))]
    pub fn start(&mut self, total_cycles: u32, now: Instant) -> AppResult<()> {
        if !self.step.can_start() || self.cycles.running {
            return Err(PrealignError::InvalidState(format!(
                "cannot start while {}",
                self.step
            )));
        }
        if let Some(alarm) = &self.latched {
            return Err(PrealignError::AlarmLatched {
                code: alarm.code.clone(),
                subcode: alarm.subcode.clone(),
            });
        }
        if let Some(pending) = &self.outstanding {
            return Err(PrealignError::InvalidState(format!(
                "{} is still awaiting completion",
                pending.label
            )));
        }
        if total_cycles == 0 {
            return Err(PrealignError::InvalidCycleCount {
                requested: 0,
                completed: 0,
            });
        }
        for link in [&self.serial, &self.vision] {
            if !link.is_open() {
                return Err(PrealignError::TransportUnavailable(link.kind()));
            }
        }

        self.timers.cancel_all();
        self.cycles.begin(total_cycles);
        self.started_at = Some(Local::now());
        self.started = Some(now);
        self.stopped_after = None;

        info!(total_cycles, "Sequence started");
        self.note(format!("Sequence started: {total_cycles} cycle(s)"));
        self.sink
            .notify(SequenceEvent::SequenceStarted { total_cycles });
        self.notify_progress();

        if let Err(e) = self.send_step(CommandTag::Mtrs, SequenceStep::AwaitingMtrs, now) {
            self.fail(&e, now);
            return Err(e);
        }
        Ok(())
    }

    /// Stop the sequence. Idempotent: only the first call reports anything.
    pub fn stop(&mut self, now: Instant) {
        self.cycles.stop_requested = true;
        self.halt(StopReason::Requested, now);
    }

    /// Stop immediately and send the device emergency stop.
    ///
    /// Emits [`SequenceEvent::EmergencyStopRequested`]; the operator confirms by
    /// calling [`clear`](Self::clear).
    pub fn emergency_stop(&mut self, now: Instant) -> AppResult<()> {
        warn!("Emergency stop requested");
        self.cycles.stop_requested = true;
        self.halt(StopReason::EmergencyStop, now);
        self.sink.notify(SequenceEvent::EmergencyStopRequested);
        self.send_priority(CommandTag::Cemg, now)
    }

    /// Send the device clear command and release the alarm latch.
    ///
    /// This is the only way to resume after an alarm.
    pub fn clear(&mut self, now: Instant) -> AppResult<()> {
        if self.cycles.running {
            return Err(PrealignError::InvalidState(
                "cannot clear while a sequence is running".into(),
            ));
        }
        self.send_priority(CommandTag::Cclr, now)?;
        if let Some(alarm) = self.latched.take() {
            info!(code = %alarm.code, subcode = %alarm.subcode, "Alarm cleared");
            self.note(format!("Alarm {} cleared", alarm.code));
            self.sink.notify(SequenceEvent::AlarmCleared);
        }
        Ok(())
    }

    /// Zero the cycle state. Valid only from `Idle`.
    pub fn reset(&mut self) -> AppResult<()> {
        if self.step != SequenceStep::Idle || self.cycles.running {
            return Err(PrealignError::InvalidState(format!(
                "cannot reset while {}",
                self.step
            )));
        }
        self.timers.cancel_all();
        self.outstanding = None;
        self.cycles.reset();
        self.notify_progress();
        Ok(())
    }

    /// Change the requested number of cycles.
    ///
    /// While running, the new total must exceed the cycles already completed.
    pub fn update_total_cycles(&mut self, total_cycles: u32) -> AppResult<()> {
        let completed = self.cycles.completed_cycles;
        let too_low = if self.cycles.running {
            total_cycles <= completed
        } else {
            total_cycles < completed
        };
        if total_cycles == 0 || too_low {
            return Err(PrealignError::InvalidCycleCount {
                requested: total_cycles,
                completed,
            });
        }
        self.cycles.total_cycles = total_cycles;
        self.notify_progress();
        Ok(())
    }

    /// Send a table command by name while no sequence is running.
    ///
    /// Serial commands occupy the outstanding slot until they complete or
    /// time out; vision commands are fire-and-forget.
    pub fn send_named(&mut self, name: &str, now: Instant) -> AppResult<()> {
        let entry = self.table.entry(name)?.clone();
        match entry.link {
            LinkKind::Vision => self.send_vision_manual(&entry.payload),
            LinkKind::Serial => self.send_manual(&entry.name, &entry.payload, entry.tag, now),
        }
    }

    /// Send raw text on the serial link while no sequence is running.
    ///
    /// If the text matches a table payload, its completion is tag-checked.
    pub fn send_raw(&mut self, text: &str, now: Instant) -> AppResult<()> {
        let text = text.trim();
        let tag = self
            .table
            .iter()
            .find(|entry| entry.link == LinkKind::Serial && entry.payload == text)
            .and_then(|entry| entry.tag);
        self.send_manual(text, text, tag, now)
    }

    /// Send raw text on the vision link while no sequence is running.
    pub fn send_vision_raw(&mut self, text: &str) -> AppResult<()> {
        self.send_vision_manual(text.trim())
    }

    // ---------------------------------------------------------------------
    // Inputs
    // ---------------------------------------------------------------------

    /// Handle one line received on the serial link.
    #[instrument(skip(self, now), fields(step = %self.step))]
    pub fn on_serial_line(&mut self, line: &str, now: Instant) {
        let frame = match decode(line) {
            Ok(frame) => frame,
            Err(e) => {
                let err = PrealignError::from(e);
                warn!(%line, error = %err, "Discarding malformed frame");
                self.note(format!("Discarded '{}': {err}", line.trim()));
                return;
            }
        };

        let Some(pending) = &self.outstanding else {
            debug!(%line, "No command outstanding; frame dropped");
            self.note(format!("Ignored '{}': no command outstanding", line.trim()));
            return;
        };

        match classify(&frame) {
            Outcome::Acknowledged => {
                debug!(command = %pending.label, unit = %frame.unit, "Acknowledged");
            }
            Outcome::Completed {
                success,
                alarm_code,
                alarm_subcode,
            } => {
                let Some(pending) = self.outstanding.take() else {
                    return;
                };
                self.timers.cancel(pending.timeout);

                if !success {
                    self.raise_alarm(&pending, alarm_code, alarm_subcode, now);
                    return;
                }

                if let Some(expected) = pending.tag {
                    if frame.tag != Some(expected) {
                        let received = frame
                            .tag
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "<none>".to_string());
                        self.fail(
                            &PrealignError::ProtocolMismatch {
                                expected: expected.to_string(),
                                received,
                            },
                            now,
                        );
                        return;
                    }
                }

                match pending.origin {
                    Origin::Manual => {
                        info!(command = %pending.label, "Command completed");
                        self.note(format!("{} completed", pending.label));
                    }
                    Origin::Sequence => self.advance(pending.tag, &frame, now),
                }
            }
        }
    }

    /// Handle one reply received on the vision link.
    pub fn on_vision_reply(&mut self, text: &str, now: Instant) {
        if self.step != SequenceStep::AwaitingTrigger || !self.cycles.is_active() {
            debug!(%text, "Vision reply outside trigger wait");
            return;
        }
        self.timers.cancel_kind(TimerKind::TriggerReplyTimeout);

        if let TriggerReply::Unexpected(other) = interpret_reply(text) {
            warn!(reply = %other, "Unexpected vision reply treated as acknowledgement");
            self.note(format!(
                "Unexpected vision reply '{other}', treated as acknowledgement"
            ));
        }
        self.complete_cycle(now);
    }

    /// Handle a link closing underneath the controller.
    pub fn on_link_closed(&mut self, kind: LinkKind, now: Instant) {
        warn!(link = %kind, "Link closed");
        if kind == LinkKind::Serial {
            if let Some(pending) = self.outstanding.take() {
                self.timers.cancel(pending.timeout);
            }
        }
        if self.cycles.running {
            self.fail(&PrealignError::TransportUnavailable(kind), now);
        }
    }

    /// Run every deadline that has expired by `now`.
    pub fn tick(&mut self, now: Instant) {
        while let Some((_, kind)) = self.timers.pop_expired(now) {
            self.on_timer(kind, now);
        }
    }

    fn on_timer(&mut self, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::CommandTimeout => {
                let Some(pending) = self.outstanding.take() else {
                    return;
                };
                self.fail(
                    &PrealignError::CommandTimeout {
                        command: pending.label,
                    },
                    now,
                );
            }
            TimerKind::TriggerSettle => {
                if !self.cycles.is_active() || self.step != SequenceStep::DelayBeforeTrigger {
                    return;
                }
                self.send_trigger(now);
            }
            TimerKind::TriggerReplyTimeout => {
                if !self.cycles.is_active() || self.step != SequenceStep::AwaitingTrigger {
                    return;
                }
                let counted =
                    self.settings.on_reply_timeout == ReplyTimeoutPolicy::CountAsAcknowledged;
                warn!(counted, "No vision reply within {:?}", self.settings.reply_timeout);
                self.sink.notify(SequenceEvent::TriggerTimedOut {
                    counted_as_acknowledged: counted,
                });
                if counted {
                    self.note("Vision reply timed out; counted as acknowledgement".into());
                    self.complete_cycle(now);
                } else {
                    self.fail(
                        &PrealignError::CommandTimeout {
                            command: TRIGGER_COMMAND.to_string(),
                        },
                        now,
                    );
                }
            }
            TimerKind::CycleRestart => {
                if !self.cycles.is_active() || self.step != SequenceStep::CycleComplete {
                    return;
                }
                if let Err(e) = self.send_step(CommandTag::Mtrs, SequenceStep::AwaitingMtrs, now) {
                    self.fail(&e, now);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    fn advance(&mut self, tag: Option<CommandTag>, frame: &ResponseFrame, now: Instant) {
        if !self.cycles.is_active() {
            return;
        }
        match tag {
            Some(CommandTag::Mtrs) => {
                if let Err(e) = self.send_step(CommandTag::Maln, SequenceStep::AwaitingMaln, now) {
                    self.fail(&e, now);
                }
            }
            Some(CommandTag::Maln) => {
                self.record_offset(frame);
                self.timers
                    .schedule(now + TRIGGER_SETTLE_DELAY, TimerKind::TriggerSettle);
                self.set_step(SequenceStep::DelayBeforeTrigger);
            }
            other => debug!(?other, "Completion outside the pipeline"),
        }
    }

    fn record_offset(&mut self, frame: &ResponseFrame) {
        match frame.alignment_offset() {
            Some(Ok(offset)) => {
                info!(%offset, "Wafer offset measured");
                self.last_offset = Some(offset);
                self.note(format!("Offset {offset}"));
                self.sink.notify(SequenceEvent::OffsetMeasured {
                    distance_mm: offset.distance_mm,
                    angle_deg: offset.angle_deg,
                });
            }
            Some(Err(e)) => {
                warn!(error = %e, "Unparseable MALN offset");
                self.note(format!("Unparseable MALN offset: {e}"));
            }
            None => warn!("MALN completion carried no offset fields"),
        }
    }

    fn send_trigger(&mut self, now: Instant) {
        let result = self
            .table
            .encode(TRIGGER_COMMAND)
            .and_then(|bytes| self.vision.send(bytes));
        match result {
            Ok(()) => {
                self.timers.schedule(
                    now + self.settings.reply_timeout,
                    TimerKind::TriggerReplyTimeout,
                );
                self.set_step(SequenceStep::AwaitingTrigger);
            }
            Err(e) => self.fail(&e, now),
        }
    }

    fn complete_cycle(&mut self, now: Instant) {
        self.cycles.record_completed();
        self.set_step(SequenceStep::CycleComplete);
        info!(
            completed = self.cycles.completed_cycles,
            total = self.cycles.total_cycles,
            "Cycle complete"
        );
        self.note(format!(
            "Cycle {}/{} complete",
            self.cycles.completed_cycles, self.cycles.total_cycles
        ));
        self.notify_progress();

        if self.cycles.is_finished() {
            self.halt(StopReason::Completed, now);
        } else {
            self.timers
                .schedule(now + CYCLE_RESTART_DELAY, TimerKind::CycleRestart);
        }
    }

    /// Send a pipeline command and wait for its completion in `step`.
    fn send_step(&mut self, tag: CommandTag, step: SequenceStep, now: Instant) -> AppResult<()> {
        if !self.cycles.is_active() {
            return Ok(());
        }
        let bytes = self.table.encode(tag.as_str())?;
        self.serial.send(bytes)?;
        let timeout = self
            .timers
            .schedule(now + self.settings.command_timeout, TimerKind::CommandTimeout);
        self.outstanding = Some(Outstanding {
            label: tag.to_string(),
            tag: Some(tag),
            origin: Origin::Sequence,
            timeout,
        });
        self.set_step(step);
        Ok(())
    }

    fn ensure_manual_allowed(&self) -> AppResult<()> {
        if self.cycles.running {
            return Err(PrealignError::InvalidState(
                "manual commands are disabled while a sequence is running".into(),
            ));
        }
        Ok(())
    }

    fn send_manual(
        &mut self,
        label: &str,
        payload: &str,
        tag: Option<CommandTag>,
        now: Instant,
    ) -> AppResult<()> {
        self.ensure_manual_allowed()?;
        if let Some(pending) = &self.outstanding {
            return Err(PrealignError::InvalidState(format!(
                "{} is still awaiting completion",
                pending.label
            )));
        }
        self.serial.send(encode_raw(payload))?;
        self.await_manual(label, tag, now);
        Ok(())
    }

    /// Vision commands have no completion, so they never occupy the slot.
    fn send_vision_manual(&mut self, payload: &str) -> AppResult<()> {
        self.ensure_manual_allowed()?;
        self.vision.send(encode_raw(payload))
    }

    /// Send a clear or emergency stop, displacing any outstanding command.
    fn send_priority(&mut self, tag: CommandTag, now: Instant) -> AppResult<()> {
        let bytes = self.table.encode(tag.as_str())?;
        self.serial.send(bytes)?;
        if let Some(previous) = self.outstanding.take() {
            debug!(command = %previous.label, "Outstanding command displaced");
            self.timers.cancel(previous.timeout);
        }
        self.await_manual(tag.as_str(), Some(tag), now);
        Ok(())
    }

    fn await_manual(&mut self, label: &str, tag: Option<CommandTag>, now: Instant) {
        let timeout = self
            .timers
            .schedule(now + self.settings.command_timeout, TimerKind::CommandTimeout);
        self.outstanding = Some(Outstanding {
            label: label.to_string(),
            tag,
            origin: Origin::Manual,
            timeout,
        });
    }

    fn raise_alarm(&mut self, pending: &Outstanding, code: String, subcode: String, now: Instant) {
        let description = self.catalog.describe(&code);
        let alarm = PrealignError::DeviceAlarm {
            code: code.clone(),
            subcode: subcode.clone(),
        };
        error!(command = %pending.label, kind = %alarm.kind(), "{alarm}");
        self.note(format_alarm_report(&code, &subcode, description.as_ref()));
        self.latched = Some(LatchedAlarm {
            code: code.clone(),
            subcode: subcode.clone(),
        });
        self.sink.notify(SequenceEvent::AlarmRaised {
            code,
            subcode,
            description,
        });
        self.halt(StopReason::Alarm, now);
    }

    /// Report an error; halt the sequence if it is one that halts.
    fn fail(&mut self, err: &PrealignError, now: Instant) {
        error!(error = %err, "Sequence fault");
        self.note(err.to_string());
        self.sink.notify(SequenceEvent::Fault {
            kind: err.kind(),
            message: err.to_string(),
        });
        if err.halts_sequence() {
            self.halt(StopReason::Fault, now);
        }
    }

    /// Return to `Idle`, cancelling sequence deadlines and the sequence command.
    fn halt(&mut self, reason: StopReason, now: Instant) {
        let was_running = self.cycles.running;
        self.cycles.running = false;

        if was_running {
            self.timers.cancel_kind(TimerKind::TriggerSettle);
            self.timers.cancel_kind(TimerKind::TriggerReplyTimeout);
            self.timers.cancel_kind(TimerKind::CycleRestart);
            if self
                .outstanding
                .as_ref()
                .is_some_and(|p| p.origin == Origin::Sequence)
            {
                if let Some(pending) = self.outstanding.take() {
                    self.timers.cancel(pending.timeout);
                }
            }
            self.stopped_after = self.started.map(|s| now.saturating_duration_since(s));
        }
        self.set_step(SequenceStep::Idle);

        if was_running {
            info!(%reason, completed = self.cycles.completed_cycles, "Sequence stopped");
            self.note(format!("Sequence stopped: {reason}"));
            self.sink.notify(SequenceEvent::SequenceStopped {
                reason,
                completed_cycles: self.cycles.completed_cycles,
                total_cycles: self.cycles.total_cycles,
            });
        }
    }

    fn set_step(&mut self, step: SequenceStep) {
        if self.step != step {
            debug!(from = %self.step, to = %step, "Step change");
            self.step = step;
            self.sink.notify(SequenceEvent::StepChanged { step });
        }
    }

    fn notify_progress(&self) {
        self.sink.notify(SequenceEvent::CycleProgress {
            completed: self.cycles.completed_cycles,
            total: self.cycles.total_cycles,
        });
    }

    fn note(&self, text: String) {
        self.sink.log(LogChannel::Macro, Direction::Note, text);
    }
}
