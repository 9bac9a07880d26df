//! Structured notifications from the core to its collaborators.
//!
//! The sequence controller and the links never talk to a UI directly. They emit
//! [`SequenceEvent`]s into a [`NotificationSink`] injected at construction time.
//! Several sinks are provided:
//!
//! - [`BroadcastSink`]: fan out to any number of `tokio::sync::broadcast` receivers
//! - [`TracingSink`]: write every event to the `tracing` subscriber
//! - [`FanoutSink`]: forward to several sinks
//! - [`RecordingSink`]: keep events in memory (tests, embedding)

use crate::alarms::AlarmDescription;
use crate::error::ErrorKind;
use crate::hardware::LinkKind;
use crate::sequence::{SequenceStep, StopReason};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Source of an operator log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    /// Prealigner serial link
    Serial,
    /// Vision TCP link
    Vision,
    /// Sequence controller
    Macro,
}

impl From<LinkKind> for LogChannel {
    fn from(kind: LinkKind) -> Self {
        match kind {
            LinkKind::Serial => LogChannel::Serial,
            LinkKind::Vision => LogChannel::Vision,
        }
    }
}

impl std::fmt::Display for LogChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogChannel::Serial => write!(f, "Serial"),
            LogChannel::Vision => write!(f, "TCP"),
            LogChannel::Macro => write!(f, "Macro"),
        }
    }
}

/// Direction of an operator log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Bytes written to a link
    Sent,
    /// Line read from a link
    Received,
    /// Controller commentary
    Note,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Sent => write!(f, "Sent"),
            Direction::Received => write!(f, "Received"),
            Direction::Note => write!(f, "Note"),
        }
    }
}

/// One timestamped operator log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Local wall-clock time of the entry.
    pub timestamp: DateTime<Local>,
    /// Where it came from.
    pub channel: LogChannel,
    /// Sent, received or note.
    pub direction: Direction,
    /// Payload or message.
    pub text: String,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(channel: LogChannel, direction: Direction, text: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            channel,
            direction,
            text: text.into(),
        }
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.channel,
            self.direction,
            self.text
        )
    }
}

/// Everything the core reports outward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequenceEvent {
    /// A sequence started.
    SequenceStarted {
        /// Requested number of cycles.
        total_cycles: u32,
    },
    /// The sequence is no longer running.
    SequenceStopped {
        /// Why it stopped.
        reason: StopReason,
        /// Cycles completed at the time of stopping.
        completed_cycles: u32,
        /// Requested number of cycles.
        total_cycles: u32,
    },
    /// The active pipeline step changed.
    StepChanged {
        /// New step.
        step: SequenceStep,
    },
    /// A cycle finished (or the counter was reset).
    CycleProgress {
        /// Completed cycles.
        completed: u32,
        /// Requested cycles.
        total: u32,
    },
    /// MALN reported the wafer offset.
    OffsetMeasured {
        /// Radial offset in millimetres.
        distance_mm: f64,
        /// Angular offset in degrees.
        angle_deg: f64,
    },
    /// The device reported an alarm; it stays latched until cleared.
    AlarmRaised {
        /// Alarm code.
        code: String,
        /// Alarm subcode.
        subcode: String,
        /// Catalog description, when known.
        description: Option<AlarmDescription>,
    },
    /// The latched alarm was cleared.
    AlarmCleared,
    /// A protocol or transport failure.
    Fault {
        /// Error category.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
    /// No trigger reply arrived within the reply timeout.
    TriggerTimedOut {
        /// Whether the cycle was counted anyway.
        counted_as_acknowledged: bool,
    },
    /// An emergency stop was issued; the operator must confirm before clearing.
    EmergencyStopRequested,
    /// Operator log line.
    Log(LogEntry),
    /// A link opened or closed.
    ConnectionStatus {
        /// Which link.
        link: LinkKind,
        /// New state.
        connected: bool,
    },
}

/// Receiver of core events.
///
/// Implementations must not block: events are delivered from the controller's
/// own task and from the link reader tasks.
pub trait NotificationSink: Send + Sync {
    /// Deliver one event.
    fn notify(&self, event: SequenceEvent);

    /// Convenience wrapper for an operator log line.
    fn log(&self, channel: LogChannel, direction: Direction, text: String) {
        self.notify(SequenceEvent::Log(LogEntry::new(channel, direction, text)));
    }
}

/// Sink backed by a broadcast channel.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SequenceEvent>,
}

impl BroadcastSink {
    /// Create a sink whose receivers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver for subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, event: SequenceEvent) {
        // No receivers is fine: nobody is watching.
        let _ = self.tx.send(event);
    }
}

/// Sink that writes events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: SequenceEvent) {
        match event {
            SequenceEvent::Log(entry) => debug!(channel = %entry.channel, direction = %entry.direction, "{}", entry.text),
            SequenceEvent::AlarmRaised { code, subcode, .. } => {
                error!(%code, %subcode, "Device alarm raised")
            }
            SequenceEvent::Fault { kind, message } => error!(%kind, "{}", message),
            SequenceEvent::TriggerTimedOut {
                counted_as_acknowledged,
            } => warn!(counted_as_acknowledged, "Vision trigger reply timed out"),
            SequenceEvent::EmergencyStopRequested => warn!("Emergency stop issued"),
            other => info!(event = ?other, "Sequence event"),
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    /// Empty fanout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, event: SequenceEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.notify(event.clone());
            }
            last.notify(event);
        }
    }
}

/// Sink that records events in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SequenceEvent>>,
}

impl RecordingSink {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<SequenceEvent> {
        self.events.lock().clone()
    }

    /// Drain recorded events.
    pub fn take(&self) -> Vec<SequenceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&SequenceEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Recorded events excluding operator log lines.
    pub fn non_log_events(&self) -> Vec<SequenceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| !matches!(e, SequenceEvent::Log(_)))
            .cloned()
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: SequenceEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_formats_like_the_operator_log() {
        let entry = LogEntry::new(LogChannel::Serial, Direction::Sent, "$2MTRSG100ALDD");
        let text = entry.to_string();
        assert!(text.ends_with(" Serial Sent $2MTRSG100ALDD"), "{text}");
        assert_eq!(text.len(), "2024-01-01 00:00:00".len() + " Serial Sent $2MTRSG100ALDD".len());
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.notify(SequenceEvent::CycleProgress {
            completed: 1,
            total: 3,
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            SequenceEvent::CycleProgress {
                completed: 1,
                total: 3
            }
        );
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());
        fanout.notify(SequenceEvent::AlarmCleared);
        assert_eq!(a.events(), vec![SequenceEvent::AlarmCleared]);
        assert_eq!(b.events(), vec![SequenceEvent::AlarmCleared]);
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(SequenceEvent::ConnectionStatus {
            link: LinkKind::Serial,
            connected: true,
        })
        .unwrap();
        assert_eq!(json["event"], "connection_status");
        assert_eq!(json["connected"], true);
    }
}
