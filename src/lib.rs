//! # Prealigner
//!
//! Protocol engine and alignment-cycle sequencer for an NXC100-style wafer
//! prealigner driven over RS-232, paired with a vision system triggered over
//! TCP. One alignment cycle is:
//!
//! ```text
//! MTRS (move to ready) -> MALN (align) -> 3 s settle -> T1 (vision trigger)
//! ```
//!
//! repeated for the requested number of cycles. The device reports every
//! command twice: an `@` acknowledgement, then a `$` completion carrying the
//! alarm fields and (for MALN) the measured wafer offset.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: command table, response frame decoding, outcome
//!   classification and vision reply interpretation. Pure, no I/O.
//! - **`sequence`**: the cycle state machine ([`sequence::SequenceController`]),
//!   its deadline queue, and the actor that owns it.
//! - **`hardware`**: line transports over serial ports, TCP sockets or any
//!   async stream, plus simulators for both devices.
//! - **`messages`**: commands accepted by the sequence actor.
//! - **`notify`**: events and operator log lines reported by the core.
//! - **`alarms`**: alarm descriptions and the operator alarm report.
//! - **`config`**: Figment configuration (TOML + `PREALIGNER_` environment).
//! - **`tracing_init`**: tracing subscriber setup.
//! - **`error`**: [`error::PrealignError`] and [`error::AppResult`].
//!
//! ## Example
//!
//! ```no_run
//! use prealigner::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> AppResult<()> {
//! let config = PrealignerConfig::load()?;
//! let actor = SequenceActor::new(
//!     Arc::new(TracingSink),
//!     config.alarm_catalog()?,
//!     config.command_table()?,
//!     config.controller_settings(),
//! );
//! let (handle, _task) = actor.spawn();
//! handle.connect_serial(&SerialSettings::new("/dev/ttyUSB0")).await?;
//! handle.connect_vision(&VisionEndpoint::new("192.168.0.1", 80)).await?;
//! handle.start(config.sequence.default_cycles).await?;
//! # Ok(())
//! # }
//! ```

pub mod alarms;
pub mod config;
pub mod error;
pub mod hardware;
pub mod messages;
pub mod notify;
pub mod protocol;
pub mod sequence;
pub mod tracing_init;

/// Commonly used types.
pub mod prelude {
    pub use crate::alarms::{AlarmCatalog, AlarmDescription, EmptyCatalog, TableCatalog};
    pub use crate::config::PrealignerConfig;
    pub use crate::error::{AppResult, ErrorKind, PrealignError};
    pub use crate::hardware::{LinkKind, SerialSettings, VisionEndpoint};
    pub use crate::notify::{
        BroadcastSink, FanoutSink, NotificationSink, SequenceEvent, TracingSink,
    };
    pub use crate::protocol::{CommandTable, CommandTag, ReplyTimeoutPolicy};
    pub use crate::sequence::{
        ControllerSettings, SequenceActor, SequenceHandle, SequenceStatus, SequenceStep,
        StopReason,
    };
}
