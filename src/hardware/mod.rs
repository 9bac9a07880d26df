//! Device links and simulators.
//!
//! - [`link`]: line transports over any async stream, shared by both devices
//! - [`serial`]: opening the prealigner's RS-232 port
//! - [`vision`]: connecting to the vision system over TCP
//! - [`simulator`]: stand-ins for both devices

pub mod link;
pub mod serial;
pub mod simulator;
pub mod vision;

pub use link::{DynLink, LineTransport, LinkEvent, LinkIo, LinkKind, RecordingLink, StreamLink};
pub use serial::{available_ports, open_serial_async, Parity, SerialSettings};
pub use simulator::{Nxc100Simulator, SimulatorConfig, VisionReplyMode, VisionSimulator};
pub use vision::{connect_vision, VisionEndpoint};
