//! Simulated devices for testing without hardware.
//!
//! # Available simulators
//!
//! - [`Nxc100Simulator`]: the prealigner controller. Acknowledges `MTRS` and `MALN`
//!   immediately and completes them after a configurable delay; other table
//!   commands are acknowledged and completed at once. Alarms can be injected per
//!   command tag.
//! - [`VisionSimulator`]: the vision system. Answers every request with `T1`, a
//!   fixed reply, or nothing.
//!
//! Both serve any [`LinkIo`] stream, so tests drive them over
//! `tokio::io::duplex` and the CLI serves them over a serial port or TCP.
//! All delays use `tokio::time::sleep`, which makes them instant under a paused
//! test clock.

use super::link::LinkIo;
use crate::error::AppResult;
use crate::protocol::{split_replies, CommandTable, CommandTag, TRIGGER_ACK};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Immediate acknowledgement of `MTRS`.
pub const MTRS_ACK: &str = "@2300000000015";
/// Successful `MTRS` completion.
pub const MTRS_DONE: &str = "$23200000000MTRS5D";
/// Immediate acknowledgement of `MALN`.
pub const MALN_ACK: &str = "@2100000000013";
/// Successful `MALN` completion: 0.17 mm at 108.51 deg.
pub const MALN_DONE: &str = "$24200000000MALN001701085137";

/// Timing and behaviour of the prealigner simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Delay between the `MTRS` acknowledgement and its completion.
    pub mtrs_delay: Duration,
    /// Delay between the `MALN` acknowledgement and its completion.
    pub maln_delay: Duration,
    /// Answer commands automatically. When off, commands are only recorded.
    pub auto_reply: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            mtrs_delay: Duration::from_millis(500),
            maln_delay: Duration::from_secs(5),
            auto_reply: true,
        }
    }
}

type Injected = HashMap<CommandTag, (String, String)>;

/// Simulated NXC100 prealigner controller.
///
/// Cloning yields a handle onto the same simulator, so a test can keep one
/// clone for alarm injection and inspection while another serves the stream.
#[derive(Clone)]
pub struct Nxc100Simulator {
    config: SimulatorConfig,
    table: Arc<CommandTable>,
    injected: Arc<Mutex<Injected>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl Nxc100Simulator {
    /// Simulator answering the standard command payloads.
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_table(config, CommandTable::standard())
    }

    /// Simulator answering the payloads of `table`.
    pub fn with_table(config: SimulatorConfig, table: CommandTable) -> Self {
        Self {
            config,
            table: Arc::new(table),
            injected: Arc::new(Mutex::new(HashMap::new())),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make the next completion of `tag` report `code`/`subcode`.
    pub fn fail_next(&self, tag: CommandTag, code: &str, subcode: &str) {
        self.injected
            .lock()
            .insert(tag, (code.to_string(), subcode.to_string()));
    }

    /// Every line received so far.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    fn completion(&self, tag: CommandTag, status: &str, success_tail: &str) -> String {
        match self.injected.lock().remove(&tag) {
            Some((code, subcode)) => format!("$2{status}{code}{subcode}{tag}00"),
            None => format!("$2{status}00000000{tag}{success_tail}"),
        }
    }

    fn identify(&self, line: &str) -> Option<CommandTag> {
        CommandTag::ALL.into_iter().find(|tag| {
            self.table
                .for_tag(*tag)
                .is_ok_and(|entry| entry.payload == line)
        })
    }

    /// Serve one connection until the peer closes it.
    pub async fn serve<S: LinkIo + 'static>(&self, io: S) -> AppResult<()> {
        let (read_half, mut write_half) = tokio::io::split(io);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(reply) = rx.recv().await {
                let framed = format!("{reply}\r\n");
                if write_half.write_all(framed.as_bytes()).await.is_err() {
                    break;
                }
                let _ = write_half.flush().await;
            }
        });

        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf).trim().to_string();
            if line.is_empty() {
                continue;
            }
            debug!(%line, "Simulator received");
            self.received.lock().push(line.clone());
            if self.config.auto_reply {
                self.respond(&line, &tx);
            }
        }

        drop(tx);
        writer.abort();
        Ok(())
    }

    fn respond(&self, line: &str, tx: &mpsc::UnboundedSender<String>) {
        let Some(tag) = self.identify(line) else {
            debug!(%line, "No auto-response for command");
            return;
        };

        let (ack, delay, done) = match tag {
            CommandTag::Mtrs => (
                MTRS_ACK.to_string(),
                self.config.mtrs_delay,
                self.completion(tag, "32", "5D"),
            ),
            CommandTag::Maln => (
                MALN_ACK.to_string(),
                self.config.maln_delay,
                self.completion(tag, "42", "001701085137"),
            ),
            other => (
                "@2000000000000".to_string(),
                Duration::ZERO,
                self.completion(other, "00", "00"),
            ),
        };

        let _ = tx.send(ack);
        let tx = tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let _ = tx.send(done);
        });
    }

    /// Accept TCP clients forever, serving each in turn.
    pub async fn serve_tcp(&self, listener: TcpListener) -> AppResult<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "Simulator client connected");
            if let Err(e) = self.serve(stream).await {
                warn!(%peer, error = %e, "Simulator connection failed");
            }
        }
    }
}

impl Default for Nxc100Simulator {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

/// How the vision simulator answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisionReplyMode {
    /// Reply `T1` to everything.
    Acknowledge,
    /// Reply a fixed string.
    Fixed(String),
    /// Never reply.
    Silent,
}

/// Simulated vision system.
#[derive(Clone)]
pub struct VisionSimulator {
    mode: Arc<Mutex<VisionReplyMode>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl VisionSimulator {
    /// Simulator in the given reply mode.
    pub fn new(mode: VisionReplyMode) -> Self {
        Self {
            mode: Arc::new(Mutex::new(mode)),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Change the reply mode for subsequent requests.
    pub fn set_mode(&self, mode: VisionReplyMode) {
        *self.mode.lock() = mode;
    }

    /// Every request received so far.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Serve one connection until the peer closes it.
    pub async fn serve<S: LinkIo + 'static>(&self, mut io: S) -> AppResult<()> {
        let mut buf = [0u8; 1024];
        loop {
            let n = io.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
            for request in split_replies(&chunk) {
                self.received.lock().push(request.clone());
                let reply = match &*self.mode.lock() {
                    VisionReplyMode::Acknowledge => Some(TRIGGER_ACK.to_string()),
                    VisionReplyMode::Fixed(text) => Some(text.clone()),
                    VisionReplyMode::Silent => None,
                };
                if let Some(reply) = reply {
                    io.write_all(format!("{reply}\r").as_bytes()).await?;
                    io.flush().await?;
                }
            }
        }
    }

    /// Accept TCP clients forever, serving each in turn.
    pub async fn serve_tcp(&self, listener: TcpListener) -> AppResult<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "Vision client connected");
            if let Err(e) = self.serve(stream).await {
                warn!(%peer, error = %e, "Vision connection failed");
            }
        }
    }
}

impl Default for VisionSimulator {
    fn default() -> Self {
        Self::new(VisionReplyMode::Acknowledge)
    }
}
