//! CLI entry point for the prealigner controller.
//!
//! Provides:
//! - `run`: execute alignment cycles against the real devices or in-process simulators
//! - `send` / `raw`: manual serial commands, waiting for the completion
//! - `trigger`: manual vision commands
//! - `simulate`: serve the device simulators on a serial port or TCP listeners
//! - `ports`: list serial ports
//! - `alarm`: print the operator report for an alarm code
//!
//! # Usage
//!
//! ```bash
//! prealigner --config config/prealigner.toml run --cycles 5
//! prealigner run --simulated --cycles 2
//! prealigner send ChuckHold
//! prealigner simulate --listen 127.0.0.1:7000 --vision-listen 127.0.0.1:7001
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prealigner::alarms::format_alarm_report;
use prealigner::hardware::{
    available_ports, open_serial_async, Nxc100Simulator, SerialSettings, SimulatorConfig,
    VisionReplyMode, VisionSimulator,
};
use prealigner::notify::{Direction, LogEntry};
use prealigner::prelude::*;
use prealigner::tracing_init;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 256;
const STATUS_POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "prealigner")]
#[command(about = "Wafer prealigner and vision trigger sequencer", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = prealigner::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overriding [serial] port
    #[arg(long, global = true)]
    port: Option<String>,

    /// Vision host, overriding [vision] host
    #[arg(long, global = true)]
    vision_host: Option<String>,

    /// Vision TCP port, overriding [vision] port
    #[arg(long, global = true)]
    vision_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run alignment cycles
    Run {
        /// Number of cycles (default from [sequence] default_cycles)
        #[arg(long)]
        cycles: Option<u32>,

        /// Use in-process device simulators instead of real links
        #[arg(long)]
        simulated: bool,

        /// Print every event as a JSON line instead of the operator log
        #[arg(long)]
        json: bool,
    },

    /// Send a named command (MTRS, MALN, ChuckHold, HRST, CCLR, ...)
    Send {
        /// Symbolic command name
        name: String,
    },

    /// Send raw text on the serial link
    Raw {
        /// Text, sent verbatim with CR LF appended
        text: String,
    },

    /// Send a vision command (T1, T2, PrevCamera, NextCamera) or raw text
    Trigger {
        /// Command name or raw text
        #[arg(default_value = "T1")]
        command: String,
    },

    /// Serve the device simulators
    Simulate {
        /// Serial port to answer on
        #[arg(long)]
        serial: Option<String>,

        /// TCP address for the prealigner simulator
        #[arg(long)]
        listen: Option<String>,

        /// TCP address for the vision simulator
        #[arg(long)]
        vision_listen: Option<String>,
    },

    /// List serial ports
    Ports,

    /// Describe an alarm code
    Alarm {
        /// Alarm code, e.g. 0005
        code: String,

        /// Alarm subcode
        #[arg(default_value = "0000")]
        subcode: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PrealignerConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.serial.port = Some(port);
    }
    if let Some(host) = cli.vision_host {
        config.vision.host = Some(host);
    }
    if let Some(port) = cli.vision_port {
        config.vision.port = port;
    }
    config.validate().context("invalid configuration")?;
    tracing_init::init_from_config(&config).context("initializing tracing")?;

    match cli.command {
        Commands::Run {
            cycles,
            simulated,
            json,
        } => {
            let cycles = cycles.unwrap_or(config.sequence.default_cycles);
            run_cycles(&config, cycles, simulated, json).await
        }
        Commands::Send { name } => send_serial(&config, SerialRequest::Named(name)).await,
        Commands::Raw { text } => send_serial(&config, SerialRequest::Raw(text)).await,
        Commands::Trigger { command } => send_vision(&config, &command).await,
        Commands::Simulate {
            serial,
            listen,
            vision_listen,
        } => simulate(&config, serial, listen, vision_listen).await,
        Commands::Ports => list_ports(),
        Commands::Alarm { code, subcode } => describe_alarm(&config, &code, &subcode),
    }
}

struct Session {
    handle: SequenceHandle,
    events: broadcast::Receiver<SequenceEvent>,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_session(config: &PrealignerConfig) -> Result<Session> {
    let broadcast = BroadcastSink::new(EVENT_CAPACITY);
    let events = broadcast.subscribe();
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(Arc::new(broadcast));

    let actor = SequenceActor::new(
        Arc::new(sink),
        config.alarm_catalog().context("loading alarm catalog")?,
        config.command_table()?,
        config.controller_settings(),
    );
    let (handle, task) = actor.spawn();
    Ok(Session {
        handle,
        events,
        task,
    })
}

async fn connect_serial(config: &PrealignerConfig, handle: &SequenceHandle) -> Result<()> {
    let Some(settings) = config.serial.settings() else {
        bail!("no serial port configured (set [serial] port or pass --port)");
    };
    handle
        .connect_serial(&settings)
        .await
        .with_context(|| format!("opening serial port {}", settings.port))
}

async fn connect_vision(config: &PrealignerConfig, handle: &SequenceHandle) -> Result<()> {
    let Some(endpoint) = config.vision.endpoint() else {
        bail!("no vision host configured (set [vision] host or pass --vision-host)");
    };
    handle
        .connect_vision(&endpoint)
        .await
        .with_context(|| format!("connecting to vision system at {}", endpoint.address()))
}

/// Attach in-process simulators over in-memory pipes.
async fn attach_simulators(config: &PrealignerConfig, handle: &SequenceHandle) -> Result<()> {
    let table = config.command_table()?;
    let device = Nxc100Simulator::with_table(SimulatorConfig::default(), table);
    let (ours, theirs) = tokio::io::duplex(1024);
    tokio::spawn(async move { device.serve(theirs).await });
    handle
        .attach(LinkKind::Serial, Box::new(ours), "simulator")
        .await?;

    let vision = VisionSimulator::new(VisionReplyMode::Acknowledge);
    let (ours, theirs) = tokio::io::duplex(1024);
    tokio::spawn(async move { vision.serve(theirs).await });
    handle
        .attach(LinkKind::Vision, Box::new(ours), "vision simulator")
        .await?;
    Ok(())
}

fn print_log(entry: &LogEntry) {
    println!("{entry}");
}

fn print_json(event: &SequenceEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event).context("encoding event")?);
    Ok(())
}

async fn run_cycles(
    config: &PrealignerConfig,
    cycles: u32,
    simulated: bool,
    json: bool,
) -> Result<()> {
    let Session {
        handle,
        mut events,
        task,
    } = spawn_session(config)?;

    if simulated {
        attach_simulators(config, &handle).await?;
    } else {
        connect_serial(config, &handle).await?;
        connect_vision(config, &handle).await?;
    }

    handle
        .start(cycles)
        .await
        .context("starting sequence")?;
    info!(cycles, "Sequence running, Ctrl+C to stop");

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if json {
                        print_json(&event)?;
                    } else if let SequenceEvent::Log(entry) = &event {
                        print_log(entry);
                    }
                    if let SequenceEvent::SequenceStopped { reason, completed_cycles, total_cycles } = event {
                        break (reason, completed_cycles, total_cycles);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event display fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => bail!("controller stopped unexpectedly"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping sequence");
                handle.stop().await?;
            }
        }
    };

    let status = handle.status().await?;
    let (reason, completed, total) = outcome;
    println!("Sequence stopped ({reason}): {completed}/{total} cycles");
    if let Some(elapsed) = status.elapsed {
        println!("Elapsed: {:.1}s", elapsed.as_secs_f64());
    }
    if let Some(offset) = status.last_offset {
        println!("Last offset: {offset}");
    }

    handle.shutdown().await?;
    task.await.context("controller task panicked")?;

    match reason {
        StopReason::Completed | StopReason::Requested => Ok(()),
        other => bail!("sequence ended with {other}"),
    }
}

enum SerialRequest {
    Named(String),
    Raw(String),
}

async fn send_serial(config: &PrealignerConfig, request: SerialRequest) -> Result<()> {
    let Session {
        handle,
        mut events,
        task,
    } = spawn_session(config)?;

    let table = config.command_table()?;
    let vision_command = match &request {
        SerialRequest::Named(name) => table.entry(name)?.link == LinkKind::Vision,
        SerialRequest::Raw(_) => false,
    };
    if vision_command {
        connect_vision(config, &handle).await?;
    } else {
        connect_serial(config, &handle).await?;
    }

    match &request {
        SerialRequest::Named(name) => handle.send_command(name).await?,
        SerialRequest::Raw(text) => handle.send_raw(LinkKind::Serial, text).await?,
    }

    // Wait for the completion (or the command timeout) to free the slot.
    let limit = Duration::from_millis(config.sequence.command_timeout_ms) + Duration::from_secs(1);
    let waited = tokio::time::timeout(limit, async {
        loop {
            while let Ok(event) = events.try_recv() {
                if let SequenceEvent::Log(entry) = event {
                    print_log(&entry);
                }
            }
            match handle.status().await {
                Ok(status) if status.command_outstanding => {
                    tokio::time::sleep(STATUS_POLL).await
                }
                Ok(status) => break Ok(status),
                Err(e) => break Err(e),
            }
        }
    })
    .await
    .context("no completion within the command timeout")??;

    while let Ok(event) = events.try_recv() {
        if let SequenceEvent::Log(entry) = event {
            print_log(&entry);
        }
    }

    handle.shutdown().await?;
    task.await.context("controller task panicked")?;

    if let Some(alarm) = waited.latched_alarm {
        bail!("device alarm {} (subcode {})", alarm.code, alarm.subcode);
    }
    Ok(())
}

async fn send_vision(config: &PrealignerConfig, command: &str) -> Result<()> {
    let Session {
        handle,
        mut events,
        task,
    } = spawn_session(config)?;
    connect_vision(config, &handle).await?;

    let table = config.command_table()?;
    match table.entry(command) {
        Ok(entry) if entry.link == LinkKind::Vision => handle.send_command(command).await?,
        _ => handle.send_raw(LinkKind::Vision, command).await?,
    }

    let reply_timeout = Duration::from_millis(config.vision.reply_timeout_ms);
    let reply = tokio::time::timeout(reply_timeout, async {
        loop {
            match events.recv().await {
                Ok(SequenceEvent::Log(entry)) => {
                    print_log(&entry);
                    if entry.direction == Direction::Received {
                        return true;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;
    if !matches!(reply, Ok(true)) {
        warn!("No vision reply within {} ms", reply_timeout.as_millis());
    }

    handle.shutdown().await?;
    task.await.context("controller task panicked")?;
    Ok(())
}

async fn simulate(
    config: &PrealignerConfig,
    serial: Option<String>,
    listen: Option<String>,
    vision_listen: Option<String>,
) -> Result<()> {
    if serial.is_none() && listen.is_none() && vision_listen.is_none() {
        bail!("nothing to serve: pass --serial, --listen or --vision-listen");
    }

    let device = Nxc100Simulator::with_table(SimulatorConfig::default(), config.command_table()?);
    let mut tasks = tokio::task::JoinSet::new();

    if let Some(port) = serial {
        let settings = SerialSettings {
            port: port.clone(),
            ..config
                .serial
                .settings()
                .unwrap_or_else(|| SerialSettings::new(port.clone()))
        };
        let stream = open_serial_async(&settings)
            .await
            .with_context(|| format!("opening serial port {port}"))?;
        info!(%port, "Prealigner simulator on serial port");
        let device = device.clone();
        tasks.spawn(async move { device.serve(stream).await });
    }

    if let Some(addr) = listen {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!(%addr, "Prealigner simulator listening");
        let device = device.clone();
        tasks.spawn(async move { device.serve_tcp(listener).await });
    }

    if let Some(addr) = vision_listen {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!(%addr, "Vision simulator listening");
        let vision = VisionSimulator::new(VisionReplyMode::Acknowledge);
        tasks.spawn(async move { vision.serve_tcp(listener).await });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Simulator shutting down"),
        Some(result) = tasks.join_next() => {
            result.context("simulator task panicked")??;
        }
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = available_ports().context("listing serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn describe_alarm(config: &PrealignerConfig, code: &str, subcode: &str) -> Result<()> {
    let catalog = config.alarm_catalog().context("loading alarm catalog")?;
    let description = catalog.describe(code);
    println!("{}", format_alarm_report(code, subcode, description.as_ref()));
    Ok(())
}

